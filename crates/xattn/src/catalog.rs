//! The catalog of compiled kernel variants.
//!
//! Entries are produced by an external build step and never mutated. A generated crate
//! contributes its table to [`LINKED_KERNELS`]; tools and tests can also build a catalog
//! from a slice or from a manifest directory (see [`crate::manifest`]).

use std::fmt;
use std::sync::Arc;

use crate::dtype::{DataType, SmVersion};
use crate::key::VariantKey;

/// Stable identity of one binary image. Entries sharing an image share one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(pub u32);

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "image#{}", self.0)
    }
}

#[derive(Clone, Copy)]
pub struct KernelImage {
    pub id: ImageId,
    pub bytes: &'static [u8],
}

impl fmt::Debug for KernelImage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelImage")
            .field("id", &self.id)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// One compiled kernel variant.
#[derive(Debug, Clone, Copy)]
pub struct KernelMeta {
    pub arch: SmVersion,
    pub data_type: DataType,
    pub kv_cache_data_type: DataType,
    pub head_dim: u32,
    pub beam_width: u32,
    /// Query heads per KV head; 0 accepts any power of two.
    pub heads_per_kv: u32,
    pub m_tile_size: u32,
    pub tokens_per_page: u32,
    pub paged_kv_cache: bool,
    pub multi_query_tokens: bool,
    pub symbol: &'static str,
    /// `None` when the configuration is served outside the precompiled path.
    pub image: Option<KernelImage>,
}

impl KernelMeta {
    pub fn variant_key(&self) -> VariantKey {
        VariantKey {
            kv_cache_data_type: self.kv_cache_data_type,
            head_dim: self.head_dim,
            beam_width: self.beam_width,
            heads_per_kv: self.heads_per_kv,
            m_tile_size: self.m_tile_size,
            tokens_per_page: self.tokens_per_page,
            paged_kv_cache: self.paged_kv_cache,
            multi_query_tokens: self.multi_query_tokens,
        }
    }
}

/// Kernel tables contributed by generated crates at link time.
#[linkme::distributed_slice]
pub static LINKED_KERNELS: [&'static [KernelMeta]] = [..];

/// Shared, immutable list of kernel entries.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: Arc<[KernelMeta]>,
}

impl Catalog {
    pub fn new(entries: Vec<KernelMeta>) -> Self {
        Self { entries: entries.into() }
    }

    pub fn from_static(entries: &'static [KernelMeta]) -> Self {
        Self { entries: entries.into() }
    }

    /// Every table in [`LINKED_KERNELS`], concatenated.
    pub fn linked() -> Self {
        Self::from_tables(&LINKED_KERNELS)
    }

    /// Concatenate tables that each number their images from zero.
    ///
    /// Image ids are shifted past the previous tables' ids so that entries of different
    /// tables never share a module.
    pub fn from_tables(tables: &[&'static [KernelMeta]]) -> Self {
        let mut entries = Vec::with_capacity(tables.iter().map(|t| t.len()).sum());
        let mut base = 0u32;
        for table in tables {
            let mut next = base;
            for meta in table.iter() {
                let mut meta = *meta;
                if let Some(image) = meta.image.as_mut() {
                    image.id = ImageId(base + image.id.0);
                    next = next.max(image.id.0 + 1);
                }
                entries.push(meta);
            }
            base = next;
        }
        Self::new(entries)
    }

    pub fn entries(&self) -> &[KernelMeta] {
        &self.entries
    }

    pub fn get(&self, index: usize) -> Option<&KernelMeta> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries built for `(data_type, arch)`, with their catalog index.
    pub fn matching(
        &self,
        data_type: DataType,
        arch: SmVersion,
    ) -> impl Iterator<Item = (usize, &KernelMeta)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(move |(_, m)| m.data_type == data_type && m.arch == arch)
    }
}
