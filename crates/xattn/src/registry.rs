//! Kernel registry: the loaded, resolved kernels of one (data type, architecture) pair.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use xattn_driver::{Driver, FunctionHandle, ModuleHandle, StreamHandle};

use crate::catalog::{Catalog, ImageId, KernelImage, KernelMeta};
use crate::config::DispatchConfig;
use crate::convert::{self, OutputConverter};
use crate::dtype::{DataType, SmVersion};
use crate::error::DispatchError;
use crate::heuristics;
use crate::key::VariantKey;
use crate::kv_cache::KvCacheBuffer;
use crate::launch;
use crate::preprocess::{self, DevicePreprocessor};
use crate::request::AttentionRequest;
use crate::workspace::LaunchParams;
use crate::Result;

/// Module global holding the kernel's dynamic shared memory size in bytes.
pub const SMEM_SIZE_SYMBOL: &str = "smemSize";
/// Module global tagging the kernel family.
pub const KERNEL_TYPE_SYMBOL: &str = "kernelType";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum KernelFamily {
    /// Architecture-generic warp-specialized kernels.
    #[default]
    WarpSpecialized,
    /// sm_90 kernels using TMA and warpgroup MMA.
    HopperWarpSpecialized,
}

impl KernelFamily {
    fn from_tag(tag: u32) -> Result<Self> {
        match tag {
            0 => Ok(KernelFamily::WarpSpecialized),
            1 => Ok(KernelFamily::HopperWarpSpecialized),
            other => Err(DispatchError::Invariant(format!("unknown kernel family tag {}", other))),
        }
    }
}

/// How a resolved kernel is launched, fixed at load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaunchStrategy {
    /// One query token per sequence. `tensor_map` kernels take a TMA descriptor.
    Decode { tensor_map: bool },
    /// Several query tokens per sequence.
    Speculative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionInfo {
    pub meta_index: usize,
    pub shared_mem_bytes: u32,
    pub function: FunctionHandle,
    pub family: KernelFamily,
    pub strategy: LaunchStrategy,
}

/// Collaborators and device facts a launch needs besides the request.
pub struct RunContext<'a> {
    pub preprocessor: &'a dyn DevicePreprocessor,
    pub converter: &'a dyn OutputConverter,
    pub multiprocessor_count: u32,
    pub stream: StreamHandle,
}

pub struct KernelRegistry {
    driver: Arc<dyn Driver>,
    catalog: Catalog,
    data_type: DataType,
    arch: SmVersion,
    config: Arc<DispatchConfig>,
    modules: HashMap<ImageId, (ModuleHandle, &'static [u8])>,
    functions: HashMap<VariantKey, FunctionInfo>,
}

impl KernelRegistry {
    pub fn new(
        driver: Arc<dyn Driver>,
        catalog: Catalog,
        data_type: DataType,
        arch: SmVersion,
        config: Arc<DispatchConfig>,
    ) -> Self {
        Self {
            driver,
            catalog,
            data_type,
            arch,
            config,
            modules: HashMap::new(),
            functions: HashMap::new(),
        }
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn arch(&self) -> SmVersion {
        self.arch
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Load every catalog entry of this registry's (data type, arch). No-op once loaded.
    ///
    /// A driver error aborts the load; the caller should drop the registry.
    pub fn load(&mut self) -> Result<()> {
        if !self.functions.is_empty() {
            return Ok(());
        }
        let catalog = self.catalog.clone();
        let mut skipped = 0usize;
        for (index, meta) in catalog.matching(self.data_type, self.arch) {
            let Some(image) = meta.image else {
                tracing::trace!("Skipping {} ({}): no precompiled image", meta.symbol, meta.variant_key());
                skipped += 1;
                continue;
            };

            let key = meta.variant_key();
            if let Some(first) = self.functions.get(&key) {
                tracing::warn!(
                    "Ignoring {} for {}: already served by {}",
                    meta.symbol,
                    key,
                    self.catalog.get(first.meta_index).map_or("?", |m| m.symbol)
                );
                continue;
            }

            let module = self.module_for(image)?;
            let info = self.resolve(index, meta, module)?;
            tracing::trace!(
                "Resolved {} for {} ({} bytes smem, {:?})",
                meta.symbol,
                key,
                info.shared_mem_bytes,
                info.family
            );
            self.functions.insert(key, info);
        }

        tracing::info!(
            "Loaded {} precompiled attention kernels for {} on {} ({} modules, {} excluded)",
            self.functions.len(),
            self.data_type,
            self.arch,
            self.modules.len(),
            skipped
        );
        Ok(())
    }

    fn module_for(&mut self, image: KernelImage) -> Result<ModuleHandle> {
        match self.modules.entry(image.id) {
            Entry::Occupied(loaded) => {
                let (module, bytes) = *loaded.get();
                if bytes != image.bytes {
                    return Err(DispatchError::Invariant(format!(
                        "{} names two different images ({} and {} bytes)",
                        image.id,
                        bytes.len(),
                        image.bytes.len()
                    )));
                }
                Ok(module)
            }
            Entry::Vacant(slot) => {
                let module = self.driver.load_module(image.bytes)?;
                slot.insert((module, image.bytes));
                Ok(module)
            }
        }
    }

    fn resolve(&self, meta_index: usize, meta: &KernelMeta, module: ModuleHandle) -> Result<FunctionInfo> {
        let function = self.driver.get_function(module, meta.symbol)?;

        let shared_mem_bytes = match self.read_u32(module, SMEM_SIZE_SYMBOL)? {
            Some(bytes) => bytes,
            None => {
                tracing::warn!("{} has no {} global, assuming 0 bytes", meta.symbol, SMEM_SIZE_SYMBOL);
                0
            }
        };
        let family = match self.read_u32(module, KERNEL_TYPE_SYMBOL)? {
            Some(tag) => KernelFamily::from_tag(tag)?,
            None => KernelFamily::default(),
        };

        // The default 48 KiB dynamic smem cap also covers static and driver-reserved smem.
        if shared_mem_bytes >= self.config.large_smem_threshold {
            self.driver.set_max_dynamic_shared_mem(function, shared_mem_bytes)?;
        }

        let strategy = if meta.multi_query_tokens {
            LaunchStrategy::Speculative
        } else {
            LaunchStrategy::Decode { tensor_map: family == KernelFamily::HopperWarpSpecialized }
        };

        Ok(FunctionInfo { meta_index, shared_mem_bytes, function, family, strategy })
    }

    fn read_u32(&self, module: ModuleHandle, symbol: &str) -> Result<Option<u32>> {
        let Some(bytes) = self.driver.read_global(module, symbol)? else {
            return Ok(None);
        };
        if bytes.len() < std::mem::size_of::<u32>() {
            return Err(DispatchError::Invariant(format!(
                "module global {} is {} bytes, expected at least 4",
                symbol,
                bytes.len()
            )));
        }
        Ok(Some(bytemuck::pod_read_unaligned::<u32>(&bytes[..4])))
    }

    /// Whether a loaded kernel serves `request`.
    pub fn support_config(&self, request: &AttentionRequest) -> Result<bool> {
        let key = VariantKey::for_request(request)?;
        Ok(self.functions.contains_key(&key))
    }

    /// Occupancy gate, see [`heuristics::may_have_perf_gain`].
    pub fn may_have_perf_gain(&self, request: &AttentionRequest, multiprocessor_count: u32) -> bool {
        heuristics::may_have_perf_gain(request, multiprocessor_count, &self.config)
    }

    pub fn lookup(&self, key: &VariantKey) -> Option<&FunctionInfo> {
        self.functions.get(key)
    }

    pub fn meta(&self, info: &FunctionInfo) -> Option<&KernelMeta> {
        self.catalog.get(info.meta_index)
    }

    pub fn function_map(&self) -> &HashMap<VariantKey, FunctionInfo> {
        &self.functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    pub fn module_count(&self) -> usize {
        self.modules.len()
    }

    /// Preprocess, launch and (optionally) convert for one request, all on `ctx.stream`.
    pub fn run<B: KvCacheBuffer>(
        &self,
        request: &AttentionRequest,
        kv_cache: &B,
        ctx: &RunContext<'_>,
    ) -> Result<()> {
        request.validate()?;
        kv_cache.check_request(request)?;
        convert::check_converter(ctx.converter, request)?;

        let key = VariantKey::for_request(request)?;
        let info = *self.lookup(&key).ok_or(DispatchError::KernelNotFound(key))?;

        let max_blocks = self
            .config
            .max_blocks_per_sequence
            .max(self.config.blocks_per_sequence.unwrap_or(1));
        let params = LaunchParams::build(request, kv_cache, self.data_type.element_size(), max_blocks)?;

        preprocess::run_preprocessing(
            self.driver.as_ref(),
            ctx.preprocessor,
            request,
            &params,
            kv_cache.view(),
            ctx.multiprocessor_count,
            ctx.stream,
        )?;

        let multi_block = heuristics::multi_block_count(request, ctx.multiprocessor_count, &self.config);
        tracing::debug!("Launching {:?} kernel for {} with {} blocks per sequence", info.strategy, key, multi_block);

        match info.strategy {
            LaunchStrategy::Decode { tensor_map } => launch::launch_decode(
                self.driver.as_ref(),
                &info,
                self.arch,
                request,
                &params,
                tensor_map.then(|| kv_cache.view()),
                kv_cache.pool(),
                multi_block,
                ctx.stream,
            )?,
            LaunchStrategy::Speculative => launch::launch_speculative(
                self.driver.as_ref(),
                &info,
                request,
                &params,
                multi_block,
                ctx.stream,
            )?,
        }

        self.driver.check_stream(ctx.stream)?;
        if self.config.sync_after_launch {
            self.driver.stream_synchronize(ctx.stream)?;
        }

        if request.needs_output_conversion() {
            convert::convert_output(
                self.driver.as_ref(),
                ctx.converter,
                request,
                &params,
                self.data_type,
                ctx.stream,
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for KernelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelRegistry")
            .field("data_type", &self.data_type)
            .field("arch", &self.arch)
            .field("modules", &self.modules.len())
            .field("functions", &self.functions.len())
            .finish()
    }
}
