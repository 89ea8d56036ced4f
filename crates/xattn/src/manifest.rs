//! Catalogs shipped as a directory: `catalog.json` plus the binary images it references.
//!
//! ```json
//! { "kernels": [
//!     { "arch": 90, "data_type": "fp16", "kv_cache_data_type": "e4m3",
//!       "head_dim": 128, "beam_width": 1, "heads_per_kv": 8, "m_tile_size": 8,
//!       "tokens_per_page": 64, "paged_kv_cache": true, "multi_query_tokens": false,
//!       "symbol": "kernel_mha", "image": "mha_sm90.cubin" } ] }
//! ```
//!
//! Image paths are relative to the manifest directory. `"image": null` declares an excluded
//! entry. Catalog data lives for the rest of the process, so images and symbols are leaked.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::catalog::{Catalog, ImageId, KernelImage, KernelMeta};
use crate::dtype::{DataType, SmVersion};
use crate::error::DispatchError;
use crate::Result;

pub const MANIFEST_FILE: &str = "catalog.json";

#[derive(Debug, Deserialize)]
struct Manifest {
    kernels: Vec<ManifestEntry>,
}

#[derive(Debug, Deserialize)]
struct ManifestEntry {
    arch: SmVersion,
    data_type: DataType,
    kv_cache_data_type: DataType,
    head_dim: u32,
    #[serde(default = "one")]
    beam_width: u32,
    heads_per_kv: u32,
    m_tile_size: u32,
    #[serde(default)]
    tokens_per_page: u32,
    #[serde(default)]
    paged_kv_cache: bool,
    #[serde(default)]
    multi_query_tokens: bool,
    symbol: String,
    image: Option<PathBuf>,
}

fn one() -> u32 {
    1
}

impl Catalog {
    /// Load a catalog from a manifest directory (or a path to its `catalog.json`).
    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let manifest_path = if path.is_dir() { path.join(MANIFEST_FILE) } else { path.to_path_buf() };
        let root = manifest_path.parent().map(Path::to_path_buf).unwrap_or_default();

        let text = std::fs::read_to_string(&manifest_path).map_err(|e| DispatchError::Manifest {
            path: manifest_path.clone(),
            message: e.to_string(),
        })?;
        let manifest: Manifest = serde_json::from_str(&text).map_err(|e| DispatchError::Manifest {
            path: manifest_path.clone(),
            message: e.to_string(),
        })?;

        let mut images: HashMap<PathBuf, KernelImage> = HashMap::new();
        let mut entries = Vec::with_capacity(manifest.kernels.len());
        for (index, entry) in manifest.kernels.into_iter().enumerate() {
            if entry.symbol.is_empty() || entry.symbol.contains('\0') {
                return Err(DispatchError::Manifest {
                    path: manifest_path.clone(),
                    message: format!("entry {} has an invalid symbol name", index),
                });
            }
            let image = match entry.image {
                None => None,
                Some(rel) => {
                    let file = root.join(&rel);
                    // `a.cubin`, `./a.cubin` and `sub/../a.cubin` are one image.
                    let file = std::fs::canonicalize(&file).map_err(|e| DispatchError::Manifest {
                        path: file.clone(),
                        message: e.to_string(),
                    })?;
                    let next_id = ImageId(images.len() as u32);
                    let image = match images.get(&file) {
                        Some(image) => *image,
                        None => {
                            let bytes = std::fs::read(&file).map_err(|e| DispatchError::Manifest {
                                path: file.clone(),
                                message: e.to_string(),
                            })?;
                            let image = KernelImage { id: next_id, bytes: Box::leak(bytes.into_boxed_slice()) };
                            images.insert(file, image);
                            image
                        }
                    };
                    Some(image)
                }
            };
            entries.push(KernelMeta {
                arch: entry.arch,
                data_type: entry.data_type,
                kv_cache_data_type: entry.kv_cache_data_type,
                head_dim: entry.head_dim,
                beam_width: entry.beam_width,
                heads_per_kv: entry.heads_per_kv,
                m_tile_size: entry.m_tile_size,
                tokens_per_page: entry.tokens_per_page,
                paged_kv_cache: entry.paged_kv_cache,
                multi_query_tokens: entry.multi_query_tokens,
                symbol: Box::leak(entry.symbol.into_boxed_str()),
                image,
            });
        }

        tracing::info!(
            "Loaded kernel catalog from {}: {} entries, {} images",
            manifest_path.display(),
            entries.len(),
            images.len()
        );
        Ok(Catalog::new(entries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_manifest(dir: &Path, body: &str) {
        std::fs::write(dir.join(MANIFEST_FILE), body).unwrap();
    }

    #[test]
    fn test_manifest_dedups_images() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.cubin"), b"AAAA").unwrap();
        std::fs::write(dir.path().join("b.cubin"), b"BB").unwrap();
        write_manifest(
            dir.path(),
            r#"{ "kernels": [
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "fp16", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k0", "image": "a.cubin" },
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "int8", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k1", "image": "a.cubin" },
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "fp16", "head_dim": 64,
                  "heads_per_kv": 1, "m_tile_size": 1, "symbol": "k2", "image": "b.cubin" },
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "fp16", "head_dim": 256,
                  "heads_per_kv": 1, "m_tile_size": 1, "symbol": "k3", "image": null }
            ] }"#,
        );

        let catalog = Catalog::from_manifest(dir.path()).unwrap();
        assert_eq!(catalog.len(), 4);
        let ids: Vec<Option<ImageId>> = catalog.entries().iter().map(|m| m.image.map(|i| i.id)).collect();
        assert_eq!(ids, vec![Some(ImageId(0)), Some(ImageId(0)), Some(ImageId(1)), None]);
        assert_eq!(catalog.entries()[2].image.unwrap().bytes, b"BB");
        assert_eq!(catalog.entries()[0].beam_width, 1);
        assert_eq!(catalog.entries()[1].symbol, "k1");
    }

    #[test]
    fn test_manifest_dedups_equivalent_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("a.cubin"), b"AAAA").unwrap();
        write_manifest(
            dir.path(),
            r#"{ "kernels": [
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "fp16", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k0", "image": "a.cubin" },
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "int8", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k1", "image": "./a.cubin" },
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "e4m3", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k2", "image": "sub/../a.cubin" }
            ] }"#,
        );

        let catalog = Catalog::from_manifest(dir.path()).unwrap();
        let ids: Vec<Option<ImageId>> = catalog.entries().iter().map(|m| m.image.map(|i| i.id)).collect();
        assert_eq!(ids, vec![Some(ImageId(0)); 3]);
    }

    #[test]
    fn test_manifest_missing_image() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(
            dir.path(),
            r#"{ "kernels": [
                { "arch": 80, "data_type": "fp16", "kv_cache_data_type": "fp16", "head_dim": 128,
                  "heads_per_kv": 8, "m_tile_size": 8, "symbol": "k0", "image": "missing.cubin" }
            ] }"#,
        );
        let err = Catalog::from_manifest(dir.path()).unwrap_err();
        assert!(matches!(err, DispatchError::Manifest { .. }));
    }

    #[test]
    fn test_manifest_malformed() {
        let dir = tempfile::tempdir().unwrap();
        write_manifest(dir.path(), "{ \"kernels\": 3 }");
        assert!(matches!(
            Catalog::from_manifest(dir.path()),
            Err(DispatchError::Manifest { .. })
        ));
    }
}
