//! # xattn
//!
//! Runtime dispatcher for precompiled fused-attention GPU kernels.
//!
//! Provides:
//! - A catalog of compiled kernel variants (static, linker-collected, or manifest-loaded)
//! - The variant key shared by selection and launch
//! - Per-(data type, architecture) kernel registries, cached per device
//! - The occupancy gate deciding whether a precompiled kernel is worth using
//! - Workspace carving, the device preprocessing passes and the two launch strategies
//!   (single-token decode, multi-token speculative decode)
//! - Optional fp8 output conversion

pub mod cache;
pub mod catalog;
pub mod config;
pub mod convert;
pub mod dispatcher;
pub mod dtype;
pub mod error;
pub mod heuristics;
pub mod key;
pub mod kv_cache;
pub mod launch;
pub mod manifest;
pub mod preprocess;
pub mod registry;
pub mod request;
pub mod workspace;

pub use cache::RegistryCache;
pub use catalog::{Catalog, ImageId, KernelImage, KernelMeta, LINKED_KERNELS};
pub use config::DispatchConfig;
pub use convert::{NoConversion, OutputConverter};
pub use dispatcher::PrecompiledAttention;
pub use dtype::{DataType, KvCacheQuant, SmVersion};
pub use error::DispatchError;
pub use key::VariantKey;
pub use kv_cache::{KvBlockArray, KvCacheBuffer, KvCacheParams, KvLinearBuffer};
pub use preprocess::DevicePreprocessor;
pub use registry::{FunctionInfo, KernelFamily, KernelRegistry, LaunchStrategy};
pub use request::AttentionRequest;

pub use linkme;
pub use xattn_driver::{DeviceOrdinal, DevicePtr, Driver, StreamHandle};

pub type Result<T> = std::result::Result<T, DispatchError>;
