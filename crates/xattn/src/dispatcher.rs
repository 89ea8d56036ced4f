//! Entry points used by the attention plugin.

use std::sync::Arc;

use xattn_driver::StreamHandle;

use crate::cache::RegistryCache;
use crate::convert::OutputConverter;
use crate::dtype::{DataType, SmVersion};
use crate::error::DispatchError;
use crate::kv_cache::{KvBlockArray, KvCacheBuffer, KvLinearBuffer};
use crate::preprocess::DevicePreprocessor;
use crate::registry::{KernelRegistry, RunContext};
use crate::request::AttentionRequest;
use crate::Result;

/// Precompiled-kernel attention for one activation type on the current device.
pub struct PrecompiledAttention {
    cache: Arc<RegistryCache>,
    preprocessor: Arc<dyn DevicePreprocessor>,
    converter: Arc<dyn OutputConverter>,
    data_type: DataType,
    arch: SmVersion,
    multiprocessor_count: u32,
}

impl PrecompiledAttention {
    /// Bind to the calling thread's current device.
    pub fn new(
        cache: Arc<RegistryCache>,
        preprocessor: Arc<dyn DevicePreprocessor>,
        converter: Arc<dyn OutputConverter>,
        data_type: DataType,
    ) -> Result<Self> {
        if !data_type.is_activation_type() {
            return Err(DispatchError::Config(format!(
                "precompiled attention is built for fp16 and bf16 activations, not {}",
                data_type
            )));
        }
        let driver = cache.driver();
        let device = driver.current_device()?;
        let (major, minor) = driver.compute_capability(device)?;
        let multiprocessor_count = driver.multiprocessor_count(device)?;
        let arch = SmVersion::from_capability(major, minor);
        tracing::debug!("Precompiled attention on {}: {}, {} SMs, {}", device, arch, multiprocessor_count, data_type);
        Ok(Self {
            cache,
            preprocessor,
            converter,
            data_type,
            arch,
            multiprocessor_count,
        })
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn arch(&self) -> SmVersion {
        self.arch
    }

    pub fn multiprocessor_count(&self) -> u32 {
        self.multiprocessor_count
    }

    pub fn registry(&self) -> Result<Arc<KernelRegistry>> {
        self.cache.get_registry(self.data_type, self.arch)
    }

    /// Whether a compiled kernel exists for `request` and is expected to pay off.
    pub fn should_use(&self, request: &AttentionRequest) -> Result<bool> {
        let registry = self.registry()?;
        Ok(registry.support_config(request)?
            && registry.may_have_perf_gain(request, self.multiprocessor_count))
    }

    /// Configuration-phase hook. Nothing to prepare.
    pub fn prepare(&self, _request: &AttentionRequest) {}

    pub fn run_with_linear_cache(
        &self,
        request: &AttentionRequest,
        kv_cache: &KvLinearBuffer,
        stream: StreamHandle,
    ) -> Result<()> {
        self.run(request, kv_cache, stream)
    }

    pub fn run_with_paged_cache(
        &self,
        request: &AttentionRequest,
        kv_cache: &KvBlockArray,
        stream: StreamHandle,
    ) -> Result<()> {
        self.run(request, kv_cache, stream)
    }

    fn run<B: KvCacheBuffer>(&self, request: &AttentionRequest, kv_cache: &B, stream: StreamHandle) -> Result<()> {
        let registry = self.registry()?;
        let ctx = RunContext {
            preprocessor: self.preprocessor.as_ref(),
            converter: self.converter.as_ref(),
            multiprocessor_count: self.multiprocessor_count,
            stream,
        };
        registry.run(request, kv_cache, &ctx)
    }
}
