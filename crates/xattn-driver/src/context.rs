//! CUDA driver implementation of [`Driver`].
//!
//! `CudaDriver` does not create contexts: the caller owns the context and the streams,
//! and every call targets the context current on the calling thread.

use std::ffi::{c_int, c_void, CString};
use std::sync::{Arc, OnceLock};

use crate::ffi::{self, check_cu, CudaApi};
use crate::launch::{KernelArgs, LaunchConfig};
use crate::tensor_map::{TensorMap, TensorMapDesc};
use crate::{
    as_raw, raw_params, DeviceOrdinal, DevicePtr, Driver, FunctionHandle, ModuleHandle,
    StreamHandle,
};

static SHARED: OnceLock<Option<Arc<CudaDriver>>> = OnceLock::new();

/// Driver backed by the runtime-loaded `libcuda`.
pub struct CudaDriver {
    api: &'static CudaApi,
}

impl CudaDriver {
    /// Open `libcuda` and initialize the driver API.
    pub fn new() -> Result<Self, DriverError> {
        let api = ffi::cuda_api().ok_or(DriverError::NotAvailable)?;
        check_cu(unsafe { (api.cu_init)(0) }, "cuInit")?;
        Ok(Self { api })
    }

    /// Process-wide driver instance, created on first access.
    pub fn shared() -> Result<Arc<CudaDriver>, DriverError> {
        SHARED
            .get_or_init(|| match CudaDriver::new() {
                Ok(driver) => Some(Arc::new(driver)),
                Err(err) => {
                    tracing::warn!("CUDA driver unavailable: {}", err);
                    None
                }
            })
            .clone()
            .ok_or(DriverError::NotAvailable)
    }

    /// Whether libcuda can be opened and initialized.
    pub fn is_available() -> bool {
        Self::shared().is_ok()
    }

    fn attribute(&self, attribute: c_int, device: DeviceOrdinal) -> Result<i32, DriverError> {
        let mut value: c_int = 0;
        check_cu(
            unsafe { (self.api.cu_device_get_attribute)(&mut value, attribute, device.0 as c_int) },
            "cuDeviceGetAttribute",
        )?;
        Ok(value)
    }
}

impl Driver for CudaDriver {
    fn current_device(&self) -> Result<DeviceOrdinal, DriverError> {
        let mut device: ffi::CuDevice = 0;
        check_cu(unsafe { (self.api.cu_ctx_get_device)(&mut device) }, "cuCtxGetDevice")?;
        Ok(DeviceOrdinal(device.max(0) as u32))
    }

    fn compute_capability(&self, device: DeviceOrdinal) -> Result<(u32, u32), DriverError> {
        let major = self.attribute(ffi::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR, device)?;
        let minor = self.attribute(ffi::CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR, device)?;
        Ok((major.max(0) as u32, minor.max(0) as u32))
    }

    fn multiprocessor_count(&self, device: DeviceOrdinal) -> Result<u32, DriverError> {
        let count = self.attribute(ffi::CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT, device)?;
        Ok(count.max(0) as u32)
    }

    fn load_module(&self, image: &[u8]) -> Result<ModuleHandle, DriverError> {
        let mut module: ffi::CuModule = std::ptr::null_mut();
        check_cu(
            unsafe { (self.api.cu_module_load_data)(&mut module, image.as_ptr() as *const c_void) },
            "cuModuleLoadData",
        )?;
        Ok(ModuleHandle(module as usize))
    }

    fn get_function(
        &self,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<FunctionHandle, DriverError> {
        let c_symbol = CString::new(symbol).map_err(|_| DriverError::InvalidName(symbol.into()))?;
        let mut function: ffi::CuFunction = std::ptr::null_mut();
        check_cu(
            unsafe {
                (self.api.cu_module_get_function)(&mut function, as_raw(module.0), c_symbol.as_ptr())
            },
            &format!("cuModuleGetFunction({})", symbol),
        )?;
        Ok(FunctionHandle(function as usize))
    }

    fn read_global(
        &self,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let c_symbol = CString::new(symbol).map_err(|_| DriverError::InvalidName(symbol.into()))?;
        let mut dptr: ffi::CuDevicePtr = 0;
        let mut bytes: usize = 0;
        let code = unsafe {
            (self.api.cu_module_get_global)(&mut dptr, &mut bytes, as_raw(module.0), c_symbol.as_ptr())
        };
        if code == ffi::CUDA_ERROR_NOT_FOUND {
            return Ok(None);
        }
        check_cu(code, &format!("cuModuleGetGlobal({})", symbol))?;

        let mut host = vec![0u8; bytes];
        if bytes != 0 {
            check_cu(
                unsafe { (self.api.cu_memcpy_dtoh)(host.as_mut_ptr() as *mut c_void, dptr, bytes) },
                "cuMemcpyDtoH",
            )?;
        }
        Ok(Some(host))
    }

    fn set_max_dynamic_shared_mem(
        &self,
        function: FunctionHandle,
        bytes: u32,
    ) -> Result<(), DriverError> {
        check_cu(
            unsafe {
                (self.api.cu_func_set_attribute)(
                    as_raw(function.0),
                    ffi::CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES,
                    bytes as c_int,
                )
            },
            "cuFuncSetAttribute(MAX_DYNAMIC_SHARED_SIZE_BYTES)",
        )
    }

    fn encode_tensor_map(&self, desc: &TensorMapDesc) -> Result<TensorMap, DriverError> {
        let encode = self
            .api
            .cu_tensor_map_encode_tiled
            .ok_or(DriverError::MissingEntryPoint("cuTensorMapEncodeTiled"))?;
        let mut map = TensorMap::zeroed();
        check_cu(
            unsafe {
                encode(
                    &mut map as *mut TensorMap as *mut c_void,
                    desc.data_type as u32,
                    desc.rank,
                    desc.global_address.0 as *mut c_void,
                    desc.global_dims.as_ptr(),
                    desc.global_strides.as_ptr(),
                    desc.box_dims.as_ptr(),
                    desc.element_strides.as_ptr(),
                    ffi::CU_TENSOR_MAP_INTERLEAVE_NONE,
                    desc.swizzle as u32,
                    ffi::CU_TENSOR_MAP_L2_PROMOTION_NONE,
                    ffi::CU_TENSOR_MAP_FLOAT_OOB_FILL_NONE,
                )
            },
            "cuTensorMapEncodeTiled",
        )?;
        Ok(map)
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError> {
        check_cu(
            unsafe { (self.api.cu_memset_d8_async)(dst.0, value, bytes, as_raw(stream.0)) },
            "cuMemsetD8Async",
        )
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), DriverError> {
        check_cu(
            (self.api.cu_launch_kernel)(
                as_raw(function.0),
                config.grid_dim.0,
                config.grid_dim.1,
                config.grid_dim.2,
                config.block_dim.0,
                config.block_dim.1,
                config.block_dim.2,
                config.shared_mem_bytes,
                as_raw(stream.0),
                raw_params(args),
                std::ptr::null_mut(),
            ),
            "cuLaunchKernel",
        )
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<(), DriverError> {
        let code = unsafe { (self.api.cu_stream_query)(as_raw(stream.0)) };
        if code == ffi::CUDA_ERROR_NOT_READY {
            return Ok(());
        }
        check_cu(code, "cuStreamQuery")
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), DriverError> {
        check_cu(
            unsafe { (self.api.cu_stream_synchronize)(as_raw(stream.0)) },
            "cuStreamSynchronize",
        )
    }
}

/// Driver-level errors.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("CUDA driver not available (libcuda could not be loaded)")]
    NotAvailable,

    #[error("CUDA driver call {context} failed: {name} ({code})")]
    Cuda { code: i32, name: String, context: String },

    #[error("name '{0}' contains a NUL byte")]
    InvalidName(String),

    #[error("driver entry point {0} is not exported by this libcuda")]
    MissingEntryPoint(&'static str),
}
