//! Runtime-loaded CUDA driver function pointers via dlopen.
//!
//! Only the driver API is needed; kernels arrive as prebuilt images, so there is no
//! compiler dependency and no build-time CUDA toolkit requirement.

use std::ffi::{c_char, c_int, c_uint, c_void};
use std::sync::OnceLock;

use libloading::Library;

use super::context::DriverError;

// ---------------------------------------------------------------------------
// Status codes and enums
// ---------------------------------------------------------------------------

pub type CuResult = c_int;
pub const CUDA_SUCCESS: CuResult = 0;
pub const CUDA_ERROR_NOT_FOUND: CuResult = 500;
pub const CUDA_ERROR_NOT_READY: CuResult = 600;

pub const CU_DEVICE_ATTRIBUTE_MULTIPROCESSOR_COUNT: c_int = 16;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MAJOR: c_int = 75;
pub const CU_DEVICE_ATTRIBUTE_COMPUTE_CAPABILITY_MINOR: c_int = 76;

pub const CU_FUNC_ATTRIBUTE_MAX_DYNAMIC_SHARED_SIZE_BYTES: c_int = 8;

pub const CU_TENSOR_MAP_INTERLEAVE_NONE: c_uint = 0;
pub const CU_TENSOR_MAP_L2_PROMOTION_NONE: c_uint = 0;
pub const CU_TENSOR_MAP_FLOAT_OOB_FILL_NONE: c_uint = 0;

// Opaque handles
pub type CuDevice = c_int;
pub type CuDevicePtr = u64;
pub type CuModule = *mut c_void;
pub type CuFunction = *mut c_void;
pub type CuStream = *mut c_void;

// ---------------------------------------------------------------------------
// Driver API function signatures
// ---------------------------------------------------------------------------

type FnCuInit = unsafe extern "C" fn(c_uint) -> CuResult;
type FnCuGetErrorName = unsafe extern "C" fn(CuResult, *mut *const c_char) -> CuResult;
type FnCuCtxGetDevice = unsafe extern "C" fn(*mut CuDevice) -> CuResult;
type FnCuDeviceGetAttribute = unsafe extern "C" fn(*mut c_int, c_int, CuDevice) -> CuResult;
type FnCuModuleLoadData = unsafe extern "C" fn(*mut CuModule, *const c_void) -> CuResult;
type FnCuModuleGetFunction = unsafe extern "C" fn(
    *mut CuFunction, CuModule, *const c_char,
) -> CuResult;
type FnCuModuleGetGlobal = unsafe extern "C" fn(
    *mut CuDevicePtr, *mut usize, CuModule, *const c_char,
) -> CuResult;
type FnCuMemcpyDtoH = unsafe extern "C" fn(*mut c_void, CuDevicePtr, usize) -> CuResult;
type FnCuMemsetD8Async = unsafe extern "C" fn(CuDevicePtr, u8, usize, CuStream) -> CuResult;
type FnCuFuncSetAttribute = unsafe extern "C" fn(CuFunction, c_int, c_int) -> CuResult;
type FnCuLaunchKernel = unsafe extern "C" fn(
    CuFunction,
    c_uint, c_uint, c_uint,   // grid x, y, z
    c_uint, c_uint, c_uint,   // block x, y, z
    c_uint,                    // shared mem bytes
    CuStream,
    *mut *mut c_void,          // kernel params
    *mut *mut c_void,          // extra (null)
) -> CuResult;
type FnCuStreamQuery = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuStreamSynchronize = unsafe extern "C" fn(CuStream) -> CuResult;
type FnCuTensorMapEncodeTiled = unsafe extern "C" fn(
    *mut c_void,        // CUtensorMap*
    c_uint,             // data type
    c_uint,             // rank
    *mut c_void,        // global address
    *const u64,         // global dims
    *const u64,         // global strides (rank - 1)
    *const u32,         // box dims
    *const u32,         // element strides
    c_uint,             // interleave
    c_uint,             // swizzle
    c_uint,             // l2 promotion
    c_uint,             // oob fill
) -> CuResult;

// ---------------------------------------------------------------------------
// Loaded API struct
// ---------------------------------------------------------------------------

pub struct CudaApi {
    _lib: Library,
    pub cu_init: FnCuInit,
    pub cu_get_error_name: FnCuGetErrorName,
    pub cu_ctx_get_device: FnCuCtxGetDevice,
    pub cu_device_get_attribute: FnCuDeviceGetAttribute,
    pub cu_module_load_data: FnCuModuleLoadData,
    pub cu_module_get_function: FnCuModuleGetFunction,
    pub cu_module_get_global: FnCuModuleGetGlobal,
    pub cu_memcpy_dtoh: FnCuMemcpyDtoH,
    pub cu_memset_d8_async: FnCuMemsetD8Async,
    pub cu_func_set_attribute: FnCuFuncSetAttribute,
    pub cu_launch_kernel: FnCuLaunchKernel,
    pub cu_stream_query: FnCuStreamQuery,
    pub cu_stream_synchronize: FnCuStreamSynchronize,
    /// Absent on drivers older than CUDA 12.
    pub cu_tensor_map_encode_tiled: Option<FnCuTensorMapEncodeTiled>,
}

// Safety: the loaded function pointers are process-global and the driver API is
// internally synchronized.
unsafe impl Send for CudaApi {}
unsafe impl Sync for CudaApi {}

static CUDA_API: OnceLock<Option<CudaApi>> = OnceLock::new();

const LIBRARY_CANDIDATES: [&str; 3] = ["libcuda.so.1", "libcuda.so", "nvcuda.dll"];

impl CudaApi {
    fn try_load() -> Option<Self> {
        let lib = LIBRARY_CANDIDATES
            .iter()
            .find_map(|name| unsafe { Library::new(name) }.ok())?;
        unsafe {
            let api = CudaApi {
                cu_init: *lib.get::<FnCuInit>(b"cuInit\0").ok()?,
                cu_get_error_name: *lib.get::<FnCuGetErrorName>(b"cuGetErrorName\0").ok()?,
                cu_ctx_get_device: *lib.get::<FnCuCtxGetDevice>(b"cuCtxGetDevice\0").ok()?,
                cu_device_get_attribute: *lib.get::<FnCuDeviceGetAttribute>(b"cuDeviceGetAttribute\0").ok()?,
                cu_module_load_data: *lib.get::<FnCuModuleLoadData>(b"cuModuleLoadData\0").ok()?,
                cu_module_get_function: *lib.get::<FnCuModuleGetFunction>(b"cuModuleGetFunction\0").ok()?,
                cu_module_get_global: *lib.get::<FnCuModuleGetGlobal>(b"cuModuleGetGlobal_v2\0").ok()?,
                cu_memcpy_dtoh: *lib.get::<FnCuMemcpyDtoH>(b"cuMemcpyDtoH_v2\0").ok()?,
                cu_memset_d8_async: *lib.get::<FnCuMemsetD8Async>(b"cuMemsetD8Async\0").ok()?,
                cu_func_set_attribute: *lib.get::<FnCuFuncSetAttribute>(b"cuFuncSetAttribute\0").ok()?,
                cu_launch_kernel: *lib.get::<FnCuLaunchKernel>(b"cuLaunchKernel\0").ok()?,
                cu_stream_query: *lib.get::<FnCuStreamQuery>(b"cuStreamQuery\0").ok()?,
                cu_stream_synchronize: *lib.get::<FnCuStreamSynchronize>(b"cuStreamSynchronize\0").ok()?,
                cu_tensor_map_encode_tiled: lib
                    .get::<FnCuTensorMapEncodeTiled>(b"cuTensorMapEncodeTiled\0")
                    .ok()
                    .map(|sym| *sym),
                _lib: lib,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded driver API. Returns None if libcuda could not be opened.
pub fn cuda_api() -> Option<&'static CudaApi> {
    CUDA_API.get_or_init(CudaApi::try_load).as_ref()
}

// ---------------------------------------------------------------------------
// Error checking helpers
// ---------------------------------------------------------------------------

/// Check a driver API return code.
pub fn check_cu(code: CuResult, context: &str) -> Result<(), DriverError> {
    if code == CUDA_SUCCESS {
        Ok(())
    } else {
        Err(DriverError::Cuda {
            code,
            name: error_name(code),
            context: context.to_string(),
        })
    }
}

fn error_name(code: CuResult) -> String {
    let Some(api) = cuda_api() else {
        return "CUDA_ERROR_UNKNOWN".to_string();
    };
    let mut name: *const c_char = std::ptr::null();
    let status = unsafe { (api.cu_get_error_name)(code, &mut name) };
    if status != CUDA_SUCCESS || name.is_null() {
        return "CUDA_ERROR_UNKNOWN".to_string();
    }
    // Safety: the driver returns a static NUL-terminated string.
    unsafe { std::ffi::CStr::from_ptr(name) }
        .to_string_lossy()
        .into_owned()
}
