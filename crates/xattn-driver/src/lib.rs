//! # xattn-driver
//!
//! The device-driver surface used by the `xattn` kernel dispatcher.
//!
//! Provides:
//! - Plain-integer handle types for devices, modules, functions, streams and device pointers
//! - The [`Driver`] trait: module load, symbol resolve, module-global read, attribute set,
//!   tensor-map encode, async memset and kernel launch
//! - [`CudaDriver`], the `libcuda` implementation (loaded at runtime, no build-time CUDA)
//! - Kernel argument lists with a structurally enforced slot limit and null guard
//! - A recording in-process driver for tests (behind the `mock` feature)

pub mod context;
pub mod ffi;
pub mod launch;
pub mod tensor_map;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::ffi::c_void;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use context::{CudaDriver, DriverError};
pub use launch::{ArgList, ArgOverflow, KernelArgs, LaunchConfig, MAX_KERNEL_PARAMS};
pub use tensor_map::{Swizzle, TensorMap, TensorMapDataType, TensorMapDesc};

/// Ordinal of a physical device as seen by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceOrdinal(pub u32);

impl fmt::Display for DeviceOrdinal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cuda:{}", self.0)
    }
}

/// Loaded module. Stored as an integer so handles are `Send + Sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub usize);

/// Resolved, launchable device function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FunctionHandle(pub usize);

/// Caller-owned execution queue. `StreamHandle::DEFAULT` is the legacy default stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StreamHandle(pub usize);

impl StreamHandle {
    pub const DEFAULT: StreamHandle = StreamHandle(0);
}

/// Raw device address.
#[repr(transparent)]
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    bytemuck::Pod,
    bytemuck::Zeroable,
)]
#[serde(transparent)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    pub const NULL: DevicePtr = DevicePtr(0);

    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    pub fn offset(&self, bytes: usize) -> DevicePtr {
        DevicePtr(self.0 + bytes as u64)
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// The driver operations the dispatcher relies on.
///
/// Every call reports driver-level failure as a [`DriverError`]; the dispatcher never
/// retries. Implementations must be shareable across threads: registries built on top of a
/// driver are read concurrently without locks.
pub trait Driver: Send + Sync {
    /// Device of the calling thread's current context.
    fn current_device(&self) -> Result<DeviceOrdinal, DriverError>;

    /// `(major, minor)` compute capability.
    fn compute_capability(&self, device: DeviceOrdinal) -> Result<(u32, u32), DriverError>;

    fn multiprocessor_count(&self, device: DeviceOrdinal) -> Result<u32, DriverError>;

    /// Load a binary kernel image into a module on the current context.
    fn load_module(&self, image: &[u8]) -> Result<ModuleHandle, DriverError>;

    fn get_function(&self, module: ModuleHandle, symbol: &str)
        -> Result<FunctionHandle, DriverError>;

    /// Copy a module-global variable to the host. `Ok(None)` if the module has no such symbol.
    fn read_global(&self, module: ModuleHandle, symbol: &str)
        -> Result<Option<Vec<u8>>, DriverError>;

    /// Raise the function's dynamic shared memory limit.
    fn set_max_dynamic_shared_mem(
        &self,
        function: FunctionHandle,
        bytes: u32,
    ) -> Result<(), DriverError>;

    fn encode_tensor_map(&self, desc: &TensorMapDesc) -> Result<TensorMap, DriverError>;

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError>;

    /// Enqueue a kernel on `stream`.
    ///
    /// # Safety
    /// `args` must match the kernel's parameter list in count, order and layout, and every
    /// device address reachable through them must be valid for the kernel's accesses.
    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), DriverError>;

    /// Non-blocking check for errors raised by work already enqueued on `stream`.
    fn check_stream(&self, stream: StreamHandle) -> Result<(), DriverError>;

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), DriverError>;
}

pub(crate) fn as_raw<T>(handle: usize) -> *mut T {
    handle as *mut T
}

pub(crate) fn raw_params(args: &mut KernelArgs<'_>) -> *mut *mut c_void {
    args.as_mut_ptr_slice().as_mut_ptr()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_ptr_offset() {
        let p = DevicePtr(0x1000);
        assert_eq!(p.offset(256), DevicePtr(0x1100));
        assert!(DevicePtr::NULL.is_null());
        assert!(!p.is_null());
        assert_eq!(format!("{}", p), "0x1000");
    }

    #[test]
    fn test_display_ordinal() {
        assert_eq!(format!("{}", DeviceOrdinal(3)), "cuda:3");
    }
}
