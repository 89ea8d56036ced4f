//! In-process driver that records every call instead of touching a GPU.
//!
//! Images are matched by content: register the bytes of each fake image with
//! [`RecordingDriver::with_image`] together with the module globals it should expose.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::context::DriverError;
use crate::launch::{KernelArgs, LaunchConfig};
use crate::tensor_map::{TensorMap, TensorMapDesc};
use crate::{DeviceOrdinal, DevicePtr, Driver, FunctionHandle, ModuleHandle, StreamHandle};

/// One call observed by [`RecordingDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    LoadModule { image_len: usize },
    GetFunction { module: ModuleHandle, symbol: String },
    ReadGlobal { module: ModuleHandle, symbol: String },
    SetMaxDynamicSharedMem { function: FunctionHandle, bytes: u32 },
    EncodeTensorMap(TensorMapDesc),
    Memset { dst: DevicePtr, value: u8, bytes: usize, stream: StreamHandle },
    Launch { function: FunctionHandle, stream: StreamHandle },
    CheckStream(StreamHandle),
    Synchronize(StreamHandle),
}

/// A launch with a copy of its parameter bytes.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedLaunch {
    pub function: FunctionHandle,
    pub symbol: String,
    pub config: LaunchConfig,
    pub stream: StreamHandle,
    pub args: Vec<Vec<u8>>,
    pub null_terminated: bool,
}

struct FakeImage {
    bytes: Vec<u8>,
    globals: HashMap<String, Vec<u8>>,
}

#[derive(Default)]
struct State {
    images: Vec<FakeImage>,
    /// module handle - 1 -> image index (None for unregistered images)
    modules: Vec<Option<usize>>,
    /// function handle - 1 -> (module, symbol)
    functions: Vec<(ModuleHandle, String)>,
    failing_symbols: HashSet<String>,
    stream_error: Option<i32>,
    calls: Vec<DriverCall>,
    launches: Vec<RecordedLaunch>,
}

pub struct RecordingDriver {
    capability: Mutex<HashMap<DeviceOrdinal, (u32, u32)>>,
    default_capability: (u32, u32),
    sm_count: u32,
    current: AtomicU32,
    state: Mutex<State>,
}

impl Default for RecordingDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingDriver {
    /// An sm_90 device with 132 multiprocessors.
    pub fn new() -> Self {
        Self {
            capability: Mutex::new(HashMap::new()),
            default_capability: (9, 0),
            sm_count: 132,
            current: AtomicU32::new(0),
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_capability(mut self, major: u32, minor: u32) -> Self {
        self.default_capability = (major, minor);
        self
    }

    /// Override the capability reported for one device.
    pub fn with_device_capability(self, device: DeviceOrdinal, major: u32, minor: u32) -> Self {
        self.capability.lock().insert(device, (major, minor));
        self
    }

    pub fn with_multiprocessor_count(mut self, count: u32) -> Self {
        self.sm_count = count;
        self
    }

    /// Register an image and the module globals it exposes.
    pub fn with_image<S: Into<String>>(
        self,
        bytes: &[u8],
        globals: impl IntoIterator<Item = (S, Vec<u8>)>,
    ) -> Self {
        self.state.lock().images.push(FakeImage {
            bytes: bytes.to_vec(),
            globals: globals.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        });
        self
    }

    /// Make `get_function` fail for `symbol` until [`RecordingDriver::clear_failures`].
    pub fn failing_symbol(self, symbol: &str) -> Self {
        self.fail_symbol(symbol);
        self
    }

    pub fn fail_symbol(&self, symbol: &str) {
        self.state.lock().failing_symbols.insert(symbol.to_string());
    }

    /// Make `check_stream` report `code`.
    pub fn fail_stream(&self, code: i32) {
        self.state.lock().stream_error = Some(code);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.failing_symbols.clear();
        state.stream_error = None;
    }

    pub fn set_current_device(&self, device: DeviceOrdinal) {
        self.current.store(device.0, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<DriverCall> {
        self.state.lock().calls.clone()
    }

    pub fn launches(&self) -> Vec<RecordedLaunch> {
        self.state.lock().launches.clone()
    }

    pub fn clear_calls(&self) {
        let mut state = self.state.lock();
        state.calls.clear();
        state.launches.clear();
    }

    pub fn load_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| matches!(c, DriverCall::LoadModule { .. }))
            .count()
    }

    /// Symbol a function handle was resolved from.
    pub fn function_symbol(&self, function: FunctionHandle) -> Option<String> {
        let state = self.state.lock();
        state
            .functions
            .get(function.0.checked_sub(1)?)
            .map(|(_, s)| s.clone())
    }

    fn record(&self, call: DriverCall) {
        self.state.lock().calls.push(call);
    }
}

/// Little-endian bytes of a `u32` module global.
pub fn u32_global(value: u32) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

fn not_found(context: &str) -> DriverError {
    DriverError::Cuda {
        code: 500,
        name: "CUDA_ERROR_NOT_FOUND".to_string(),
        context: context.to_string(),
    }
}

impl Driver for RecordingDriver {
    fn current_device(&self) -> Result<DeviceOrdinal, DriverError> {
        Ok(DeviceOrdinal(self.current.load(Ordering::SeqCst)))
    }

    fn compute_capability(&self, device: DeviceOrdinal) -> Result<(u32, u32), DriverError> {
        Ok(self
            .capability
            .lock()
            .get(&device)
            .copied()
            .unwrap_or(self.default_capability))
    }

    fn multiprocessor_count(&self, _device: DeviceOrdinal) -> Result<u32, DriverError> {
        Ok(self.sm_count)
    }

    fn load_module(&self, image: &[u8]) -> Result<ModuleHandle, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::LoadModule { image_len: image.len() });
        let index = state.images.iter().position(|i| i.bytes == image);
        state.modules.push(index);
        Ok(ModuleHandle(state.modules.len()))
    }

    fn get_function(
        &self,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<FunctionHandle, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::GetFunction { module, symbol: symbol.to_string() });
        if state.failing_symbols.contains(symbol) {
            return Err(not_found(&format!("cuModuleGetFunction({})", symbol)));
        }
        state.functions.push((module, symbol.to_string()));
        Ok(FunctionHandle(state.functions.len()))
    }

    fn read_global(
        &self,
        module: ModuleHandle,
        symbol: &str,
    ) -> Result<Option<Vec<u8>>, DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::ReadGlobal { module, symbol: symbol.to_string() });
        let image = module
            .0
            .checked_sub(1)
            .and_then(|m| state.modules.get(m).copied().flatten());
        Ok(image.and_then(|i| state.images[i].globals.get(symbol).cloned()))
    }

    fn set_max_dynamic_shared_mem(
        &self,
        function: FunctionHandle,
        bytes: u32,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::SetMaxDynamicSharedMem { function, bytes });
        Ok(())
    }

    fn encode_tensor_map(&self, desc: &TensorMapDesc) -> Result<TensorMap, DriverError> {
        self.record(DriverCall::EncodeTensorMap(*desc));
        let mut map = TensorMap::zeroed();
        map.opaque[0] = desc.global_address.0;
        map.opaque[1] = desc.data_type as u64;
        map.opaque[2..6].copy_from_slice(&desc.global_dims[..4]);
        Ok(map)
    }

    fn memset_async(
        &self,
        dst: DevicePtr,
        value: u8,
        bytes: usize,
        stream: StreamHandle,
    ) -> Result<(), DriverError> {
        self.record(DriverCall::Memset { dst, value, bytes, stream });
        Ok(())
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        config: &LaunchConfig,
        stream: StreamHandle,
        args: &mut KernelArgs<'_>,
    ) -> Result<(), DriverError> {
        let symbol = self.function_symbol(function).unwrap_or_default();
        let mut state = self.state.lock();
        state.calls.push(DriverCall::Launch { function, stream });
        state.launches.push(RecordedLaunch {
            function,
            symbol,
            config: *config,
            stream,
            args: args.snapshot(),
            null_terminated: args.is_null_terminated(),
        });
        Ok(())
    }

    fn check_stream(&self, stream: StreamHandle) -> Result<(), DriverError> {
        let mut state = self.state.lock();
        state.calls.push(DriverCall::CheckStream(stream));
        match state.stream_error {
            Some(code) => Err(DriverError::Cuda {
                code,
                name: "CUDA_ERROR_LAUNCH_FAILED".to_string(),
                context: "cuStreamQuery".to_string(),
            }),
            None => Ok(()),
        }
    }

    fn stream_synchronize(&self, stream: StreamHandle) -> Result<(), DriverError> {
        self.record(DriverCall::Synchronize(stream));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ArgList;

    #[test]
    fn test_globals_follow_image_content() {
        let driver = RecordingDriver::new()
            .with_image(b"img-a", [("smemSize", u32_global(1024))])
            .with_image(b"img-b", Vec::<(String, Vec<u8>)>::new());

        let a = driver.load_module(b"img-a").unwrap();
        let b = driver.load_module(b"img-b").unwrap();
        let unknown = driver.load_module(b"other").unwrap();

        assert_eq!(driver.read_global(a, "smemSize").unwrap(), Some(u32_global(1024)));
        assert_eq!(driver.read_global(b, "smemSize").unwrap(), None);
        assert_eq!(driver.read_global(unknown, "smemSize").unwrap(), None);
        assert_eq!(driver.load_count(), 3);
    }

    #[test]
    fn test_failing_symbol_and_recovery() {
        let driver = RecordingDriver::new().failing_symbol("kernel_mha");
        let m = driver.load_module(b"x").unwrap();
        assert!(driver.get_function(m, "kernel_mha").is_err());
        driver.clear_failures();
        let f = driver.get_function(m, "kernel_mha").unwrap();
        assert_eq!(driver.function_symbol(f).as_deref(), Some("kernel_mha"));
    }

    #[test]
    fn test_launch_is_recorded() {
        let driver = RecordingDriver::new();
        let m = driver.load_module(b"x").unwrap();
        let f = driver.get_function(m, "k").unwrap();
        let mut v = 42u32;
        let mut list = ArgList::new();
        list.push(&mut v).unwrap();
        let mut args = list.finish();
        let cfg = LaunchConfig {
            grid_dim: (1, 2, 3),
            block_dim: (128, 1, 2),
            shared_mem_bytes: 0,
        };
        unsafe { driver.launch_kernel(f, &cfg, StreamHandle(7), &mut args).unwrap() };

        let launches = driver.launches();
        assert_eq!(launches.len(), 1);
        assert_eq!(launches[0].symbol, "k");
        assert_eq!(launches[0].args, vec![42u32.to_ne_bytes().to_vec()]);
        assert!(launches[0].null_terminated);
        assert_eq!(launches[0].stream, StreamHandle(7));
    }
}
