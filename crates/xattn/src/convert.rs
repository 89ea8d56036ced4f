//! fp8 output conversion.

use xattn_driver::{DevicePtr, Driver, StreamHandle};

use crate::dtype::DataType;
use crate::request::AttentionRequest;
use crate::workspace::LaunchParams;
use crate::Result;

/// The external cast kernel writing e4m3 output.
pub trait OutputConverter: Send + Sync {
    /// Enqueue `dst[i] = fp8(src[i] * scale)` for `elems` elements of `source` type.
    fn convert_to_fp8(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        elems: usize,
        scale: DevicePtr,
        source: DataType,
        stream: StreamHandle,
    ) -> Result<()>;

    /// Whether fp8 output can be served at all. Checked before any work is enqueued.
    fn supports_fp8_output(&self) -> bool {
        true
    }
}

/// Converter for deployments that never request fp8 output.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoConversion;

impl OutputConverter for NoConversion {
    fn supports_fp8_output(&self) -> bool {
        false
    }

    fn convert_to_fp8(
        &self,
        _dst: DevicePtr,
        _src: DevicePtr,
        _elems: usize,
        _scale: DevicePtr,
        source: DataType,
        _stream: StreamHandle,
    ) -> Result<()> {
        Err(crate::DispatchError::Config(format!(
            "fp8 output requested for {} attention but no output converter is installed",
            source
        )))
    }
}

/// Elements the kernel wrote for `request`.
pub fn output_elems(request: &AttentionRequest) -> usize {
    request.head_size as usize * request.num_q_heads as usize * request.total_num_input_tokens as usize
}

/// Refuse an fp8-output request up front when `converter` cannot serve it.
pub fn check_converter(converter: &dyn OutputConverter, request: &AttentionRequest) -> Result<()> {
    if request.needs_output_conversion() && !converter.supports_fp8_output() {
        return Err(crate::DispatchError::Config(
            "fp8 output requested but no output converter is installed".into(),
        ));
    }
    Ok(())
}

/// Convert the staged kernel output into the caller's fp8 output buffer.
pub fn convert_output(
    driver: &dyn Driver,
    converter: &dyn OutputConverter,
    request: &AttentionRequest,
    launch: &LaunchParams,
    source: DataType,
    stream: StreamHandle,
) -> Result<()> {
    let Some(scale) = request.fp8_out_scale else {
        return Ok(());
    };
    converter.convert_to_fp8(request.output, launch.output, output_elems(request), scale, source, stream)?;
    driver.check_stream(stream)?;
    Ok(())
}
