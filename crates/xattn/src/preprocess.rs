//! Device preprocessing run before every launch.
//!
//! Two passes, enqueued in order on the caller's stream:
//! 1. decoder info: per-sequence query offsets and the rotary inverse-frequency table;
//! 2. QKV preprocessing: rotate and re-layout Q into the kernel input buffer, append K/V to
//!    the cache.
//!
//! The passes themselves are external kernels behind [`DevicePreprocessor`]; this module
//! builds their parameters. The KV cache must already hold the current step when the
//! attention kernel runs.

use xattn_driver::{DevicePtr, Driver, StreamHandle};

use crate::dtype::CacheElementKind;
use crate::kv_cache::KvCacheView;
use crate::request::{AttentionRequest, PositionEmbedding, RotaryScaling};
use crate::workspace::LaunchParams;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderInfoParams {
    /// Output: prefix sums of query lengths, `batch_size + 1` entries.
    pub seq_q_offsets: DevicePtr,
    pub seq_kv_lengths: DevicePtr,
    /// Sequences, i.e. batch × beam.
    pub batch_size: u32,
    pub max_q_seq_length: u32,
    pub rotary_dim: u32,
    pub rotary_base: f32,
    pub rotary_scale: f32,
    pub rotary_scaling: RotaryScaling,
    pub rotary_max_positions: u32,
    /// Output: rotary inverse frequencies.
    pub rotary_inv_freq: DevicePtr,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QkvPreprocessingParams<'a> {
    pub qkv_input: DevicePtr,
    pub q_output: DevicePtr,
    pub kv_cache: KvCacheView<'a>,
    pub qkv_bias: DevicePtr,
    pub seq_lens: DevicePtr,
    pub rotary_inv_freq: DevicePtr,
    pub kv_scale_orig_quant: DevicePtr,
    pub spec_decoding_position_offsets: DevicePtr,
    pub batch_size: u32,
    pub max_input_seq_len: u32,
    pub max_kv_seq_len: u32,
    pub cyclic_kv_cache_len: u32,
    pub sink_token_len: u32,
    pub token_num: u32,
    pub head_num: u32,
    pub kv_head_num: u32,
    pub qheads_per_kv_head: u32,
    pub size_per_head: u32,
    pub rotary_dim: u32,
    pub rotary_base: f32,
    pub rotary_scaling: RotaryScaling,
    pub rotary_scale: f32,
    pub rotary_max_positions: u32,
    pub position_embedding: PositionEmbedding,
    pub position_shift_enabled: bool,
    pub cache_kind: CacheElementKind,
    pub separate_q_kv_output: bool,
    pub quantized_fp8_output: bool,
    pub multiprocessor_count: u32,
}

/// The external preprocessing kernels.
pub trait DevicePreprocessor: Send + Sync {
    fn build_decoder_info(&self, params: &DecoderInfoParams, stream: StreamHandle) -> Result<()>;

    fn qkv_preprocessing(&self, params: &QkvPreprocessingParams<'_>, stream: StreamHandle) -> Result<()>;
}

pub fn decoder_info_params(request: &AttentionRequest, launch: &LaunchParams) -> DecoderInfoParams {
    DecoderInfoParams {
        seq_q_offsets: launch.cu_seq_lens,
        seq_kv_lengths: request.sequence_lengths,
        batch_size: request.batch_beam(),
        max_q_seq_length: request.generation_input_length,
        rotary_dim: request.rotary.dim,
        rotary_base: request.rotary.base,
        rotary_scale: request.rotary.scale,
        rotary_scaling: request.rotary.scaling,
        rotary_max_positions: request.rotary.max_positions,
        rotary_inv_freq: launch.rotary_inv_freq,
    }
}

pub fn qkv_preprocessing_params<'a>(
    request: &AttentionRequest,
    launch: &LaunchParams,
    kv_cache: KvCacheView<'a>,
    multiprocessor_count: u32,
) -> Result<QkvPreprocessingParams<'a>> {
    let batch_beam = request.batch_beam();
    Ok(QkvPreprocessingParams {
        qkv_input: request.qkv,
        q_output: launch.q_input,
        kv_cache,
        qkv_bias: request.qkv_bias,
        seq_lens: request.sequence_lengths,
        rotary_inv_freq: launch.rotary_inv_freq,
        kv_scale_orig_quant: request.kv_scale_orig_quant,
        spec_decoding_position_offsets: request.spec_decoding_position_offsets,
        batch_size: batch_beam,
        max_input_seq_len: request.generation_input_length,
        max_kv_seq_len: request.timestep,
        cyclic_kv_cache_len: request.cyclic_attention_window_size,
        sink_token_len: request.sink_token_length,
        token_num: request.token_num(),
        head_num: request.num_q_heads,
        kv_head_num: request.num_kv_heads,
        qheads_per_kv_head: request.heads_per_kv()?,
        size_per_head: request.head_size,
        rotary_dim: request.rotary.dim,
        rotary_base: request.rotary.base,
        rotary_scaling: request.rotary.scaling,
        rotary_scale: request.rotary.scale,
        rotary_max_positions: request.rotary.max_positions,
        position_embedding: request.position_embedding,
        position_shift_enabled: request.position_shift_enabled,
        cache_kind: request.kv_cache_quant.cache_element_kind(),
        separate_q_kv_output: true,
        quantized_fp8_output: false,
        multiprocessor_count,
    })
}

/// Enqueue both passes, checking the stream after each.
pub fn run_preprocessing(
    driver: &dyn Driver,
    preprocessor: &dyn DevicePreprocessor,
    request: &AttentionRequest,
    launch: &LaunchParams,
    kv_cache: KvCacheView<'_>,
    multiprocessor_count: u32,
    stream: StreamHandle,
) -> Result<()> {
    preprocessor.build_decoder_info(&decoder_info_params(request, launch), stream)?;
    driver.check_stream(stream)?;

    let params = qkv_preprocessing_params(request, launch, kv_cache, multiprocessor_count)?;
    preprocessor.qkv_preprocessing(&params, stream)?;
    driver.check_stream(stream)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtype::KvCacheQuant;
    use crate::kv_cache::KvLinearBuffer;
    use crate::request::RotaryConfig;

    fn request() -> AttentionRequest {
        AttentionRequest {
            num_q_heads: 32,
            num_kv_heads: 8,
            batch_size: 2,
            beam_width: 2,
            generation_input_length: 1,
            timestep: 77,
            kv_cache_quant: KvCacheQuant::Int8,
            rotary: RotaryConfig { dim: 64, ..Default::default() },
            position_embedding: PositionEmbedding::RopeGptNeox,
            workspace: DevicePtr(0x100_0000),
            workspace_bytes: 1 << 24,
            sequence_lengths: DevicePtr(0x500),
            ..Default::default()
        }
    }

    #[test]
    fn test_params_follow_request() {
        let req = request();
        let linear = KvLinearBuffer { data: DevicePtr(0x8000), max_seq_len: 128, bytes_per_seq: 0 };
        let launch = LaunchParams::build(&req, &linear, 2, 8).unwrap();

        let info = decoder_info_params(&req, &launch);
        assert_eq!(info.batch_size, 4);
        assert_eq!(info.seq_q_offsets, launch.cu_seq_lens);
        assert_eq!(info.rotary_inv_freq, launch.rotary_inv_freq);
        assert_eq!(info.seq_kv_lengths, DevicePtr(0x500));

        let qkv = qkv_preprocessing_params(&req, &launch, KvCacheView::Linear(&linear), 132).unwrap();
        assert_eq!(qkv.q_output, launch.io_scratch);
        assert_eq!(qkv.token_num, 4);
        assert_eq!(qkv.qheads_per_kv_head, 4);
        assert_eq!(qkv.cache_kind, CacheElementKind::Int8);
        assert!(qkv.separate_q_kv_output);
        assert!(!qkv.quantized_fp8_output);
        assert_eq!(qkv.max_kv_seq_len, 77);
    }
}
