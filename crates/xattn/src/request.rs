//! The caller's description of one attention invocation.

use serde::{Deserialize, Serialize};
use xattn_driver::DevicePtr;

use crate::dtype::{DataType, KvCacheQuant};
use crate::error::DispatchError;
use crate::Result;

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotaryScaling {
    #[default]
    None = 0,
    Linear = 1,
    Dynamic = 2,
}

#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionEmbedding {
    #[default]
    LearnedAbsolute = 0,
    RopeGptj = 1,
    RopeGptNeox = 2,
    Alibi = 3,
    AlibiWithScale = 4,
    Relative = 5,
}

/// Rotary position embedding settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotaryConfig {
    pub dim: u32,
    pub base: f32,
    pub scale: f32,
    pub scaling: RotaryScaling,
    pub max_positions: u32,
}

impl Default for RotaryConfig {
    fn default() -> Self {
        Self {
            dim: 0,
            base: 10000.0,
            scale: 1.0,
            scaling: RotaryScaling::None,
            max_positions: 2048,
        }
    }
}

/// One attention invocation.
///
/// Sizes are in elements or tokens unless named `_bytes`. Device pointers that a
/// configuration does not use stay [`DevicePtr::NULL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AttentionRequest {
    pub kv_cache_data_type: DataType,
    pub kv_cache_quant: KvCacheQuant,

    pub head_size: u32,
    pub num_q_heads: u32,
    pub num_kv_heads: u32,
    pub beam_width: u32,
    pub batch_size: u32,

    /// Tokens already in the cache for the longest sequence (history length).
    pub timestep: u32,
    /// Query tokens per sequence in this call; 1 for plain decode.
    pub generation_input_length: u32,
    pub total_num_input_tokens: u32,
    pub max_attention_window_size: u32,
    pub cyclic_attention_window_size: u32,
    pub sink_token_length: u32,

    pub paged_kv_cache: bool,
    pub tokens_per_block: u32,
    pub multi_query_tokens: bool,
    pub multi_block_mode: bool,

    pub rotary: RotaryConfig,
    pub position_embedding: PositionEmbedding,
    pub position_shift_enabled: bool,

    pub output: DevicePtr,
    pub qkv: DevicePtr,
    pub qkv_bias: DevicePtr,
    pub sequence_lengths: DevicePtr,
    pub context_lengths: DevicePtr,
    pub cache_indirection: DevicePtr,
    pub kv_scale_orig_quant: DevicePtr,
    pub kv_scale_quant_orig: DevicePtr,
    pub spec_decoding_packed_mask: DevicePtr,
    pub spec_decoding_position_offsets: DevicePtr,
    /// Scale of the fp8 output; `Some` requests the output conversion pass.
    pub fp8_out_scale: Option<DevicePtr>,

    pub workspace: DevicePtr,
    pub workspace_bytes: usize,
}

impl Default for AttentionRequest {
    fn default() -> Self {
        Self {
            kv_cache_data_type: DataType::Fp16,
            kv_cache_quant: KvCacheQuant::None,
            head_size: 128,
            num_q_heads: 32,
            num_kv_heads: 32,
            beam_width: 1,
            batch_size: 1,
            timestep: 0,
            generation_input_length: 1,
            total_num_input_tokens: 1,
            max_attention_window_size: 4096,
            cyclic_attention_window_size: 4096,
            sink_token_length: 0,
            paged_kv_cache: false,
            tokens_per_block: 64,
            multi_query_tokens: false,
            multi_block_mode: false,
            rotary: RotaryConfig::default(),
            position_embedding: PositionEmbedding::default(),
            position_shift_enabled: false,
            output: DevicePtr::NULL,
            qkv: DevicePtr::NULL,
            qkv_bias: DevicePtr::NULL,
            sequence_lengths: DevicePtr::NULL,
            context_lengths: DevicePtr::NULL,
            cache_indirection: DevicePtr::NULL,
            kv_scale_orig_quant: DevicePtr::NULL,
            kv_scale_quant_orig: DevicePtr::NULL,
            spec_decoding_packed_mask: DevicePtr::NULL,
            spec_decoding_position_offsets: DevicePtr::NULL,
            fp8_out_scale: None,
            workspace: DevicePtr::NULL,
            workspace_bytes: 0,
        }
    }
}

impl AttentionRequest {
    /// Query heads served by each KV head.
    pub fn heads_per_kv(&self) -> Result<u32> {
        crate::key::heads_per_kv(self.num_q_heads, self.num_kv_heads)
    }

    /// Sequences in the batch including beams. Exact once [`validate`](Self::validate) passed.
    pub fn batch_beam(&self) -> u32 {
        self.batch_size.saturating_mul(self.beam_width)
    }

    /// Query tokens across the batch, as preprocessing counts them.
    pub fn token_num(&self) -> u32 {
        self.batch_beam().saturating_mul(self.generation_input_length)
    }

    /// Query tokens per sequence, at least 1.
    pub fn q_seq_len(&self) -> u32 {
        self.generation_input_length.max(1)
    }

    pub fn needs_output_conversion(&self) -> bool {
        self.fp8_out_scale.map_or(false, |p| !p.is_null())
    }

    /// Shape checks every launch depends on.
    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("head_size", self.head_size),
            ("num_q_heads", self.num_q_heads),
            ("num_kv_heads", self.num_kv_heads),
            ("beam_width", self.beam_width),
            ("batch_size", self.batch_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(DispatchError::Precondition(format!("{} must be non-zero", name)));
            }
        }
        self.heads_per_kv()?;
        let batch_beam = self.batch_size.checked_mul(self.beam_width).ok_or_else(|| {
            DispatchError::Precondition(format!(
                "batch_size {} x beam_width {} overflows",
                self.batch_size, self.beam_width
            ))
        })?;
        batch_beam.checked_mul(self.q_seq_len()).ok_or_else(|| {
            DispatchError::Precondition(format!(
                "{} sequences x {} query tokens overflows",
                batch_beam,
                self.q_seq_len()
            ))
        })?;
        if self.paged_kv_cache && self.tokens_per_block == 0 {
            return Err(DispatchError::Precondition(
                "tokens_per_block must be non-zero for a paged KV cache".into(),
            ));
        }
        if self.multi_query_tokens && self.beam_width != 1 {
            return Err(DispatchError::Precondition(
                "multi-token decoding requires beam_width == 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_from_partial_json() {
        let req: AttentionRequest = serde_json::from_str(
            r#"{ "num_q_heads": 32, "num_kv_heads": 4, "batch_size": 8,
                 "kv_cache_data_type": "e4m3", "fp8_out_scale": 4096 }"#,
        )
        .unwrap();
        assert_eq!(req.heads_per_kv().unwrap(), 8);
        assert_eq!(req.kv_cache_data_type, DataType::E4m3);
        assert!(req.needs_output_conversion());
        assert_eq!(req.head_size, 128);
    }

    #[test]
    fn test_validate() {
        assert!(AttentionRequest::default().validate().is_ok());
        let req = AttentionRequest { batch_size: 0, ..Default::default() };
        assert!(matches!(req.validate(), Err(DispatchError::Precondition(_))));
        let req = AttentionRequest { num_q_heads: 33, num_kv_heads: 4, ..Default::default() };
        assert!(matches!(req.validate(), Err(DispatchError::Precondition(_))));
    }

    #[test]
    fn test_validate_rejects_overflowing_token_count() {
        let req = AttentionRequest { batch_size: 1 << 20, beam_width: 1 << 12, ..Default::default() };
        assert!(matches!(req.validate(), Err(DispatchError::Precondition(_))));
        assert_eq!(req.batch_beam(), u32::MAX);

        let req = AttentionRequest {
            batch_size: 1 << 16,
            multi_query_tokens: true,
            generation_input_length: 1 << 16,
            ..Default::default()
        };
        assert!(matches!(req.validate(), Err(DispatchError::Precondition(_))));
        assert_eq!(req.token_num(), u32::MAX);

        let req = AttentionRequest { batch_size: 1 << 16, generation_input_length: 1 << 15, ..Default::default() };
        assert!(req.validate().is_ok());
        assert_eq!(req.token_num(), 1 << 31);
    }
}
