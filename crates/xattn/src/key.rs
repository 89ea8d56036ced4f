//! Variant key: the structural identity of one compiled kernel configuration.
//!
//! [`VariantKey::for_request`] is the only way to derive a key from a request, so selection
//! and launch cannot disagree on which kernel a request maps to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dtype::DataType;
use crate::error::DispatchError;
use crate::request::AttentionRequest;
use crate::Result;

/// `heads_per_kv` value of multi-token kernels: any power-of-two head ratio.
pub const ANY_POWER_OF_TWO: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VariantKey {
    pub kv_cache_data_type: DataType,
    pub head_dim: u32,
    pub beam_width: u32,
    pub heads_per_kv: u32,
    pub m_tile_size: u32,
    /// Tokens per page, 0 when the cache is not paged.
    pub tokens_per_page: u32,
    pub paged_kv_cache: bool,
    pub multi_query_tokens: bool,
}

impl VariantKey {
    pub fn for_request(request: &AttentionRequest) -> Result<Self> {
        let ratio = heads_per_kv(request.num_q_heads, request.num_kv_heads)?;
        let (heads_per_kv, m_tile_size) = if request.multi_query_tokens {
            (ANY_POWER_OF_TWO, m_tile_for_tokens(request.q_seq_len()))
        } else {
            (ratio, ratio)
        };
        Ok(Self {
            kv_cache_data_type: request.kv_cache_data_type,
            head_dim: request.head_size,
            beam_width: request.beam_width,
            heads_per_kv,
            m_tile_size,
            tokens_per_page: if request.paged_kv_cache { request.tokens_per_block } else { 0 },
            paged_kv_cache: request.paged_kv_cache,
            multi_query_tokens: request.multi_query_tokens,
        })
    }
}

impl fmt::Display for VariantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kv={} head_dim={} beam={} heads_per_kv={} m_tile={} page={}{}",
            self.kv_cache_data_type,
            self.head_dim,
            self.beam_width,
            self.heads_per_kv,
            self.m_tile_size,
            self.tokens_per_page,
            if self.multi_query_tokens { " multi_token" } else { "" },
        )
    }
}

/// Row tile of multi-token kernels for `q_seq_len` query tokens per sequence.
pub fn m_tile_for_tokens(q_seq_len: u32) -> u32 {
    if q_seq_len <= 16 {
        16
    } else {
        32
    }
}

/// `num_q_heads / num_kv_heads`, which must divide evenly.
pub fn heads_per_kv(num_q_heads: u32, num_kv_heads: u32) -> Result<u32> {
    if num_kv_heads == 0 || num_q_heads % num_kv_heads != 0 {
        return Err(DispatchError::Precondition(format!(
            "numQHeads should be multiple of numKVHeads (got {} q heads, {} kv heads)",
            num_q_heads, num_kv_heads
        )));
    }
    Ok(num_q_heads / num_kv_heads)
}
