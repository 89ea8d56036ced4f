//! Occupancy heuristics: the perf gate and the multi-block split.
//!
//! Both are integer estimates. They decide which path runs and how wide the grid is,
//! never what the kernel computes.

use crate::config::DispatchConfig;
use crate::request::AttentionRequest;

/// Blocks the generic decode path would launch for `request`.
pub fn estimated_block_count(request: &AttentionRequest, config: &DispatchConfig) -> u64 {
    let multi_block_factor = if request.multi_block_mode {
        (request.timestep / config.min_history_tokens_per_block.max(1)).max(1)
    } else {
        1
    };
    request.num_kv_heads as u64 * request.batch_size as u64 * multi_block_factor as u64
}

/// Whether the precompiled kernel is expected to beat the generic path on a device with
/// `multiprocessor_count` SMs.
pub fn may_have_perf_gain(
    request: &AttentionRequest,
    multiprocessor_count: u32,
    config: &DispatchConfig,
) -> bool {
    // Only precompiled kernels implement multi-token decoding.
    if config.force_precompiled || request.multi_query_tokens {
        return true;
    }
    let blocks = estimated_block_count(request, config);
    blocks as f64 * config.enable_min_block_factor as f64 >= multiprocessor_count as f64
}

/// Cooperating blocks per sequence along grid x. Always at least 1 and non-decreasing in
/// the history length.
pub fn multi_block_count(
    request: &AttentionRequest,
    multiprocessor_count: u32,
    config: &DispatchConfig,
) -> u32 {
    if !request.multi_block_mode {
        return 1;
    }
    if let Some(fixed) = config.blocks_per_sequence {
        return fixed.max(1);
    }
    let by_history = (request.timestep / config.min_history_tokens_per_block.max(1)).max(1);
    let ctas = (request.batch_size as u64 * request.num_kv_heads as u64).max(1);
    let wave_cap = (config.target_wave_factor as u64 * multiprocessor_count as u64 / ctas).max(1);
    let count = (by_history as u64).min(wave_cap).clamp(1, config.max_blocks_per_sequence.max(1) as u64);
    count as u32
}
