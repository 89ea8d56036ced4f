//! Launch strategies: argument layout and grid geometry of the two kernel families.
//!
//! Slot order is the kernels' ABI. Every argument lives in a local that outlives the
//! [`ArgList`] borrowing it.

use xattn_driver::{
    ArgList, DevicePtr, Driver, LaunchConfig, StreamHandle, Swizzle, TensorMap, TensorMapDataType,
    TensorMapDesc,
};

use crate::dtype::{DataType, SmVersion};
use crate::error::DispatchError;
use crate::key::m_tile_for_tokens;
use crate::kv_cache::{KvCacheParams, KvCacheView};
use crate::registry::{FunctionInfo, KernelFamily, LaunchStrategy};
use crate::request::AttentionRequest;
use crate::workspace::LaunchParams;
use crate::Result;

pub const THREADS_PER_WARP_GROUP: u32 = 128;
pub const DECODE_MAX_SLOTS: usize = 10;
pub const DECODE_TMA_MAX_SLOTS: usize = 11;
pub const SPECULATIVE_SLOTS: usize = 10;

/// Fixed KV dequantization scale of multi-token kernels (quantized KV is not supported there).
const SPECULATIVE_KV_SCALE: f32 = 1.0;

/// Grid, block and dynamic shared memory of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchGeometry {
    pub grid: (u32, u32, u32),
    pub block: (u32, u32, u32),
    pub shared_mem_bytes: u32,
}

impl LaunchGeometry {
    pub fn config(&self) -> LaunchConfig {
        LaunchConfig {
            grid_dim: self.grid,
            block_dim: self.block,
            shared_mem_bytes: self.shared_mem_bytes,
        }
    }
}

/// Geometry of `info`'s kernel for `request` split into `multi_block` blocks per sequence.
pub fn plan_geometry(info: &FunctionInfo, request: &AttentionRequest, multi_block: u32) -> Result<LaunchGeometry> {
    let multi_block = multi_block.max(1);
    let (grid, block) = match info.strategy {
        LaunchStrategy::Decode { .. } => {
            let warp_groups = match info.family {
                KernelFamily::HopperWarpSpecialized => 3,
                KernelFamily::WarpSpecialized => 2,
            };
            (
                (multi_block, request.num_kv_heads, request.batch_size),
                (THREADS_PER_WARP_GROUP, 1, warp_groups),
            )
        }
        LaunchStrategy::Speculative => {
            let log2_ratio = log2_heads_per_kv(request)?;
            let q_seq_len = request.q_seq_len();
            let m_tile = m_tile_for_tokens(q_seq_len);
            let token_blocks = ((q_seq_len as u64) << log2_ratio).div_ceil(m_tile as u64);
            let grid_y = u32::try_from(request.num_kv_heads as u64 * token_blocks).map_err(|_| {
                DispatchError::Precondition(format!("grid y of {} token blocks overflows", token_blocks))
            })?;
            (
                (multi_block, grid_y, request.batch_size),
                (THREADS_PER_WARP_GROUP, 1, 2),
            )
        }
    };
    if grid.1 == 0 || grid.2 == 0 {
        return Err(DispatchError::Precondition(format!("empty grid {:?}", grid)));
    }
    Ok(LaunchGeometry { grid, block, shared_mem_bytes: info.shared_mem_bytes })
}

fn log2_heads_per_kv(request: &AttentionRequest) -> Result<u32> {
    let ratio = request.heads_per_kv()?;
    if !ratio.is_power_of_two() {
        return Err(DispatchError::Precondition(format!(
            "multi-token kernels need a power-of-two head ratio, got {}",
            ratio
        )));
    }
    Ok(ratio.trailing_zeros())
}

/// TMA kernels exist exactly for sm_90 with an e4m3 cache and no beam search.
fn check_family(info: &FunctionInfo, arch: SmVersion, request: &AttentionRequest) -> Result<()> {
    let is_tma = info.family == KernelFamily::HopperWarpSpecialized;
    let expected = arch == SmVersion::SM_90
        && request.kv_cache_data_type == DataType::E4m3
        && request.beam_width == 1;
    if is_tma != expected {
        return Err(DispatchError::Invariant(format!(
            "kernel family {:?} does not match {} with {} cache and beam width {}",
            info.family, arch, request.kv_cache_data_type, request.beam_width
        )));
    }
    Ok(())
}

/// Single-token decode launch.
#[allow(clippy::too_many_arguments)]
pub fn launch_decode(
    driver: &dyn Driver,
    info: &FunctionInfo,
    arch: SmVersion,
    request: &AttentionRequest,
    params: &LaunchParams,
    tensor_map_view: Option<KvCacheView<'_>>,
    pool: DevicePtr,
    multi_block: u32,
    stream: StreamHandle,
) -> Result<()> {
    check_family(info, arch, request)?;
    let geometry = plan_geometry(info, request, multi_block)?;

    let mut tensor_map: Option<TensorMap> = match tensor_map_view {
        Some(view) => Some(driver.encode_tensor_map(&kv_tensor_map_desc(request, view, pool)?)?),
        None => None,
    };
    let mut num_kv_heads = params.num_kv_heads;
    let mut output = params.output;
    let mut q_input = params.q_input;
    let mut kv_cache = params.kv_cache;
    let mut beam_search = params.beam_search;
    let mut batch_size = params.batch_size;
    let mut kv_scale_quant_orig = params.kv_scale_quant_orig;
    let mut semaphores = params.semaphores;
    let mut scratch = params.scratch;

    let max_slots = if tensor_map.is_some() { DECODE_TMA_MAX_SLOTS } else { DECODE_MAX_SLOTS };
    let mut args = ArgList::with_max_slots(max_slots);
    args.push(&mut num_kv_heads)?;
    args.push(&mut output)?;
    args.push(&mut q_input)?;
    match &mut kv_cache {
        KvCacheParams::Linear(p) => args.push(p)?,
        KvCacheParams::Paged(p) => args.push(p)?,
    }
    if let Some(beam) = beam_search.as_mut() {
        args.push(beam)?;
    }
    args.push(&mut batch_size)?;
    args.push(&mut kv_scale_quant_orig)?;
    if let Some(map) = tensor_map.as_mut() {
        args.push(map)?;
    }
    args.push(&mut semaphores)?;
    args.push(&mut scratch)?;
    let mut args = args.finish();

    tracing::debug!("Decode launch: grid {:?}, block {:?}, {} args", geometry.grid, geometry.block, args.len());
    // Safety: slot order and types match the decode kernel ABI; addresses come from the
    // request and the validated workspace.
    unsafe { driver.launch_kernel(info.function, &geometry.config(), stream, &mut args)? };
    Ok(())
}

/// Multi-token (speculative decoding) launch.
pub fn launch_speculative(
    driver: &dyn Driver,
    info: &FunctionInfo,
    request: &AttentionRequest,
    params: &LaunchParams,
    multi_block: u32,
    stream: StreamHandle,
) -> Result<()> {
    let geometry = plan_geometry(info, request, multi_block)?;

    if request.multi_block_mode {
        let counters = std::mem::size_of::<u32>() * request.batch_size as usize * request.num_kv_heads as usize;
        driver.memset_async(params.scratch, 0, counters, stream)?;
        driver.check_stream(stream)?;
    }

    let mut q_seq_len = request.q_seq_len();
    let mut num_kv_heads = params.num_kv_heads;
    let mut log2_ratio = log2_heads_per_kv(request)?;
    let mut output = params.output;
    let mut q_input = params.q_input;
    let mut mask = request.spec_decoding_packed_mask;
    let mut kv_cache = params.kv_cache;
    let mut batch_size = params.batch_size;
    let mut kv_scale = SPECULATIVE_KV_SCALE;
    let mut scratch = params.scratch;

    let mut args = ArgList::with_max_slots(SPECULATIVE_SLOTS);
    args.push(&mut q_seq_len)?;
    args.push(&mut num_kv_heads)?;
    args.push(&mut log2_ratio)?;
    args.push(&mut output)?;
    args.push(&mut q_input)?;
    args.push(&mut mask)?;
    match &mut kv_cache {
        KvCacheParams::Linear(p) => args.push(p)?,
        KvCacheParams::Paged(p) => args.push(p)?,
    }
    args.push(&mut batch_size)?;
    args.push(&mut kv_scale)?;
    args.push(&mut scratch)?;
    let mut args = args.finish();

    tracing::debug!("Speculative launch: grid {:?}, block {:?}", geometry.grid, geometry.block);
    // Safety: slot order and types match the multi-token kernel ABI.
    unsafe { driver.launch_kernel(info.function, &geometry.config(), stream, &mut args)? };
    Ok(())
}

/// 4-D tiled descriptor over the KV cache for TMA kernels.
///
/// Dimensions, innermost first: head bytes, tokens per page (or cache capacity),
/// KV heads, pages (or K/V slabs of every sequence).
pub fn kv_tensor_map_desc(
    request: &AttentionRequest,
    view: KvCacheView<'_>,
    pool: DevicePtr,
) -> Result<TensorMapDesc> {
    let data_type = TensorMapDataType::UInt8;
    let elem_bytes = data_type.elem_bytes() as u64;
    let head_bytes = request.head_size as u64 * request.kv_cache_data_type.element_size() as u64;
    let head_elems = head_bytes / elem_bytes;
    let kv_heads = request.num_kv_heads as u64;

    let (tokens, outer) = match view {
        KvCacheView::Paged(blocks) => (blocks.tokens_per_block as u64, 1u64 << 31),
        KvCacheView::Linear(linear) => (linear.max_seq_len as u64, 2 * request.batch_beam() as u64),
    };

    let part_bytes = head_bytes.min(128);
    let swizzle = match part_bytes {
        128 => Swizzle::B128,
        64 => Swizzle::B64,
        other => {
            return Err(DispatchError::Invariant(format!(
                "no swizzle mode for {}-byte head rows",
                other
            )))
        }
    };

    Ok(TensorMapDesc {
        data_type,
        rank: 4,
        global_address: pool,
        global_dims: [head_elems, tokens, kv_heads, outer, 0],
        global_strides: [head_bytes, head_bytes * tokens, head_bytes * tokens * kv_heads, 0],
        box_dims: [(part_bytes / elem_bytes) as u32, tokens.min(64) as u32, 1, 1, 0],
        element_strides: [1, 1, 1, 1, 0],
        swizzle,
    })
}
