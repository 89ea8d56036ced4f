//! Carving of the caller-provided workspace and the per-call launch parameters.
//!
//! Regions, in order, each starting on a 256-byte boundary:
//! semaphores, `cu_seq_lens`, rotary inverse frequencies, kernel I/O scratch,
//! multi-block scratch (everything that is left).

use bytemuck::{Pod, Zeroable};
use xattn_driver::DevicePtr;

use crate::error::DispatchError;
use crate::kv_cache::{KvCacheBuffer, KvCacheParams};
use crate::request::AttentionRequest;
use crate::Result;

pub const WORKSPACE_ALIGNMENT: usize = 256;

/// Bytes of partial state one cooperating block keeps per query row besides its output:
/// running max and running sum.
const PARTIAL_STATS_BYTES: usize = 2 * std::mem::size_of::<f32>();

fn align_up(bytes: usize) -> usize {
    bytes.saturating_add(WORKSPACE_ALIGNMENT - 1) / WORKSPACE_ALIGNMENT * WORKSPACE_ALIGNMENT
}

/// Saturating product, so an oversized request asks for more workspace than any caller has.
fn bytes_of(factors: &[usize]) -> usize {
    factors.iter().fold(1usize, |acc, f| acc.saturating_mul(*f))
}

/// Byte offsets of each workspace region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkspaceLayout {
    pub semaphores: usize,
    pub cu_seq_lens: usize,
    pub rotary_inv_freq: usize,
    pub io_scratch: usize,
    pub io_scratch_bytes: usize,
    pub scratch: usize,
    /// Smallest multi-block scratch the request can run with.
    pub min_scratch_bytes: usize,
}

impl WorkspaceLayout {
    /// Layout for `request` with activations of `elem_size` bytes and at most
    /// `max_blocks_per_sequence` cooperating blocks.
    pub fn for_request(request: &AttentionRequest, elem_size: usize, max_blocks_per_sequence: u32) -> Self {
        let batch = request.batch_size as usize;
        let batch_beam = request.batch_beam() as usize;
        let kv_heads = request.num_kv_heads as usize;
        let q_heads = request.num_q_heads as usize;
        let head = request.head_size as usize;
        let q_seq = request.q_seq_len() as usize;

        let semaphores = 0;
        let semaphores_bytes = bytes_of(&[std::mem::size_of::<u32>(), batch, kv_heads]);

        let cu_seq_lens = semaphores + align_up(semaphores_bytes);
        let cu_seq_lens_bytes = bytes_of(&[std::mem::size_of::<i32>(), batch_beam.saturating_add(1)]);

        let rotary_inv_freq = cu_seq_lens.saturating_add(align_up(cu_seq_lens_bytes));
        let rotary_bytes = bytes_of(&[std::mem::size_of::<f32>(), batch_beam, request.rotary.dim as usize / 2]);

        let io_scratch = rotary_inv_freq.saturating_add(align_up(rotary_bytes));
        let io_scratch_bytes = bytes_of(&[elem_size, batch_beam, q_seq, q_heads + 2 * kv_heads, head]);

        let scratch = io_scratch.saturating_add(align_up(io_scratch_bytes));
        let min_scratch_bytes = if request.multi_block_mode {
            // Block counters first, then per-block partial rows.
            let counters = align_up(bytes_of(&[std::mem::size_of::<u32>(), batch, kv_heads]));
            let rows = bytes_of(&[batch_beam, q_heads, q_seq, max_blocks_per_sequence.max(1) as usize]);
            counters.saturating_add(bytes_of(&[rows, head * std::mem::size_of::<f32>() + PARTIAL_STATS_BYTES]))
        } else {
            0
        };

        Self {
            semaphores,
            cu_seq_lens,
            rotary_inv_freq,
            io_scratch,
            io_scratch_bytes,
            scratch,
            min_scratch_bytes,
        }
    }

    /// Minimum workspace size in bytes.
    pub fn required_bytes(&self) -> usize {
        self.scratch.saturating_add(self.min_scratch_bytes)
    }
}

/// `BeamSearchParams` kernel argument.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct BeamSearchParams {
    pub indices: DevicePtr,
    pub capacity: u32,
    pub _pad: u32,
    pub ctx_len_list: DevicePtr,
}

/// Everything one launch reads, resolved from the request and the workspace.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LaunchParams {
    /// Where the kernel writes; the I/O scratch when output conversion follows.
    pub output: DevicePtr,
    /// Rotated query written by preprocessing.
    pub q_input: DevicePtr,
    pub io_scratch: DevicePtr,
    pub cu_seq_lens: DevicePtr,
    pub rotary_inv_freq: DevicePtr,
    pub semaphores: DevicePtr,
    pub scratch: DevicePtr,
    pub batch_size: u32,
    pub num_kv_heads: u32,
    pub kv_scale_quant_orig: DevicePtr,
    pub kv_cache: KvCacheParams,
    pub beam_search: Option<BeamSearchParams>,
}

impl LaunchParams {
    pub fn build<B: KvCacheBuffer>(
        request: &AttentionRequest,
        kv_cache: &B,
        elem_size: usize,
        max_blocks_per_sequence: u32,
    ) -> Result<Self> {
        let layout = WorkspaceLayout::for_request(request, elem_size, max_blocks_per_sequence);
        if request.workspace.is_null() {
            return Err(DispatchError::Precondition("workspace pointer is null".into()));
        }
        if request.workspace_bytes < layout.required_bytes() {
            return Err(DispatchError::Precondition(format!(
                "workspace of {} bytes is smaller than the {} bytes required",
                request.workspace_bytes,
                layout.required_bytes()
            )));
        }

        let base = request.workspace;
        let io_scratch = base.offset(layout.io_scratch);
        let output = if request.needs_output_conversion() { io_scratch } else { request.output };
        let beam_search = (request.beam_width > 1).then(|| BeamSearchParams {
            indices: request.cache_indirection,
            capacity: request.max_attention_window_size,
            _pad: 0,
            ctx_len_list: request.context_lengths,
        });

        Ok(Self {
            output,
            q_input: io_scratch,
            io_scratch,
            cu_seq_lens: base.offset(layout.cu_seq_lens),
            rotary_inv_freq: base.offset(layout.rotary_inv_freq),
            semaphores: base.offset(layout.semaphores),
            scratch: base.offset(layout.scratch),
            batch_size: request.batch_size,
            num_kv_heads: request.num_kv_heads,
            kv_scale_quant_orig: request.kv_scale_quant_orig,
            kv_cache: kv_cache.kernel_params(request),
            beam_search,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv_cache::KvLinearBuffer;

    fn linear() -> KvLinearBuffer {
        KvLinearBuffer { data: DevicePtr(0xa000_0000), max_seq_len: 4096, bytes_per_seq: 1 << 20 }
    }

    #[test]
    fn test_regions_aligned_and_ordered() {
        let req = AttentionRequest {
            num_q_heads: 32,
            num_kv_heads: 4,
            batch_size: 3,
            rotary: crate::request::RotaryConfig { dim: 128, ..Default::default() },
            multi_block_mode: true,
            ..Default::default()
        };
        let layout = WorkspaceLayout::for_request(&req, 2, 8);
        let offsets = [layout.semaphores, layout.cu_seq_lens, layout.rotary_inv_freq, layout.io_scratch, layout.scratch];
        assert!(offsets.windows(2).all(|w| w[0] < w[1]));
        assert!(offsets.iter().all(|o| o % WORKSPACE_ALIGNMENT == 0));
        // 3 × 1 × 1 × (32 + 8) × 128 × 2
        assert_eq!(layout.io_scratch_bytes, 30720);
        assert!(layout.min_scratch_bytes >= 4 * 3 * 4);
    }

    #[test]
    fn test_oversized_request_saturates() {
        let req = AttentionRequest {
            num_q_heads: u32::MAX,
            num_kv_heads: 1,
            head_size: u32::MAX,
            batch_size: u32::MAX,
            multi_block_mode: true,
            ..Default::default()
        };
        let layout = WorkspaceLayout::for_request(&req, 2, 8);
        assert!(layout.required_bytes() >= usize::MAX - WORKSPACE_ALIGNMENT);
    }

    #[test]
    fn test_no_multi_block_scratch_without_mode() {
        let layout = WorkspaceLayout::for_request(&AttentionRequest::default(), 2, 8);
        assert_eq!(layout.min_scratch_bytes, 0);
        assert_eq!(layout.required_bytes(), layout.scratch);
    }

    #[test]
    fn test_build_rejects_small_workspace() {
        let mut req = AttentionRequest { workspace: DevicePtr(0x1000), workspace_bytes: 16, ..Default::default() };
        assert!(matches!(
            LaunchParams::build(&req, &linear(), 2, 8),
            Err(DispatchError::Precondition(_))
        ));
        req.workspace = DevicePtr::NULL;
        req.workspace_bytes = 1 << 30;
        assert!(LaunchParams::build(&req, &linear(), 2, 8).is_err());
    }

    #[test]
    fn test_output_redirected_for_conversion() {
        let mut req = AttentionRequest {
            output: DevicePtr(0xdead_0000),
            workspace: DevicePtr(0x10_0000),
            workspace_bytes: 1 << 24,
            ..Default::default()
        };
        let params = LaunchParams::build(&req, &linear(), 2, 8).unwrap();
        assert_eq!(params.output, req.output);
        assert_eq!(params.beam_search, None);

        req.fp8_out_scale = Some(DevicePtr(0x40));
        req.beam_width = 2;
        let params = LaunchParams::build(&req, &linear(), 2, 8).unwrap();
        assert_eq!(params.output, params.io_scratch);
        assert_eq!(params.q_input, params.io_scratch);
        assert_eq!(params.beam_search.unwrap().capacity, 4096);
    }
}
