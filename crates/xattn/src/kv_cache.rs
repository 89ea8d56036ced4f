//! KV-cache views handed in by the caller.
//!
//! Storage is owned elsewhere; this module only knows the addresses the kernels and the
//! preprocessing pass need.

use bytemuck::{Pod, Zeroable};
use serde::{Deserialize, Serialize};
use xattn_driver::DevicePtr;

use crate::error::DispatchError;
use crate::request::AttentionRequest;
use crate::Result;

/// Contiguous cache: one fixed-capacity slab per sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvLinearBuffer {
    pub data: DevicePtr,
    pub max_seq_len: u32,
    /// Slab size, holding K then V for `max_seq_len` tokens.
    pub bytes_per_seq: usize,
}

/// Paged cache: a pool of fixed-size blocks and a per-sequence block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvBlockArray {
    pub pool: DevicePtr,
    pub block_offsets: DevicePtr,
    pub max_blocks_per_seq: u32,
    pub tokens_per_block: u32,
    /// Size of one K or V block.
    pub bytes_per_block: usize,
}

/// Bytes one token of K (or V) occupies across all KV heads.
fn token_bytes(request: &AttentionRequest) -> usize {
    (request.num_kv_heads as usize)
        .saturating_mul(request.head_size as usize)
        .saturating_mul(request.kv_cache_data_type.element_size())
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct LinearKvParams {
    pub data: DevicePtr,
    pub seq_lens: DevicePtr,
    pub capacity: u32,
    pub _pad: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct PagedKvParams {
    pub pool: DevicePtr,
    pub page_list: DevicePtr,
    pub seq_lens: DevicePtr,
    pub max_pages_per_seq: u32,
    pub _pad: u32,
}

/// The by-value cache argument of a kernel launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheParams {
    Linear(LinearKvParams),
    Paged(PagedKvParams),
}

/// Borrowed view passed to the preprocessing pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvCacheView<'a> {
    Linear(&'a KvLinearBuffer),
    Paged(&'a KvBlockArray),
}

pub trait KvCacheBuffer {
    fn view(&self) -> KvCacheView<'_>;

    fn kernel_params(&self, request: &AttentionRequest) -> KvCacheParams;

    /// Base address the TMA descriptor covers.
    fn pool(&self) -> DevicePtr;

    /// Reject a request whose cache configuration does not describe this buffer.
    fn check_request(&self, request: &AttentionRequest) -> Result<()>;
}

impl KvCacheBuffer for KvLinearBuffer {
    fn view(&self) -> KvCacheView<'_> {
        KvCacheView::Linear(self)
    }

    fn kernel_params(&self, request: &AttentionRequest) -> KvCacheParams {
        KvCacheParams::Linear(LinearKvParams {
            data: self.data,
            seq_lens: request.sequence_lengths,
            capacity: self.max_seq_len,
            _pad: 0,
        })
    }

    fn pool(&self) -> DevicePtr {
        self.data
    }

    fn check_request(&self, request: &AttentionRequest) -> Result<()> {
        if request.paged_kv_cache {
            return Err(DispatchError::Precondition(
                "request declares a paged KV cache but a linear buffer was supplied".into(),
            ));
        }
        let needed = token_bytes(request).saturating_mul(self.max_seq_len as usize).saturating_mul(2);
        if self.bytes_per_seq < needed {
            return Err(DispatchError::Precondition(format!(
                "linear KV buffer holds {} bytes per sequence, {} tokens of K and V need {}",
                self.bytes_per_seq, self.max_seq_len, needed
            )));
        }
        Ok(())
    }
}

impl KvCacheBuffer for KvBlockArray {
    fn view(&self) -> KvCacheView<'_> {
        KvCacheView::Paged(self)
    }

    fn kernel_params(&self, request: &AttentionRequest) -> KvCacheParams {
        KvCacheParams::Paged(PagedKvParams {
            pool: self.pool,
            page_list: self.block_offsets,
            seq_lens: request.sequence_lengths,
            max_pages_per_seq: self.max_blocks_per_seq,
            _pad: 0,
        })
    }

    fn pool(&self) -> DevicePtr {
        self.pool
    }

    fn check_request(&self, request: &AttentionRequest) -> Result<()> {
        if !request.paged_kv_cache {
            return Err(DispatchError::Precondition(
                "request declares a linear KV cache but a block array was supplied".into(),
            ));
        }
        if request.tokens_per_block != self.tokens_per_block {
            return Err(DispatchError::Precondition(format!(
                "request tokens_per_block {} does not match the block array ({})",
                request.tokens_per_block, self.tokens_per_block
            )));
        }
        let needed = token_bytes(request).saturating_mul(self.tokens_per_block as usize);
        if self.bytes_per_block < needed {
            return Err(DispatchError::Precondition(format!(
                "KV blocks of {} bytes cannot hold {} tokens ({} bytes)",
                self.bytes_per_block, self.tokens_per_block, needed
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_layout() {
        assert_eq!(std::mem::size_of::<LinearKvParams>(), 24);
        assert_eq!(std::mem::size_of::<PagedKvParams>(), 32);
    }

    #[test]
    fn test_paged_mismatch() {
        let blocks = KvBlockArray {
            pool: DevicePtr(0x1000),
            block_offsets: DevicePtr(0x2000),
            max_blocks_per_seq: 16,
            tokens_per_block: 64,
            bytes_per_block: 64 * 32 * 128 * 2,
        };
        let req = AttentionRequest { paged_kv_cache: true, tokens_per_block: 32, ..Default::default() };
        assert!(blocks.check_request(&req).is_err());
        let req = AttentionRequest { paged_kv_cache: true, tokens_per_block: 64, ..Default::default() };
        assert!(blocks.check_request(&req).is_ok());
        assert!(KvLinearBuffer { data: DevicePtr(1), max_seq_len: 8, bytes_per_seq: 8 }
            .check_request(&req)
            .is_err());
    }

    #[test]
    fn test_capacity_covers_request() {
        let req = AttentionRequest { num_kv_heads: 4, ..Default::default() };
        // 1024 tokens × 4 heads × 128 × fp16, for K and V.
        let mut linear =
            KvLinearBuffer { data: DevicePtr(0x1000), max_seq_len: 1024, bytes_per_seq: 1024 * 4 * 128 * 2 * 2 };
        assert!(linear.check_request(&req).is_ok());
        linear.bytes_per_seq -= 1;
        assert!(matches!(linear.check_request(&req), Err(DispatchError::Precondition(_))));
        // An 8-bit cache needs half.
        let fp8 = AttentionRequest { kv_cache_data_type: crate::dtype::DataType::E4m3, ..req.clone() };
        assert!(linear.check_request(&fp8).is_ok());

        let paged_req = AttentionRequest { paged_kv_cache: true, tokens_per_block: 32, ..req };
        let mut blocks = KvBlockArray {
            pool: DevicePtr(0x1000),
            block_offsets: DevicePtr(0x2000),
            max_blocks_per_seq: 8,
            tokens_per_block: 32,
            bytes_per_block: 32 * 4 * 128 * 2,
        };
        assert!(blocks.check_request(&paged_req).is_ok());
        blocks.bytes_per_block /= 2;
        assert!(matches!(blocks.check_request(&paged_req), Err(DispatchError::Precondition(_))));
    }
}
