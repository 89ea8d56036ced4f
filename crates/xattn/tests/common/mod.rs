//! Shared fixtures: a synthetic kernel catalog, a recording driver preloaded with its
//! images, and recording preprocessing/conversion collaborators.

#![allow(dead_code)]

use std::sync::Arc;

use parking_lot::Mutex;
use xattn::catalog::{Catalog, ImageId, KernelImage, KernelMeta};
use xattn::convert::OutputConverter;
use xattn::preprocess::{DecoderInfoParams, DevicePreprocessor, QkvPreprocessingParams};
use xattn::registry::{KERNEL_TYPE_SYMBOL, SMEM_SIZE_SYMBOL};
use xattn::{
    AttentionRequest, DataType, DevicePtr, DispatchConfig, KvBlockArray, KvLinearBuffer,
    PrecompiledAttention, RegistryCache, SmVersion, StreamHandle,
};
use xattn_driver::mock::{u32_global, RecordingDriver};

pub static IMG_GENERIC: &[u8] = b"sm80-fp16-generic";
pub static IMG_BEAM: &[u8] = b"sm80-fp16-beam";
pub static IMG_SPEC: &[u8] = b"sm80-fp16-multi-token";
pub static IMG_SM90_GENERIC: &[u8] = b"sm90-fp16-generic";
pub static IMG_SM90_TMA: &[u8] = b"sm90-fp16-tma";

pub const BEAM_SMEM: u32 = 50 * 1024;
pub const TMA_SMEM: u32 = 60 * 1024;

pub const STREAM: StreamHandle = StreamHandle(0x5eed);

fn image(id: u32, bytes: &'static [u8]) -> Option<KernelImage> {
    Some(KernelImage { id: ImageId(id), bytes })
}

#[allow(clippy::too_many_arguments)]
fn entry(
    arch: SmVersion,
    kv: DataType,
    head_dim: u32,
    beam_width: u32,
    heads_per_kv: u32,
    m_tile_size: u32,
    tokens_per_page: u32,
    multi_query_tokens: bool,
    symbol: &'static str,
    image: Option<KernelImage>,
) -> KernelMeta {
    KernelMeta {
        arch,
        data_type: DataType::Fp16,
        kv_cache_data_type: kv,
        head_dim,
        beam_width,
        heads_per_kv,
        m_tile_size,
        tokens_per_page,
        paged_kv_cache: tokens_per_page != 0,
        multi_query_tokens,
        symbol,
        image,
    }
}

pub fn catalog_entries() -> Vec<KernelMeta> {
    use DataType::*;
    let sm80 = SmVersion::SM_80;
    let sm90 = SmVersion::SM_90;
    vec![
        entry(sm80, Fp16, 128, 1, 8, 8, 0, false, "mha_fp16_hd128_r8", image(0, IMG_GENERIC)),
        entry(sm80, Fp16, 128, 1, 8, 8, 64, false, "mha_fp16_hd128_r8_p64", image(0, IMG_GENERIC)),
        entry(sm80, Fp16, 128, 1, 4, 4, 0, false, "mha_fp16_hd128_r4", image(0, IMG_GENERIC)),
        entry(sm80, Int8, 128, 1, 8, 8, 0, false, "mha_int8kv_hd128_r8", image(0, IMG_GENERIC)),
        entry(sm80, Fp16, 128, 4, 1, 1, 0, false, "mha_fp16_hd128_beam4", image(1, IMG_BEAM)),
        entry(sm80, Fp16, 128, 1, 0, 16, 0, true, "mha_fp16_hd128_mt16", image(2, IMG_SPEC)),
        entry(sm80, Fp16, 128, 1, 0, 32, 0, true, "mha_fp16_hd128_mt32", image(2, IMG_SPEC)),
        entry(sm80, Fp16, 256, 1, 1, 1, 0, false, "mha_fp16_hd256_excluded", None),
        entry(sm90, Fp16, 128, 1, 8, 8, 0, false, "mha_sm90_fp16_hd128_r8", image(3, IMG_SM90_GENERIC)),
        entry(sm90, E4m3, 128, 1, 8, 8, 64, false, "mha_sm90_e4m3_hd128_r8_p64", image(4, IMG_SM90_TMA)),
    ]
}

pub fn catalog() -> Catalog {
    Catalog::new(catalog_entries())
}

/// Recording driver reporting capability `major.minor` with every fixture image registered.
pub fn driver(major: u32, minor: u32) -> Arc<RecordingDriver> {
    Arc::new(
        RecordingDriver::new()
            .with_capability(major, minor)
            .with_multiprocessor_count(132)
            .with_image(IMG_GENERIC, [(SMEM_SIZE_SYMBOL, u32_global(16 * 1024))])
            .with_image(IMG_BEAM, [(SMEM_SIZE_SYMBOL, u32_global(BEAM_SMEM))])
            .with_image(
                IMG_SPEC,
                [(SMEM_SIZE_SYMBOL, u32_global(32 * 1024)), (KERNEL_TYPE_SYMBOL, u32_global(0))],
            )
            .with_image(IMG_SM90_GENERIC, [(SMEM_SIZE_SYMBOL, u32_global(24 * 1024))])
            .with_image(
                IMG_SM90_TMA,
                [(SMEM_SIZE_SYMBOL, u32_global(TMA_SMEM)), (KERNEL_TYPE_SYMBOL, u32_global(1))],
            ),
    )
}

pub fn cache(driver: &Arc<RecordingDriver>, config: DispatchConfig) -> Arc<RegistryCache> {
    Arc::new(RegistryCache::new(driver.clone(), catalog(), config))
}

#[derive(Debug, Clone, PartialEq)]
pub enum Pass {
    DecoderInfo(DecoderInfoParams),
    Qkv { q_output: DevicePtr, token_num: u32, paged: bool },
}

#[derive(Default)]
pub struct RecordingPreprocessor {
    pub passes: Mutex<Vec<Pass>>,
}

impl DevicePreprocessor for RecordingPreprocessor {
    fn build_decoder_info(&self, params: &DecoderInfoParams, _stream: StreamHandle) -> xattn::Result<()> {
        self.passes.lock().push(Pass::DecoderInfo(*params));
        Ok(())
    }

    fn qkv_preprocessing(&self, params: &QkvPreprocessingParams<'_>, _stream: StreamHandle) -> xattn::Result<()> {
        self.passes.lock().push(Pass::Qkv {
            q_output: params.q_output,
            token_num: params.token_num,
            paged: matches!(params.kv_cache, xattn::kv_cache::KvCacheView::Paged(_)),
        });
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub dst: DevicePtr,
    pub src: DevicePtr,
    pub elems: usize,
    pub scale: DevicePtr,
    pub source: DataType,
    pub stream: StreamHandle,
}

#[derive(Default)]
pub struct RecordingConverter {
    pub conversions: Mutex<Vec<Conversion>>,
}

impl OutputConverter for RecordingConverter {
    fn convert_to_fp8(
        &self,
        dst: DevicePtr,
        src: DevicePtr,
        elems: usize,
        scale: DevicePtr,
        source: DataType,
        stream: StreamHandle,
    ) -> xattn::Result<()> {
        self.conversions.lock().push(Conversion { dst, src, elems, scale, source, stream });
        Ok(())
    }
}

pub struct Harness {
    pub driver: Arc<RecordingDriver>,
    pub cache: Arc<RegistryCache>,
    pub preprocessor: Arc<RecordingPreprocessor>,
    pub converter: Arc<RecordingConverter>,
    pub attention: PrecompiledAttention,
}

pub fn harness(major: u32, minor: u32, config: DispatchConfig) -> Harness {
    let driver = driver(major, minor);
    let cache = cache(&driver, config);
    let preprocessor = Arc::new(RecordingPreprocessor::default());
    let converter = Arc::new(RecordingConverter::default());
    let attention = PrecompiledAttention::new(
        cache.clone(),
        preprocessor.clone(),
        converter.clone(),
        DataType::Fp16,
    )
    .unwrap();
    Harness { driver, cache, preprocessor, converter, attention }
}

/// GQA decode: 32 query heads over 4 KV heads, head size 128, batch 2.
pub fn decode_request() -> AttentionRequest {
    AttentionRequest {
        num_q_heads: 32,
        num_kv_heads: 4,
        head_size: 128,
        batch_size: 2,
        timestep: 1000,
        total_num_input_tokens: 2,
        output: DevicePtr(0x0a00_0000),
        qkv: DevicePtr(0x0b00_0000),
        sequence_lengths: DevicePtr(0x0c00_0000),
        kv_scale_quant_orig: DevicePtr(0x0d00_0000),
        workspace: DevicePtr(0x1000_0000),
        workspace_bytes: 64 << 20,
        ..Default::default()
    }
}

pub fn linear_cache() -> KvLinearBuffer {
    KvLinearBuffer { data: DevicePtr(0x2000_0000), max_seq_len: 4096, bytes_per_seq: 4096 * 4 * 128 * 2 * 2 }
}

pub fn paged_cache(tokens_per_block: u32) -> KvBlockArray {
    KvBlockArray {
        pool: DevicePtr(0x3000_0000),
        block_offsets: DevicePtr(0x3f00_0000),
        max_blocks_per_seq: 64,
        tokens_per_block,
        bytes_per_block: tokens_per_block as usize * 4 * 128 * 2,
    }
}

pub fn u32_arg(value: u32) -> Vec<u8> {
    value.to_ne_bytes().to_vec()
}

pub fn ptr_arg(ptr: DevicePtr) -> Vec<u8> {
    bytemuck::bytes_of(&ptr).to_vec()
}
