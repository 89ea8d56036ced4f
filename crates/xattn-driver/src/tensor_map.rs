//! Tiled tensor-map descriptors for TMA-capable kernels.

use bytemuck::{Pod, Zeroable};

use crate::DevicePtr;

/// Element type of a tiled tensor map. Discriminants are the driver's encoding.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TensorMapDataType {
    UInt8 = 0,
    UInt16 = 1,
    UInt32 = 2,
    Int32 = 3,
    UInt64 = 4,
    Int64 = 5,
    Float16 = 6,
    Float32 = 7,
    Float64 = 8,
    BFloat16 = 9,
    Float32Ftz = 10,
    TFloat32 = 11,
    TFloat32Ftz = 12,
}

impl TensorMapDataType {
    pub fn elem_bytes(&self) -> u32 {
        match self {
            TensorMapDataType::UInt8 => 1,
            TensorMapDataType::UInt16 | TensorMapDataType::Float16 | TensorMapDataType::BFloat16 => 2,
            TensorMapDataType::UInt32
            | TensorMapDataType::Int32
            | TensorMapDataType::Float32
            | TensorMapDataType::Float32Ftz
            | TensorMapDataType::TFloat32
            | TensorMapDataType::TFloat32Ftz => 4,
            TensorMapDataType::UInt64 | TensorMapDataType::Int64 | TensorMapDataType::Float64 => 8,
        }
    }
}

/// Shared-memory swizzle pattern of the box.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Swizzle {
    None = 0,
    B32 = 1,
    B64 = 2,
    B128 = 3,
}

/// Everything the driver needs to encode a tiled tensor map.
///
/// Only the first `rank` entries of each array are meaningful; `global_strides` holds
/// `rank - 1` byte strides (the innermost dimension is dense).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TensorMapDesc {
    pub data_type: TensorMapDataType,
    pub rank: u32,
    pub global_address: DevicePtr,
    pub global_dims: [u64; 5],
    pub global_strides: [u64; 4],
    pub box_dims: [u32; 5],
    pub element_strides: [u32; 5],
    pub swizzle: Swizzle,
}

/// Opaque 128-byte encoded descriptor, passed to kernels by value.
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct TensorMap {
    pub opaque: [u64; 16],
}

// Safety: a 64-byte aligned array of integers with no padding.
unsafe impl Zeroable for TensorMap {}
unsafe impl Pod for TensorMap {}

impl TensorMap {
    pub fn zeroed() -> Self {
        <Self as Zeroable>::zeroed()
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }
}

impl std::fmt::Debug for TensorMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorMap").finish_non_exhaustive()
    }
}
