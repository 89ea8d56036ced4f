//! Element types and target architectures.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DispatchError;

/// Element types of registries and KV caches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    /// 16-bit IEEE 754 half-precision float
    Fp16,
    /// 16-bit Brain Float
    Bf16,
    /// 32-bit IEEE 754 single-precision float
    Fp32,
    /// 8-bit float, 4 exponent bits and 3 mantissa bits
    E4m3,
    /// 8-bit signed integer
    Int8,
}

impl DataType {
    /// Size in bytes of a single element.
    pub fn element_size(&self) -> usize {
        match self {
            DataType::Fp16 | DataType::Bf16 => 2,
            DataType::Fp32 => 4,
            DataType::E4m3 | DataType::Int8 => 1,
        }
    }

    /// Whether kernels of this registry type exist at all (activations are half precision).
    pub fn is_activation_type(&self) -> bool {
        matches!(self, DataType::Fp16 | DataType::Bf16)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataType::Fp16 => "fp16",
            DataType::Bf16 => "bf16",
            DataType::Fp32 => "fp32",
            DataType::E4m3 => "e4m3",
            DataType::Int8 => "int8",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for DataType {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fp16" | "f16" | "half" => Ok(DataType::Fp16),
            "bf16" => Ok(DataType::Bf16),
            "fp32" | "f32" | "float" => Ok(DataType::Fp32),
            "e4m3" | "fp8" => Ok(DataType::E4m3),
            "int8" | "i8" => Ok(DataType::Int8),
            other => Err(DispatchError::Config(format!("unknown data type '{}'", other))),
        }
    }
}

/// Target architecture id, `major * 10 + minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SmVersion(pub u32);

impl SmVersion {
    pub const SM_80: SmVersion = SmVersion(80);
    pub const SM_86: SmVersion = SmVersion(86);
    pub const SM_89: SmVersion = SmVersion(89);
    pub const SM_90: SmVersion = SmVersion(90);

    pub fn from_capability(major: u32, minor: u32) -> Self {
        SmVersion(major * 10 + minor)
    }
}

impl fmt::Display for SmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sm{}", self.0)
    }
}

impl FromStr for SmVersion {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s.trim_start_matches("sm_").trim_start_matches("sm");
        digits
            .parse::<u32>()
            .map(SmVersion)
            .map_err(|_| DispatchError::Config(format!("invalid architecture '{}'", s)))
    }
}

/// Quantization applied to the KV cache of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KvCacheQuant {
    #[default]
    None,
    Int8,
    Fp8,
}

impl KvCacheQuant {
    pub fn cache_element_kind(&self) -> CacheElementKind {
        match self {
            KvCacheQuant::None => CacheElementKind::Base,
            KvCacheQuant::Int8 => CacheElementKind::Int8,
            KvCacheQuant::Fp8 => CacheElementKind::Fp8,
        }
    }
}

/// Element encoding the preprocessing pass writes into the KV cache.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheElementKind {
    Base = 0,
    Int8 = 1,
    Fp8 = 2,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_size() {
        assert_eq!(DataType::Fp16.element_size(), 2);
        assert_eq!(DataType::Bf16.element_size(), 2);
        assert_eq!(DataType::E4m3.element_size(), 1);
    }

    #[test]
    fn test_parse_display() {
        for dt in [DataType::Fp16, DataType::Bf16, DataType::Fp32, DataType::E4m3, DataType::Int8] {
            assert_eq!(dt.to_string().parse::<DataType>().unwrap(), dt);
        }
        assert!("fp64".parse::<DataType>().is_err());
    }

    #[test]
    fn test_sm_version() {
        assert_eq!(SmVersion::from_capability(9, 0), SmVersion::SM_90);
        assert_eq!(SmVersion::from_capability(8, 6), SmVersion::SM_86);
        assert_eq!("sm_89".parse::<SmVersion>().unwrap(), SmVersion::SM_89);
        assert_eq!("sm80".parse::<SmVersion>().unwrap(), SmVersion::SM_80);
        assert_eq!(SmVersion::SM_90.to_string(), "sm90");
    }

    #[test]
    fn test_cache_element_kind() {
        assert_eq!(KvCacheQuant::None.cache_element_kind(), CacheElementKind::Base);
        assert_eq!(KvCacheQuant::Fp8.cache_element_kind(), CacheElementKind::Fp8);
    }
}
