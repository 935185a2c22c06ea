use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Element types a tensor can carry.
///
/// `BFloat8B` and `BFloat4B` are lossy block-floating-point formats: sixteen
/// values share one exponent. They only exist in tile layout and are stored as
/// packed `u32` words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    /// 16-bit brain float
    BFloat16,
    /// 32-bit IEEE 754 single-precision float
    Float32,
    /// 32-bit unsigned integer
    UInt32,
    /// 32-bit signed integer
    Int32,
    /// 16-bit unsigned integer
    UInt16,
    /// 8-bit unsigned integer
    UInt8,
    /// Block float: shared 8-bit exponent per 16 values, sign + 7-bit mantissa each
    BFloat8B,
    /// Block float: shared 8-bit exponent per 16 values, sign + 3-bit mantissa each
    BFloat4B,
}

/// Words per 32×32 tile for block-float formats: 16 words of shared exponents
/// followed by the packed mantissas.
const BFP8_WORDS_PER_TILE: usize = 16 + 1024 / 4;
const BFP4_WORDS_PER_TILE: usize = 16 + 1024 / 8;

impl DType {
    /// Size in bytes of a single element, or None for block-float types.
    pub fn element_size(&self) -> Option<usize> {
        match self {
            DType::BFloat16 | DType::UInt16 => Some(2),
            DType::Float32 | DType::UInt32 | DType::Int32 => Some(4),
            DType::UInt8 => Some(1),
            DType::BFloat8B | DType::BFloat4B => None,
        }
    }

    /// Number of buffer elements needed to hold `volume` logical values.
    ///
    /// For block-float types this is the number of `u32` words, rounded up to
    /// whole tiles.
    pub fn buffer_elements(&self, volume: usize) -> usize {
        match self {
            DType::BFloat8B => volume.div_ceil(1024) * BFP8_WORDS_PER_TILE,
            DType::BFloat4B => volume.div_ceil(1024) * BFP4_WORDS_PER_TILE,
            _ => volume,
        }
    }

    /// Number of bytes needed to store `volume` values of this dtype.
    pub fn storage_bytes(&self, volume: usize) -> usize {
        match self.element_size() {
            Some(size) => size * volume,
            None => self.buffer_elements(volume) * 4,
        }
    }

    /// The dtype of the host buffer that backs tensors of this dtype.
    pub fn buffer_dtype(&self) -> DType {
        match self {
            DType::BFloat8B | DType::BFloat4B => DType::UInt32,
            other => *other,
        }
    }

    /// Whether this dtype is a floating-point type (block floats included).
    pub fn is_float(&self) -> bool {
        matches!(self, DType::BFloat16 | DType::Float32 | DType::BFloat8B | DType::BFloat4B)
    }

    /// Whether this dtype is an integer type.
    pub fn is_integer(&self) -> bool {
        matches!(self, DType::UInt32 | DType::Int32 | DType::UInt16 | DType::UInt8)
    }

    /// Whether this dtype is a lossy block-float packed type.
    pub fn is_block_float(&self) -> bool {
        matches!(self, DType::BFloat8B | DType::BFloat4B)
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DType::BFloat16 => write!(f, "bfloat16"),
            DType::Float32 => write!(f, "float32"),
            DType::UInt32 => write!(f, "uint32"),
            DType::Int32 => write!(f, "int32"),
            DType::UInt16 => write!(f, "uint16"),
            DType::UInt8 => write!(f, "uint8"),
            DType::BFloat8B => write!(f, "bfloat8_b"),
            DType::BFloat4B => write!(f, "bfloat4_b"),
        }
    }
}

impl FromStr for DType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bfloat16" | "bf16" => Ok(DType::BFloat16),
            "float32" | "f32" => Ok(DType::Float32),
            "uint32" | "u32" => Ok(DType::UInt32),
            "int32" | "i32" => Ok(DType::Int32),
            "uint16" | "u16" => Ok(DType::UInt16),
            "uint8" | "u8" => Ok(DType::UInt8),
            "bfloat8_b" | "bfp8" => Ok(DType::BFloat8B),
            "bfloat4_b" | "bfp4" => Ok(DType::BFloat4B),
            other => Err(format!("unknown dtype '{other}'")),
        }
    }
}
