//! # tilemesh-bfp
//!
//! Lossy block-floating-point packing for tiled f32 data.
//!
//! Every run of 16 consecutive values (one face row of a tiled buffer) shares
//! a single 8-bit exponent; each value keeps a sign bit and a short mantissa:
//! - `Bfp8`: 7 mantissa bits, 272 `u32` words per 32x32 tile
//! - `Bfp4`: 3 mantissa bits, 144 `u32` words per 32x32 tile
//!
//! A packed tile is 16 words of exponents (four per word, low byte first)
//! followed by the mantissa words.

pub mod encoder;
pub mod packing;

use std::fmt;

pub use packing::{pack_tiles, unpack_tiles};

/// Values per tile.
pub const TILE_VOLUME: usize = 1024;
/// Values sharing one exponent.
pub const GROUP_SIZE: usize = 16;
/// Exponent words at the head of every packed tile.
pub const EXPONENT_WORDS: usize = TILE_VOLUME / GROUP_SIZE / 4;

/// The two block-float encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockFloat {
    Bfp8,
    Bfp4,
}

impl BlockFloat {
    /// Magnitude bits per value, sign excluded.
    pub fn mantissa_bits(self) -> u32 {
        match self {
            BlockFloat::Bfp8 => 7,
            BlockFloat::Bfp4 => 3,
        }
    }

    /// Bits per packed value, sign included.
    pub fn value_bits(self) -> u32 {
        self.mantissa_bits() + 1
    }

    pub fn values_per_word(self) -> usize {
        (32 / self.value_bits()) as usize
    }

    pub fn words_per_tile(self) -> usize {
        EXPONENT_WORDS + TILE_VOLUME / self.values_per_word()
    }

    /// Largest representable mantissa magnitude.
    pub fn max_mantissa(self) -> u32 {
        (1 << self.mantissa_bits()) - 1
    }
}

impl fmt::Display for BlockFloat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockFloat::Bfp8 => write!(f, "bfloat8_b"),
            BlockFloat::Bfp4 => write!(f, "bfloat4_b"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BfpError {
    #[error("{len} values do not fill whole 1024-value tiles")]
    PartialTile { len: usize },

    #[error("{len} words are not a whole number of {format} tiles ({words_per_tile} words each)")]
    PartialPackedTile {
        len: usize,
        format: BlockFloat,
        words_per_tile: usize,
    },
}

pub type Result<T> = std::result::Result<T, BfpError>;
