//! Tile-level packing of tiled f32 buffers into block-float words.

use rayon::prelude::*;

use crate::encoder::{decode_value, encode_value, shared_exponent};
use crate::{BfpError, BlockFloat, Result, EXPONENT_WORDS, GROUP_SIZE, TILE_VOLUME};

/// Pack a tiled f32 buffer, 1024 values per tile, into block-float words.
///
/// Input must already be in tile order (faces row-major within each tile) so
/// that every 16 consecutive values form one face row.
pub fn pack_tiles(data: &[f32], format: BlockFloat) -> Result<Vec<u32>> {
    if data.len() % TILE_VOLUME != 0 {
        return Err(BfpError::PartialTile { len: data.len() });
    }
    let words_per_tile = format.words_per_tile();
    let num_tiles = data.len() / TILE_VOLUME;
    let mut packed = vec![0u32; num_tiles * words_per_tile];
    packed
        .par_chunks_mut(words_per_tile)
        .zip(data.par_chunks(TILE_VOLUME))
        .for_each(|(out, tile)| pack_tile(tile, format, out));
    tracing::trace!("packed {num_tiles} tiles as {format} ({} words)", packed.len());
    Ok(packed)
}

/// Expand block-float words back to tiled f32 values.
pub fn unpack_tiles(words: &[u32], format: BlockFloat) -> Result<Vec<f32>> {
    let words_per_tile = format.words_per_tile();
    if words.len() % words_per_tile != 0 {
        return Err(BfpError::PartialPackedTile {
            len: words.len(),
            format,
            words_per_tile,
        });
    }
    let num_tiles = words.len() / words_per_tile;
    let mut values = vec![0f32; num_tiles * TILE_VOLUME];
    values
        .par_chunks_mut(TILE_VOLUME)
        .zip(words.par_chunks(words_per_tile))
        .for_each(|(out, tile)| unpack_tile(tile, format, out));
    Ok(values)
}

fn pack_tile(tile: &[f32], format: BlockFloat, out: &mut [u32]) {
    let (exponents, mantissas) = out.split_at_mut(EXPONENT_WORDS);
    let per_word = format.values_per_word();
    let bits = format.value_bits() as usize;
    for (g, group) in tile.chunks(GROUP_SIZE).enumerate() {
        let shared = shared_exponent(group);
        exponents[g / 4] |= (shared as u32) << (8 * (g % 4));
        for (i, &value) in group.iter().enumerate() {
            let n = g * GROUP_SIZE + i;
            let code = encode_value(value, shared, format) as u32;
            mantissas[n / per_word] |= code << (bits * (n % per_word));
        }
    }
}

fn unpack_tile(words: &[u32], format: BlockFloat, out: &mut [f32]) {
    let (exponents, mantissas) = words.split_at(EXPONENT_WORDS);
    let per_word = format.values_per_word();
    let bits = format.value_bits() as usize;
    let mask = (1u32 << bits) - 1;
    for (g, group) in out.chunks_mut(GROUP_SIZE).enumerate() {
        let shared = (exponents[g / 4] >> (8 * (g % 4))) as u8;
        for (i, value) in group.iter_mut().enumerate() {
            let n = g * GROUP_SIZE + i;
            let code = (mantissas[n / per_word] >> (bits * (n % per_word))) & mask;
            *value = decode_value(code as u8, shared, format);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_layout() {
        let data = vec![1.0f32; TILE_VOLUME];
        let packed = pack_tiles(&data, BlockFloat::Bfp8).unwrap();
        assert_eq!(packed.len(), 272);
        // Four exponents of 127 per word.
        assert!(packed[..EXPONENT_WORDS].iter().all(|&w| w == 0x7f7f_7f7f));
        // Four mantissas of 64 per word.
        assert!(packed[EXPONENT_WORDS..].iter().all(|&w| w == 0x4040_4040));
    }

    #[test]
    fn test_exact_tiles_survive() {
        let data: Vec<f32> = (0..2 * TILE_VOLUME).map(|i| if i % 2 == 0 { 1.5 } else { -0.75 }).collect();
        for format in [BlockFloat::Bfp8, BlockFloat::Bfp4] {
            let packed = pack_tiles(&data, format).unwrap();
            assert_eq!(packed.len(), 2 * format.words_per_tile());
            assert_eq!(unpack_tiles(&packed, format).unwrap(), data);
        }
    }

    #[test]
    fn test_zero_tile() {
        let packed = pack_tiles(&[0.0; TILE_VOLUME], BlockFloat::Bfp4).unwrap();
        assert!(packed.iter().all(|&w| w == 0));
        assert!(unpack_tiles(&packed, BlockFloat::Bfp4).unwrap().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_partial_tiles_rejected() {
        assert_eq!(
            pack_tiles(&[1.0; 100], BlockFloat::Bfp8),
            Err(BfpError::PartialTile { len: 100 })
        );
        assert!(matches!(
            unpack_tiles(&[0; 100], BlockFloat::Bfp4),
            Err(BfpError::PartialPackedTile { len: 100, .. })
        ));
    }

    #[test]
    fn test_empty_input() {
        assert!(pack_tiles(&[], BlockFloat::Bfp8).unwrap().is_empty());
        assert!(unpack_tiles(&[], BlockFloat::Bfp8).unwrap().is_empty());
    }
}
