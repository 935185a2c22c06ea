//! Error bounds of block-float packing on random tiles.

use rand::Rng;
use tilemesh_bfp::encoder::shared_exponent;
use tilemesh_bfp::{pack_tiles, unpack_tiles, BlockFloat, GROUP_SIZE, TILE_VOLUME};

fn random_tiles(num_tiles: usize, range: f32) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..num_tiles * TILE_VOLUME).map(|_| rng.gen_range(-range..range)).collect()
}

/// Every value is within one mantissa step of its group's shared exponent.
fn assert_within_one_step(original: &[f32], decoded: &[f32], format: BlockFloat) {
    for (g, (group, back)) in original.chunks(GROUP_SIZE).zip(decoded.chunks(GROUP_SIZE)).enumerate() {
        let shared = shared_exponent(group) as i32;
        let step = 2f32.powi(shared - 127 - (format.mantissa_bits() as i32 - 1));
        for (x, y) in group.iter().zip(back) {
            assert!(
                (x - y).abs() <= step,
                "group {}: {} decoded as {} (step {})",
                g, x, y, step
            );
        }
    }
}

#[test]
fn test_bfp8_error_bound() {
    let data = random_tiles(4, 8.0);
    let decoded = unpack_tiles(&pack_tiles(&data, BlockFloat::Bfp8).unwrap(), BlockFloat::Bfp8).unwrap();
    assert_within_one_step(&data, &decoded, BlockFloat::Bfp8);
}

#[test]
fn test_bfp4_error_bound() {
    let data = random_tiles(4, 100.0);
    let decoded = unpack_tiles(&pack_tiles(&data, BlockFloat::Bfp4).unwrap(), BlockFloat::Bfp4).unwrap();
    assert_within_one_step(&data, &decoded, BlockFloat::Bfp4);
}

#[test]
fn test_bfp8_is_tighter_than_bfp4() {
    let data = random_tiles(2, 1.0);
    let err = |format| {
        let decoded = unpack_tiles(&pack_tiles(&data, format).unwrap(), format).unwrap();
        data.iter().zip(&decoded).map(|(x, y)| (x - y).abs()).sum::<f32>()
    };
    assert!(err(BlockFloat::Bfp8) < err(BlockFloat::Bfp4));
}

#[test]
fn test_signs_preserved() {
    let data = random_tiles(1, 4.0);
    let decoded = unpack_tiles(&pack_tiles(&data, BlockFloat::Bfp8).unwrap(), BlockFloat::Bfp8).unwrap();
    for (x, y) in data.iter().zip(&decoded) {
        assert!(*y == 0.0 || x.signum() == y.signum(), "{} decoded as {}", x, y);
    }
}
