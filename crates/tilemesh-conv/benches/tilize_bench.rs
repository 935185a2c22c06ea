//! Benchmark: tilize/untilize throughput, block-float packing and the weight
//! layout conversions.

use std::time::Instant;

use tilemesh_bfp::{pack_tiles, unpack_tiles, BlockFloat};
use tilemesh_conv::{convert_conv_weight_tensor_to_tiled_layout, convert_conv_weight_tensor_to_tiled_layout_block_sharded};
use tilemesh_core::tile::{tilize, untilize, Tile};
use tilemesh_core::{DType, Layout, Shape, Tensor};

fn time<F: FnMut()>(iters: usize, mut f: F) -> f64 {
    let start = Instant::now();
    for _ in 0..iters {
        f();
    }
    start.elapsed().as_secs_f64() / iters as f64
}

fn gbps(bytes: usize, secs: f64) -> f64 {
    bytes as f64 / secs / 1e9
}

fn main() {
    println!("=== tilemesh layout benchmark ===\n");

    let sizes: &[(usize, usize)] = &[(64, 64), (256, 256), (1024, 1024), (2048, 2048)];

    println!("{:<12} {:>12} {:>12} {:>12} {:>12}", "Size", "tilize (ms)", "GB/s", "untilize (ms)", "GB/s");
    println!("{}", "-".repeat(64));
    for &(h, w) in sizes {
        let data: Vec<f32> = (0..h * w).map(|i| ((i * 7 + 3) % 13) as f32 * 0.1 - 0.6).collect();
        let shape = Shape::from([h, w]);
        let iters = if h <= 256 { 200 } else { 10 };
        let bytes = data.len() * 4;

        let tiled = tilize(&data, &shape, Tile::default()).unwrap();
        let tilize_s = time(iters, || {
            let _ = tilize(&data, &shape, Tile::default()).unwrap();
        });
        let untilize_s = time(iters, || {
            let _ = untilize(&tiled, &shape, Tile::default()).unwrap();
        });
        println!(
            "{:<12} {:>10.3}ms {:>12.2} {:>10.3}ms {:>12.2}",
            format!("{}x{}", h, w),
            tilize_s * 1000.0,
            gbps(bytes, tilize_s),
            untilize_s * 1000.0,
            gbps(bytes, untilize_s),
        );
    }

    println!("\n{:<12} {:>10} {:>12} {:>14}", "Size", "Format", "pack (ms)", "unpack (ms)");
    println!("{}", "-".repeat(52));
    for &(h, w) in sizes {
        let data: Vec<f32> = (0..h * w).map(|i| ((i * 11 + 5) % 17) as f32 * 0.1 - 0.8).collect();
        let iters = if h <= 256 { 200 } else { 10 };
        for format in [BlockFloat::Bfp8, BlockFloat::Bfp4] {
            let packed = pack_tiles(&data, format).unwrap();
            let pack_s = time(iters, || {
                let _ = pack_tiles(&data, format).unwrap();
            });
            let unpack_s = time(iters, || {
                let _ = unpack_tiles(&packed, format).unwrap();
            });
            println!(
                "{:<12} {:>10} {:>10.3}ms {:>12.3}ms",
                format!("{}x{}", h, w),
                format.to_string(),
                pack_s * 1000.0,
                unpack_s * 1000.0,
            );
        }
    }

    println!("\n{:<18} {:>14} {:>18}", "Weight", "tiled (ms)", "block-sharded (ms)");
    println!("{}", "-".repeat(52));
    let weights: &[[usize; 4]] = &[[64, 64, 3, 3], [256, 128, 3, 3], [512, 512, 1, 1]];
    for &dims in weights {
        let n: usize = dims.iter().product();
        let values: Vec<f32> = (0..n).map(|i| (i % 31) as f32 * 0.01).collect();
        let weight = Tensor::from_vec(values, dims, Layout::RowMajor).unwrap();
        let iters = 20;
        let tiled_s = time(iters, || {
            let _ = convert_conv_weight_tensor_to_tiled_layout(&weight, 1, 1, Some(DType::Float32)).unwrap();
        });
        let sharded_s = time(iters, || {
            let _ = convert_conv_weight_tensor_to_tiled_layout_block_sharded(&weight, 4, None).unwrap();
        });
        println!(
            "{:<18} {:>12.3}ms {:>16.3}ms",
            format!("{:?}", dims),
            tiled_s * 1000.0,
            sharded_s * 1000.0,
        );
    }
}
