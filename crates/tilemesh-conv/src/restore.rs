//! Inverses of the layout conversions: recover the `[K, C, R, S]` row-major
//! weight a converted tensor was built from.

use tilemesh_bfp::unpack_tiles;
use tilemesh_core::buffer::HostBuffer;
use tilemesh_core::distributed::transform;
use tilemesh_core::tile::{untilize, Tile};
use tilemesh_core::{map_host_buffer, Layout, Result, Shape, Tensor, TensorError};

use crate::convert::block_float;
use crate::policy::{DepthwiseWeight, GroupedWeight, IndexMap};

fn check_converted(shard: &Tensor, expected: &Shape, layout: Layout) -> Result<()> {
    if shard.layout() != layout {
        return Err(TensorError::TypeError(format!(
            "expected a {layout} conversion output, got {}",
            shard.layout()
        )));
    }
    if shard.shape() != expected {
        return Err(TensorError::ShapeMismatch {
            expected: expected.dims().to_vec(),
            got: shard.shape().dims().to_vec(),
        });
    }
    Ok(())
}

/// Undo any tile-matrix conversion built with `map`. Block-float outputs are
/// unpacked to float32.
pub fn restore_tiled<M>(converted: &Tensor, map: &M) -> Result<Tensor>
where
    M: IndexMap + Sync,
{
    let source_shape = Shape::from(map.source_dims());
    let output_shape = map.output_shape();
    transform(converted, |shard| {
        check_converted(shard, &output_shape, Layout::Tile)?;
        let restored = match block_float(shard.dtype()) {
            Some(format) => {
                let packed = shard.host_buffer()?;
                let tiled = unpack_tiles(packed.as_slice::<u32>()?, format)
                    .map_err(|e| TensorError::ShapeError(e.to_string()))?;
                let values = untilize(&tiled, shard.shape(), Tile::default())?;
                HostBuffer::new(map.gather(&values))
            }
            None => {
                let row_major = shard.to_layout(Layout::RowMajor)?.host_buffer()?;
                map_host_buffer!(&row_major, data => HostBuffer::new(map.gather(data.as_slice())))
            }
        };
        let dtype = restored.dtype();
        Tensor::owned(restored, source_shape.clone(), dtype, Layout::RowMajor)
    })
}

/// Pull every filter's own group slice back out of a grouped weight.
pub fn restore_grouped(converted: &Tensor, map: &GroupedWeight) -> Result<Tensor> {
    let source_shape = Shape::from(map.source_dims());
    let output_shape = map.output_shape();
    transform(converted, |shard| {
        check_converted(shard, &output_shape, Layout::RowMajor)?;
        let input = shard.host_buffer()?;
        let restored = map_host_buffer!(&input, data => HostBuffer::new(map.gather(data.as_slice())));
        Tensor::owned(restored, source_shape.clone(), shard.dtype(), Layout::RowMajor)
    })
}

/// Channel 0 of a depthwise broadcast, as `[K, 1, R, S]`.
pub fn restore_depthwise(converted: &Tensor, map: &DepthwiseWeight) -> Result<Tensor> {
    let output_shape = map.output_shape();
    let source_shape = map.restored_shape();
    transform(converted, |shard| {
        check_converted(shard, &output_shape, Layout::RowMajor)?;
        let input = shard.host_buffer()?;
        let restored = map_host_buffer!(&input, data => HostBuffer::new(map.channel_zero(data.as_slice())));
        Tensor::owned(restored, source_shape.clone(), shard.dtype(), Layout::RowMajor)
    })
}
