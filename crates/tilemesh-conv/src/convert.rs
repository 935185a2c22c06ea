//! Conversions of row-major host weights into the layouts the convolution
//! kernels read.

use tilemesh_bfp::{pack_tiles, BlockFloat};
use tilemesh_core::buffer::HostBuffer;
use tilemesh_core::distributed::transform;
use tilemesh_core::tile::{tilize, Tile};
use tilemesh_core::{map_host_buffer, DType, Layout, Result, Shape, Tensor, TensorError};

use crate::policy::{
    BlockShardedBias, BlockShardedWeight, DepthwiseWeight, GroupedWeight, IndexMap, SpecialPaddingWeight, TiledWeight,
};

/// Source dtypes accepted by the tiled matrix layouts.
const TILED_SOURCE_DTYPES: [DType; 3] = [DType::BFloat16, DType::Float32, DType::UInt32];

/// Source dtypes accepted by the grouped and depthwise layouts.
const CHANNEL_SOURCE_DTYPES: [DType; 5] = [DType::Int32, DType::Float32, DType::BFloat16, DType::UInt16, DType::UInt32];

pub(crate) fn block_float(dtype: DType) -> Option<BlockFloat> {
    match dtype {
        DType::BFloat8B => Some(BlockFloat::Bfp8),
        DType::BFloat4B => Some(BlockFloat::Bfp4),
        _ => None,
    }
}

/// `[K, C, R, S]` of a rank-4 tensor.
pub(crate) fn weight_dims(tensor: &Tensor) -> Result<[usize; 4]> {
    match *tensor.shape().dims() {
        [k, c, r, s] => Ok([k, c, r, s]),
        _ => Err(TensorError::ShapeError(format!(
            "convolution weights must have rank 4, got {}",
            tensor.shape()
        ))),
    }
}

fn check_source(tensor: &Tensor, supported: &[DType]) -> Result<()> {
    if tensor.layout() != Layout::RowMajor {
        return Err(TensorError::TypeError(format!(
            "weights must be row-major to convert, got {}",
            tensor.layout()
        )));
    }
    if !supported.contains(&tensor.dtype()) {
        return Err(TensorError::UnsupportedDType(tensor.dtype()));
    }
    Ok(())
}

/// Tilize a row-major output buffer into a tile tensor of `output_dtype`.
///
/// Block-float output dtypes need an f32 buffer, which is tilized and then
/// packed. Any other output dtype must match the buffer.
pub fn create_tensor_from_buffer(buffer: HostBuffer, shape: Shape, output_dtype: DType) -> Result<Tensor> {
    if let Some(format) = block_float(output_dtype) {
        let HostBuffer::Float32(values) = &buffer else {
            return Err(TensorError::TypeError(format!(
                "unsupported output datatype {output_dtype} for {} data",
                buffer.dtype()
            )));
        };
        let tiled = tilize(values.as_slice(), &shape, Tile::default())?;
        let packed = pack_tiles(&tiled, format).map_err(|e| TensorError::ShapeError(e.to_string()))?;
        return Tensor::owned(HostBuffer::new(packed), shape, output_dtype, Layout::Tile);
    }
    if buffer.dtype() != output_dtype {
        return Err(TensorError::TypeError(format!(
            "unsupported output datatype {output_dtype} for {} data",
            buffer.dtype()
        )));
    }
    Tensor::owned(buffer, shape, output_dtype, Layout::RowMajor)?.to_layout(Layout::Tile)
}

/// Shared driver of the tiled matrix layouts: validate, then scatter and
/// tilize every shard.
fn convert_tiled<M, F>(weight: &Tensor, output_dtype: Option<DType>, plan: F) -> Result<Tensor>
where
    M: IndexMap,
    F: Fn(&Tensor) -> Result<M> + Sync + Send,
{
    check_source(weight, &TILED_SOURCE_DTYPES)?;
    let source = weight.dtype();
    let target = output_dtype.unwrap_or(source);
    if target.is_block_float() && source != DType::Float32 {
        return Err(TensorError::TypeError(format!(
            "unsupported output datatype {target}: block-float output needs float32 weights, got {source}"
        )));
    }
    transform(weight, |shard| {
        let map = plan(shard)?;
        let input = shard.host_buffer()?;
        let scattered = map_host_buffer!(&input, data => HostBuffer::new(map.scatter(data.as_slice())));
        let output_shape = map.output_shape();
        tracing::debug!("converted {source} weight {} to {target} tile matrix {output_shape}", shard.shape());
        create_tensor_from_buffer(scattered, output_shape, target)
    })
}

/// Grouped and depthwise layouts stay row-major; block-float requests are
/// served as float32.
fn channel_output_dtype(weight: &Tensor, output_dtype: Option<DType>) -> Result<DType> {
    check_source(weight, &CHANNEL_SOURCE_DTYPES)?;
    let target = match output_dtype {
        Some(DType::BFloat8B | DType::BFloat4B) => DType::Float32,
        Some(dtype) => dtype,
        None => weight.dtype(),
    };
    if target != weight.dtype() {
        return Err(TensorError::TypeError(format!(
            "unsupported output datatype {target} for {} weights",
            weight.dtype()
        )));
    }
    Ok(target)
}

// =============================================================================
// Tiled matrix layouts
// =============================================================================

/// Flatten `[K, C, R, S]` to a tile matrix with `K` along the columns, padded
/// to whole `in1_block_h x in1_block_w` tile blocks.
pub fn convert_conv_weight_tensor_to_tiled_layout(
    weight: &Tensor,
    in1_block_h: usize,
    in1_block_w: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    convert_tiled(weight, output_dtype, |shard| {
        TiledWeight::new(weight_dims(shard)?, in1_block_h, in1_block_w)
    })
}

/// Tile matrix where every kernel row starts a new row block.
///
/// # Panics
///
/// If `in1_block_h * 32 < C * S`.
pub fn convert_conv_weight_tensor_to_special_padding_tiled_layout(
    weight: &Tensor,
    in1_block_h: usize,
    in1_block_w: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    convert_tiled(weight, output_dtype, |shard| {
        SpecialPaddingWeight::new(weight_dims(shard)?, in1_block_h, in1_block_w)
    })
}

pub fn convert_conv_weight_tensor_to_tiled_layout_block_sharded(
    weight: &Tensor,
    num_channel_shards: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    convert_tiled(weight, output_dtype, |shard| {
        BlockShardedWeight::new(weight_dims(shard)?, num_channel_shards)
    })
}

pub fn convert_conv_bias_tensor_to_tiled_layout_block_sharded(
    bias: &Tensor,
    num_channel_shards: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    convert_tiled(bias, output_dtype, |shard| BlockShardedBias::new(shard.shape(), num_channel_shards))
}

// =============================================================================
// Row-major channel layouts
// =============================================================================

/// Widen a grouped weight `[K, C, R, S]` to `[K, C * num_groups, R, S]` with
/// every filter's channels in its group's slice and zeros elsewhere.
pub fn convert_conv_weight_tensor_to_grouped_layout(
    weight: &Tensor,
    num_groups: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    let target = channel_output_dtype(weight, output_dtype)?;
    transform(weight, |shard| {
        let map = GroupedWeight::new(weight_dims(shard)?, num_groups)?;
        let input = shard.host_buffer()?;
        let output = map_host_buffer!(&input, data => HostBuffer::new(map.scatter(data.as_slice())));
        Tensor::owned(output, map.output_shape(), target, Layout::RowMajor)
    })
}

/// Broadcast channel 0 of a depthwise weight over `act_block_h_ntiles * 32`
/// channels.
pub fn convert_conv_weight_tensor_to_depthwise_layout(
    weight: &Tensor,
    act_block_h_ntiles: usize,
    output_dtype: Option<DType>,
) -> Result<Tensor> {
    let target = channel_output_dtype(weight, output_dtype)?;
    transform(weight, |shard| {
        let map = DepthwiseWeight::new(weight_dims(shard)?, act_block_h_ntiles)?;
        let input = shard.host_buffer()?;
        let output = map_host_buffer!(&input, data => HostBuffer::new(map.broadcast(data.as_slice())));
        Tensor::owned(output, map.output_shape(), target, Layout::RowMajor)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilemesh_core::distributed::distribute;
    use tilemesh_core::{DistributedTensorConfig, ErrorKind, StorageType};

    fn weight(dims: [usize; 4], dtype: DType) -> Tensor {
        let n = dims.iter().product::<usize>();
        let values: Vec<f32> = (0..n).map(|i| (i % 97) as f32).collect();
        Tensor::owned(HostBuffer::new(values), dims, DType::Float32, Layout::RowMajor)
            .and_then(|t| if dtype == DType::Float32 { Ok(t) } else { cast(&t, dtype) })
            .unwrap()
    }

    fn cast(t: &Tensor, dtype: DType) -> Result<Tensor> {
        let values = t.host_buffer()?.to_f32_vec();
        let buffer = match dtype {
            DType::UInt32 => HostBuffer::new(values.iter().map(|&v| v as u32).collect::<Vec<_>>()),
            DType::Int32 => HostBuffer::new(values.iter().map(|&v| v as i32).collect::<Vec<_>>()),
            DType::UInt8 => HostBuffer::new(values.iter().map(|&v| v as u8).collect::<Vec<_>>()),
            _ => unreachable!(),
        };
        Tensor::owned(buffer, t.shape().clone(), dtype, Layout::RowMajor)
    }

    #[test]
    fn test_tiled_output_is_tile_layout() {
        let w = weight([8, 3, 3, 3], DType::Float32);
        let out = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, None).unwrap();
        assert_eq!(out.shape().dims(), &[1, 1, 32, 32]);
        assert_eq!(out.layout(), Layout::Tile);
        assert_eq!(out.dtype(), DType::Float32);
    }

    #[test]
    fn test_block_float_output() {
        let w = weight([8, 3, 3, 3], DType::Float32);
        let out = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, Some(DType::BFloat8B)).unwrap();
        assert_eq!(out.dtype(), DType::BFloat8B);
        assert_eq!(out.host_buffer().unwrap().len(), 272);

        let out = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, Some(DType::BFloat4B)).unwrap();
        assert_eq!(out.host_buffer().unwrap().len(), 144);
    }

    #[test]
    fn test_block_float_needs_float32_source() {
        let w = weight([8, 3, 3, 3], DType::UInt32);
        let err = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, Some(DType::BFloat8B)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_output_dtype_must_match_source() {
        let w = weight([8, 3, 3, 3], DType::Float32);
        let err = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, Some(DType::UInt32)).unwrap_err();
        assert!(matches!(err, TensorError::TypeError(_)));
    }

    #[test]
    fn test_unsupported_source_dtype() {
        let w = weight([2, 2, 1, 1], DType::UInt8);
        let err = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, None).unwrap_err();
        assert_eq!(err, TensorError::UnsupportedDType(DType::UInt8));

        let w = weight([2, 2, 1, 1], DType::Int32);
        assert!(convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, None).is_err());
        assert!(convert_conv_weight_tensor_to_grouped_layout(&w, 1, None).is_ok());
    }

    #[test]
    fn test_rejects_tile_layout_input() {
        let w = weight([1, 1, 32, 32], DType::Float32).to_layout(Layout::Tile).unwrap();
        let err = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
    }

    #[test]
    fn test_rank_checked() {
        let w = Tensor::owned(HostBuffer::new(vec![0f32; 6]), [2, 3], DType::Float32, Layout::RowMajor).unwrap();
        let err = convert_conv_weight_tensor_to_tiled_layout(&w, 1, 1, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }

    #[test]
    fn test_channel_layouts_coerce_block_float() {
        let w = weight([4, 2, 3, 3], DType::Float32);
        let grouped = convert_conv_weight_tensor_to_grouped_layout(&w, 2, Some(DType::BFloat8B)).unwrap();
        assert_eq!(grouped.dtype(), DType::Float32);
        assert_eq!(grouped.layout(), Layout::RowMajor);
        assert_eq!(grouped.shape().dims(), &[4, 4, 3, 3]);

        let w = weight([4, 1, 3, 3], DType::Float32);
        let depthwise = convert_conv_weight_tensor_to_depthwise_layout(&w, 2, Some(DType::BFloat4B)).unwrap();
        assert_eq!(depthwise.dtype(), DType::Float32);
        assert_eq!(depthwise.shape().dims(), &[4, 64, 3, 3]);

        let w = weight([4, 1, 3, 3], DType::UInt32);
        assert!(convert_conv_weight_tensor_to_depthwise_layout(&w, 1, Some(DType::BFloat8B)).is_err());
    }

    #[test]
    fn test_multi_shard_weights_convert_per_shard() {
        let w = weight([8, 4, 1, 1], DType::Float32);
        let shards = distribute(&w, DistributedTensorConfig::Shard { dim: 0 }, 2).unwrap();
        let out = convert_conv_weight_tensor_to_tiled_layout(&shards, 1, 1, None).unwrap();
        assert_eq!(out.storage_type(), StorageType::MultiDeviceHost);
        assert_eq!(tilemesh_core::distributed::num_buffers(&out), 2);
        assert_eq!(out.shape().dims(), &[1, 1, 32, 32]);
    }

    #[test]
    fn test_bias_shape_checked() {
        let bias = weight([1, 1, 2, 32], DType::Float32);
        let err = convert_conv_bias_tensor_to_tiled_layout_block_sharded(&bias, 1, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shape);
    }
}
