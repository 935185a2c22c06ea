//! # tilemesh-conv
//!
//! Layout conversions for convolution weights `[K, C, R, S]` and biases
//! `[1, 1, 1, K]`.
//!
//! Each conversion is a pure index map (see [`policy`]) applied to a
//! row-major host buffer, followed by tilizing and, for block-float output
//! dtypes, packing with `tilemesh-bfp`. Multi-shard host tensors are converted
//! shard by shard. [`restore`] inverts every map.

pub mod convert;
pub mod policy;
pub mod restore;

pub use convert::{
    convert_conv_bias_tensor_to_tiled_layout_block_sharded, convert_conv_weight_tensor_to_depthwise_layout,
    convert_conv_weight_tensor_to_grouped_layout, convert_conv_weight_tensor_to_special_padding_tiled_layout,
    convert_conv_weight_tensor_to_tiled_layout, convert_conv_weight_tensor_to_tiled_layout_block_sharded,
    create_tensor_from_buffer,
};
pub use policy::{
    BlockShardedBias, BlockShardedWeight, DepthwiseWeight, GroupedWeight, IndexMap, SpecialPaddingWeight, TiledWeight,
};
pub use restore::{restore_depthwise, restore_grouped, restore_tiled};
