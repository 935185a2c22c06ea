//! Pure index maps for each weight/bias layout.
//!
//! A map only knows shapes: where source element `[k, c, r, s]` of a
//! row-major `[K, C, R, S]` weight lands in the flat output buffer. Buffers
//! and dtypes are handled in [`crate::convert`].

use tilemesh_core::shape::{flat_index, strides};
use tilemesh_core::tile::{TILE_HEIGHT, TILE_WIDTH};
use tilemesh_core::{Result, Shape, TensorError};

/// Injective map from source weight positions into an output buffer.
pub trait IndexMap {
    /// `[K, C, R, S]` of the source.
    fn source_dims(&self) -> [usize; 4];

    fn output_shape(&self) -> Shape;

    /// Flat output position of source element `[k, c, r, s]`.
    fn dst_index(&self, k: usize, c: usize, r: usize, s: usize) -> usize;

    /// Zero-filled output with every source element written to its
    /// destination. `src` is the row-major source buffer.
    fn scatter<T: Copy + Default>(&self, src: &[T]) -> Vec<T> {
        let [k_dim, c_dim, r_dim, s_dim] = self.source_dims();
        let mut out = vec![T::default(); self.output_shape().volume()];
        let mut idx = 0;
        for k in 0..k_dim {
            for c in 0..c_dim {
                for r in 0..r_dim {
                    for s in 0..s_dim {
                        out[self.dst_index(k, c, r, s)] = src[idx];
                        idx += 1;
                    }
                }
            }
        }
        out
    }

    /// Inverse of [`IndexMap::scatter`]: read the source back out of `dst`.
    fn gather<T: Copy>(&self, dst: &[T]) -> Vec<T> {
        let [k_dim, c_dim, r_dim, s_dim] = self.source_dims();
        let mut src = Vec::with_capacity(k_dim * c_dim * r_dim * s_dim);
        for k in 0..k_dim {
            for c in 0..c_dim {
                for r in 0..r_dim {
                    for s in 0..s_dim {
                        src.push(dst[self.dst_index(k, c, r, s)]);
                    }
                }
            }
        }
        src
    }
}

fn require_nonzero(name: &str, value: usize) -> Result<()> {
    if value == 0 {
        return Err(TensorError::ShapeError(format!("{name} must be at least 1")));
    }
    Ok(())
}

// =============================================================================
// Tiled matrix layouts
// =============================================================================

/// `[K, C, R, S]` flattened to a `[rows, cols]` matrix with `K` along the
/// columns, padded to whole `in1_block_h x in1_block_w` tile blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TiledWeight {
    dims: [usize; 4],
    rows: usize,
    cols: usize,
}

impl TiledWeight {
    pub fn new(dims: [usize; 4], in1_block_h: usize, in1_block_w: usize) -> Result<Self> {
        require_nonzero("in1_block_h", in1_block_h)?;
        require_nonzero("in1_block_w", in1_block_w)?;
        let [k, c, r, s] = dims;
        Ok(Self {
            dims,
            rows: (c * r * s).next_multiple_of(in1_block_h * TILE_HEIGHT),
            cols: k.next_multiple_of(in1_block_w * TILE_WIDTH),
        })
    }
}

impl IndexMap for TiledWeight {
    fn source_dims(&self) -> [usize; 4] {
        self.dims
    }

    fn output_shape(&self) -> Shape {
        Shape::from([1, 1, self.rows, self.cols])
    }

    fn dst_index(&self, k: usize, c: usize, r: usize, s: usize) -> usize {
        let [_, c_dim, _, s_dim] = self.dims;
        k + c * self.cols + s * c_dim * self.cols + r * s_dim * c_dim * self.cols
    }
}

/// Like [`TiledWeight`], but each kernel row `r` starts a fresh
/// `in1_block_h * 32` row block; the `C * S` rows of that block are followed
/// by zero padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialPaddingWeight {
    dims: [usize; 4],
    padding: usize,
    rows: usize,
    cols: usize,
}

impl SpecialPaddingWeight {
    /// # Panics
    ///
    /// If one row block (`in1_block_h * 32` rows) cannot hold `C * S` rows.
    pub fn new(dims: [usize; 4], in1_block_h: usize, in1_block_w: usize) -> Result<Self> {
        require_nonzero("in1_block_h", in1_block_h)?;
        require_nonzero("in1_block_w", in1_block_w)?;
        let [k, c, r, s] = dims;
        let block_h = in1_block_h * TILE_HEIGHT;
        assert!(
            block_h >= c * s,
            "row block of {block_h} rows cannot hold C * S = {} rows",
            c * s
        );
        Ok(Self {
            dims,
            padding: block_h - c * s,
            rows: block_h * r,
            cols: k.next_multiple_of(in1_block_w * TILE_WIDTH),
        })
    }

    pub fn padding(&self) -> usize {
        self.padding
    }
}

impl IndexMap for SpecialPaddingWeight {
    fn source_dims(&self) -> [usize; 4] {
        self.dims
    }

    fn output_shape(&self) -> Shape {
        Shape::from([1, 1, self.rows, self.cols])
    }

    fn dst_index(&self, k: usize, c: usize, r: usize, s: usize) -> usize {
        let [_, c_dim, _, s_dim] = self.dims;
        k + c * self.cols + s * c_dim * self.cols + r * (s_dim * c_dim + self.padding) * self.cols
    }
}

/// Weight matrix for block-sharded convolution over `num_channel_shards`
/// cores: output channels are split into column shards and input channels
/// into row blocks, each padded to whole tiles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockShardedWeight {
    dims: [usize; 4],
    out_shard_width: usize,
    out_shard_width_padded: usize,
    in_shard_width: usize,
    block_height_padded: usize,
    num_shards: usize,
}

impl BlockShardedWeight {
    pub fn new(dims: [usize; 4], num_channel_shards: usize) -> Result<Self> {
        require_nonzero("num_channel_shards", num_channel_shards)?;
        let [k, c, r, s] = dims;
        if k % num_channel_shards != 0 || c % num_channel_shards != 0 {
            return Err(TensorError::ShapeError(format!(
                "{k} output and {c} input channels cannot be split into {num_channel_shards} shards"
            )));
        }
        let out_shard_width = k / num_channel_shards;
        let in_shard_width = c / num_channel_shards;
        Ok(Self {
            dims,
            out_shard_width,
            out_shard_width_padded: out_shard_width.next_multiple_of(TILE_WIDTH),
            in_shard_width,
            block_height_padded: (in_shard_width * r * s).next_multiple_of(TILE_HEIGHT),
            num_shards: num_channel_shards,
        })
    }

    fn cols(&self) -> usize {
        self.out_shard_width_padded * self.num_shards
    }
}

impl IndexMap for BlockShardedWeight {
    fn source_dims(&self) -> [usize; 4] {
        self.dims
    }

    fn output_shape(&self) -> Shape {
        Shape::from([1, 1, self.block_height_padded * self.num_shards, self.cols()])
    }

    fn dst_index(&self, k: usize, c: usize, r: usize, s: usize) -> usize {
        let s_dim = self.dims[3];
        let cols = self.cols();
        let (oc, k_s) = (k / self.out_shard_width, k % self.out_shard_width);
        let (ic, c_s) = (c / self.in_shard_width, c % self.in_shard_width);
        (oc * self.out_shard_width_padded + k_s)
            + c_s * cols
            + s * self.in_shard_width * cols
            + r * s_dim * self.in_shard_width * cols
            + ic * self.block_height_padded * cols
    }
}

/// Bias row `[1, 1, 1, K]` for block-sharded convolution: one tile-high
/// matrix whose first row holds the per-shard, tile-padded slices of `K`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockShardedBias {
    width: usize,
    out_shard_width: usize,
    out_shard_width_padded: usize,
    num_shards: usize,
}

impl BlockShardedBias {
    pub fn new(shape: &Shape, num_channel_shards: usize) -> Result<Self> {
        require_nonzero("num_channel_shards", num_channel_shards)?;
        let &[1, 1, 1, width] = shape.dims() else {
            return Err(TensorError::ShapeError(format!("bias must have shape [1, 1, 1, K], got {shape}")));
        };
        if width % num_channel_shards != 0 {
            return Err(TensorError::ShapeError(format!(
                "{width} bias channels cannot be split into {num_channel_shards} shards"
            )));
        }
        let out_shard_width = width / num_channel_shards;
        Ok(Self {
            width,
            out_shard_width,
            out_shard_width_padded: out_shard_width.next_multiple_of(TILE_WIDTH),
            num_shards: num_channel_shards,
        })
    }
}

impl IndexMap for BlockShardedBias {
    fn source_dims(&self) -> [usize; 4] {
        [1, 1, 1, self.width]
    }

    fn output_shape(&self) -> Shape {
        Shape::from([1, 1, TILE_HEIGHT, self.out_shard_width_padded * self.num_shards])
    }

    fn dst_index(&self, _k: usize, _c: usize, _r: usize, s: usize) -> usize {
        (s / self.out_shard_width) * self.out_shard_width_padded + s % self.out_shard_width
    }
}

// =============================================================================
// Row-major channel layouts
// =============================================================================

/// Grouped convolution weight `[K, C, R, S]` widened to `[K, C * g, R, S]`:
/// each filter keeps its channels in its own group's slice, zeros elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupedWeight {
    dims: [usize; 4],
    num_groups: usize,
    output_strides: Vec<usize>,
}

impl GroupedWeight {
    pub fn new(dims: [usize; 4], num_groups: usize) -> Result<Self> {
        let [k, c, r, s] = dims;
        if num_groups == 0 || num_groups > k {
            return Err(TensorError::ShapeError(format!(
                "{num_groups} groups is not in 1..={k} for {k} output channels"
            )));
        }
        let output = Shape::from([k, c * num_groups, r, s]);
        Ok(Self {
            dims,
            num_groups,
            output_strides: strides(&output).to_vec(),
        })
    }

    /// Group that filter `k` belongs to; any remainder filters join the last.
    pub fn group_of(&self, k: usize) -> usize {
        let group_size = self.dims[0] / self.num_groups;
        (k / group_size).min(self.num_groups - 1)
    }
}

impl IndexMap for GroupedWeight {
    fn source_dims(&self) -> [usize; 4] {
        self.dims
    }

    fn output_shape(&self) -> Shape {
        let [k, c, r, s] = self.dims;
        Shape::from([k, c * self.num_groups, r, s])
    }

    fn dst_index(&self, k: usize, c: usize, r: usize, s: usize) -> usize {
        let channel = self.group_of(k) * self.dims[1] + c;
        flat_index(&[k, channel, r, s], &self.output_strides)
    }
}

/// Depthwise weight `[K, C, R, S]` broadcast to `[K, act_block_h_ntiles * 32,
/// R, S]`: every output channel repeats source channel 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthwiseWeight {
    dims: [usize; 4],
    channels: usize,
}

impl DepthwiseWeight {
    pub fn new(dims: [usize; 4], act_block_h_ntiles: usize) -> Result<Self> {
        require_nonzero("act_block_h_ntiles", act_block_h_ntiles)?;
        if dims[1] == 0 {
            return Err(TensorError::ShapeError("depthwise weight has no input channel".into()));
        }
        Ok(Self {
            dims,
            channels: act_block_h_ntiles * TILE_HEIGHT,
        })
    }

    pub fn output_shape(&self) -> Shape {
        let [k, _, r, s] = self.dims;
        Shape::from([k, self.channels, r, s])
    }

    /// Shape of the channel-0 slice that [`DepthwiseWeight::channel_zero`]
    /// returns.
    pub fn restored_shape(&self) -> Shape {
        let [k, _, r, s] = self.dims;
        Shape::from([k, 1, r, s])
    }

    /// Source position read by output element `[k, _, r, s]`.
    pub fn src_index(&self, k: usize, r: usize, s: usize) -> usize {
        let [_, c_dim, r_dim, s_dim] = self.dims;
        ((k * c_dim) * r_dim + r) * s_dim + s
    }

    pub fn broadcast<T: Copy + Default>(&self, src: &[T]) -> Vec<T> {
        let [k_dim, _, r_dim, s_dim] = self.dims;
        let mut out = vec![T::default(); self.output_shape().volume()];
        let mut idx = 0;
        for k in 0..k_dim {
            for _ in 0..self.channels {
                for r in 0..r_dim {
                    for s in 0..s_dim {
                        out[idx] = src[self.src_index(k, r, s)];
                        idx += 1;
                    }
                }
            }
        }
        out
    }

    /// Channel 0 of a broadcast output, as a `[K, 1, R, S]` buffer.
    pub fn channel_zero<T: Copy>(&self, dst: &[T]) -> Vec<T> {
        let [k_dim, _, r_dim, s_dim] = self.dims;
        let plane = r_dim * s_dim;
        (0..k_dim)
            .flat_map(|k| dst[k * self.channels * plane..][..plane].iter().copied())
            .collect()
    }
}
