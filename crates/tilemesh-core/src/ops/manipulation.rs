//! Shape-changing operations: pad, unpad, reshape.

use crate::buffer::{HostBuffer, HostElement};
use crate::distributed::transform;
use crate::map_host_buffer;
use crate::shape::{flat_index, strides};
use crate::storage::{MultiDeviceStorage, Storage, StorageType};
use crate::tile::{Layout, TILE_HEIGHT, TILE_WIDTH};
use crate::{Result, Shape, Tensor, TensorError};

impl Tensor {
    /// Embed this tensor in a larger one filled with `pad_value`, placing
    /// element `[0, .., 0]` at `input_start`.
    pub fn pad(&self, output_shape: impl Into<Shape>, input_start: &[usize], pad_value: f32) -> Result<Tensor> {
        let output_shape = output_shape.into();
        if let Some(result) = self.per_shard(|shard| shard.pad(output_shape.clone(), input_start, pad_value)) {
            return result;
        }
        let host = self.row_major_host("pad")?;
        let input = self.shape();
        if output_shape.rank() != input.rank() || input_start.len() != input.rank() {
            return Err(TensorError::ShapeError(format!(
                "cannot pad {input} into {output_shape} starting at {input_start:?}: ranks differ"
            )));
        }
        let fits = (0..input.rank()).all(|d| input_start[d] + input[d] <= output_shape[d]);
        if !fits {
            return Err(TensorError::ShapeError(format!(
                "{input} placed at {input_start:?} does not fit in {output_shape}"
            )));
        }

        let padded = map_host_buffer!(&host, data => embed(data.as_slice(), input, &output_shape, input_start, pad_value));
        Tensor::owned(padded, output_shape, self.dtype(), Layout::RowMajor)
    }

    /// Slice out `[start, end)` in every dimension.
    pub fn unpad(&self, start: &[usize], end: &[usize]) -> Result<Tensor> {
        if let Some(result) = self.per_shard(|shard| shard.unpad(start, end)) {
            return result;
        }
        let host = self.row_major_host("unpad")?;
        let input = self.shape();
        let valid = start.len() == input.rank()
            && end.len() == input.rank()
            && (0..input.rank()).all(|d| start[d] <= end[d] && end[d] <= input[d]);
        if !valid {
            return Err(TensorError::ShapeError(format!(
                "cannot unpad {input} to [{start:?}, {end:?})"
            )));
        }
        let output_shape = Shape::from(start.iter().zip(end).map(|(s, e)| e - s).collect::<Vec<_>>());

        let sliced = map_host_buffer!(&host, data => extract(data.as_slice(), input, &output_shape, start));
        Tensor::owned(sliced, output_shape, self.dtype(), Layout::RowMajor)
    }

    /// Pad the last two dims up to whole tiles.
    pub fn pad_to_tile(&self, pad_value: f32) -> Result<Tensor> {
        let shape = self.shape();
        if shape.rank() < 2 {
            return Err(TensorError::ShapeError(format!("pad_to_tile needs rank >= 2, got {shape}")));
        }
        let height = shape.at(-2).next_multiple_of(TILE_HEIGHT);
        let width = shape.at(-1).next_multiple_of(TILE_WIDTH);
        let start = vec![0; shape.rank()];
        self.pad(shape.with_hw(height, width), &start, pad_value)
    }

    /// Drop tile padding, keeping the leading `output_shape` corner.
    pub fn unpad_from_tile(&self, output_shape: impl Into<Shape>) -> Result<Tensor> {
        let output_shape = output_shape.into();
        let shape = self.shape();
        let rank = shape.rank();
        let valid = rank >= 2
            && output_shape.rank() == rank
            && (0..rank - 2).all(|d| output_shape[d] == shape[d])
            && output_shape.at(-2) <= shape.at(-2)
            && output_shape.at(-1) <= shape.at(-1)
            && shape.at(-2) - output_shape.at(-2) < TILE_HEIGHT
            && shape.at(-1) - output_shape.at(-1) < TILE_WIDTH;
        if !valid {
            return Err(TensorError::ShapeError(format!(
                "{output_shape} is not {shape} without its tile padding"
            )));
        }
        self.unpad(&vec![0; rank], output_shape.dims())
    }

    /// View the tensor with new dimensions; one entry may be `-1`.
    ///
    /// Row-major host tensors share their buffer with the result. Tile layout
    /// keeps the last dim and needs a tile-aligned second-to-last dim. Device
    /// tensors only change metadata.
    pub fn reshape(&self, dims: &[i64]) -> Result<Tensor> {
        let new_shape = self.shape().resolve_reshape(dims)?;
        if self.layout() == Layout::Tile {
            let aligned = new_shape.rank() >= 2
                && new_shape.at(-1) == self.shape().at(-1)
                && new_shape.at(-2) % TILE_HEIGHT == 0;
            if !aligned {
                return Err(TensorError::InvalidReshape {
                    requested: dims.to_vec(),
                    reason: format!(
                        "tile layout {} can only merge or split leading dims in whole tiles",
                        self.shape()
                    ),
                });
            }
        }

        let current = self.storage()?.clone();
        let storage = match current {
            Storage::MultiDeviceHost(_) => return transform(self, |shard| shard.reshape(dims)),
            Storage::MultiDevice(multi) => {
                let mut reshaped = MultiDeviceStorage::new(multi.config);
                for id in &multi.ordered_device_ids {
                    let shard_shape = multi.shape(*id)?.resolve_reshape(dims)?;
                    reshaped.insert(*id, multi.buffer(*id)?.clone(), shard_shape);
                }
                Storage::MultiDevice(reshaped)
            }
            other => other,
        };
        Tensor::new(storage, new_shape, self.dtype(), self.layout())
    }

    /// Run `op` shard by shard if this is a multi-device host tensor.
    fn per_shard<F>(&self, op: F) -> Option<Result<Tensor>>
    where
        F: Fn(&Tensor) -> Result<Tensor> + Sync + Send,
    {
        match self.with_storage(Storage::storage_type) {
            StorageType::MultiDeviceHost => Some(transform(self, op)),
            _ => None,
        }
    }

    fn row_major_host(&self, op: &str) -> Result<HostBuffer> {
        if self.layout() != Layout::RowMajor {
            return Err(TensorError::TypeError(format!(
                "{op} needs row-major layout, got {}",
                self.layout()
            )));
        }
        match &*self.storage()? {
            Storage::Owned(s) => Ok(s.buffer.clone()),
            Storage::Borrowed(s) => Ok(s.buffer.clone()),
            other => Err(TensorError::StorageError(format!(
                "{op} needs a host tensor, found {} storage",
                other.storage_type()
            ))),
        }
    }
}

fn embed<T: HostElement>(data: &[T], input: &Shape, output: &Shape, start: &[usize], pad_value: f32) -> HostBuffer {
    HostBuffer::new(copy_block(data, input, output, start, T::from_f32(pad_value), Direction::Embed))
}

fn extract<T: HostElement>(data: &[T], input: &Shape, output: &Shape, start: &[usize]) -> HostBuffer {
    HostBuffer::new(copy_block(data, output, input, start, T::default(), Direction::Extract))
}

#[derive(Clone, Copy)]
enum Direction {
    /// Write the whole `small` source into `big` at an offset.
    Embed,
    /// Read a `small` block out of the `big` source at an offset.
    Extract,
}

/// Copy between a `small` block and a `big` array where the block starts at
/// `offset`. With `Embed`, `src` is the block and the result is `big` filled
/// with `fill`; with `Extract`, `src` is the big array and the result is the
/// block.
fn copy_block<T: Copy>(src: &[T], small: &Shape, big: &Shape, offset: &[usize], fill: T, direction: Direction) -> Vec<T> {
    let (out_len, small_len) = match direction {
        Direction::Embed => (big.volume(), src.len()),
        Direction::Extract => (small.volume(), small.volume()),
    };
    let mut out = vec![fill; out_len];
    if small_len == 0 {
        return out;
    }
    let rank = small.rank();
    if rank == 0 {
        out[0] = src[0];
        return out;
    }
    let big_strides = strides(big);
    let row = small.at(-1);
    let rows = small.volume() / row.max(1);
    let mut index = vec![0usize; rank];

    for r in 0..rows {
        // multi-index of the first element of row r inside the block
        let mut rem = r;
        for d in (0..rank - 1).rev() {
            index[d] = rem % small[d];
            rem /= small[d];
        }
        index[rank - 1] = 0;
        let big_index: Vec<usize> = index.iter().zip(offset).map(|(i, o)| i + o).collect();
        let big_at = flat_index(&big_index, &big_strides);
        let small_at = r * row;
        match direction {
            Direction::Embed => out[big_at..big_at + row].copy_from_slice(&src[small_at..small_at + row]),
            Direction::Extract => out[small_at..small_at + row].copy_from_slice(&src[big_at..big_at + row]),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{aggregate, distribute};
    use crate::storage::DistributedTensorConfig;
    use crate::DType;

    fn iota(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::from_vec((1..=n as u32).collect::<Vec<_>>(), Shape::new(shape), Layout::RowMajor).unwrap()
    }

    #[test]
    fn test_pad_places_block() {
        let t = iota(&[2, 2]);
        let padded = t.pad([3, 4], &[1, 1], 0.0).unwrap();
        assert_eq!(padded.shape().dims(), &[3, 4]);
        assert_eq!(
            padded.to_vec::<u32>().unwrap(),
            vec![0, 0, 0, 0, 0, 1, 2, 0, 0, 3, 4, 0]
        );
    }

    #[test]
    fn test_pad_value_and_unpad_inverse() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [1, 2, 3], Layout::RowMajor).unwrap();
        let padded = t.pad([2, 4, 5], &[1, 1, 2], -1.0).unwrap();
        let values = padded.to_vec::<f32>().unwrap();
        assert_eq!(values.iter().filter(|&&v| v == -1.0).count(), 40 - 6);
        let back = padded.unpad(&[1, 1, 2], &[2, 3, 5]).unwrap();
        assert_eq!(back.shape().dims(), &[1, 2, 3]);
        assert_eq!(back.to_vec::<f32>().unwrap(), t.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_unpad_end_is_exclusive() {
        let t = iota(&[3, 3]);
        let middle = t.unpad(&[1, 1], &[2, 3]).unwrap();
        assert_eq!(middle.shape().dims(), &[1, 2]);
        assert_eq!(middle.to_vec::<u32>().unwrap(), vec![5, 6]);
        assert!(t.unpad(&[0, 0], &[4, 3]).is_err());
        assert!(t.unpad(&[2, 0], &[1, 3]).is_err());
    }

    #[test]
    fn test_pad_rejects_bad_fit_and_tile_layout() {
        let t = iota(&[2, 2]);
        assert!(matches!(t.pad([2, 2], &[1, 0], 0.0), Err(TensorError::ShapeError(_))));
        let tiled = Tensor::zeros([32, 32], DType::Float32, Layout::Tile).unwrap();
        assert!(matches!(tiled.pad([64, 32], &[0, 0], 0.0), Err(TensorError::TypeError(_))));
    }

    #[test]
    fn test_pad_to_tile_and_back() {
        let t = iota(&[2, 30, 50]);
        let padded = t.pad_to_tile(0.0).unwrap();
        assert_eq!(padded.shape().dims(), &[2, 32, 64]);
        assert!(padded.to_layout(Layout::Tile).is_ok());
        let back = padded.unpad_from_tile([2, 30, 50]).unwrap();
        assert_eq!(back.to_vec::<u32>().unwrap(), t.to_vec::<u32>().unwrap());
        assert!(padded.unpad_from_tile([2, 30, 20]).is_err());
        assert!(padded.unpad_from_tile([1, 30, 50]).is_err());
    }

    #[test]
    fn test_reshape_shares_buffer() {
        let t = iota(&[2, 3, 4]);
        let r = t.reshape(&[-1, 4]).unwrap();
        assert_eq!(r.shape().dims(), &[6, 4]);
        assert!(r.host_buffer().unwrap().ptr_eq(&t.host_buffer().unwrap()));
        assert!(t.reshape(&[-1, -1, 4]).is_err());
        assert!(t.reshape(&[0, -1, 4]).is_err());
    }

    #[test]
    fn test_reshape_tile_layout() {
        let t = Tensor::zeros([2, 32, 64], DType::BFloat16, Layout::Tile).unwrap();
        assert_eq!(t.reshape(&[64, 64]).unwrap().shape().dims(), &[64, 64]);
        assert!(t.reshape(&[2, 64, 32]).is_err());
        assert!(t.reshape(&[4, 16, 64]).is_err());
    }

    #[test]
    fn test_multi_shard_ops_apply_per_shard() {
        let t = distribute(&iota(&[4, 3]), DistributedTensorConfig::Shard { dim: 0 }, 2).unwrap();
        let padded = t.pad([2, 4], &[0, 0], 0.0).unwrap();
        assert_eq!(padded.storage_type(), StorageType::MultiDeviceHost);
        let joined = aggregate(&padded).unwrap();
        assert_eq!(joined.shape().dims(), &[4, 4]);
        assert_eq!(
            joined.to_vec::<u32>().unwrap(),
            vec![1, 2, 3, 0, 4, 5, 6, 0, 7, 8, 9, 0, 10, 11, 12, 0]
        );
        let flat = t.reshape(&[-1]).unwrap();
        assert_eq!(flat.shape().dims(), &[6]);
    }
}
