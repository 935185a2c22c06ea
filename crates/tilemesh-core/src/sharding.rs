//! Division of a 2-D view into shards, and shard-major reordering.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::device::TensorMemoryLayout;
use crate::{Result, Shape, TensorError};

/// Height and width of a 2-D view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Size {
    pub height: usize,
    pub width: usize,
}

impl Size {
    pub const fn new(height: usize, width: usize) -> Self {
        Self { height, width }
    }

    pub fn volume(&self) -> usize {
        self.height * self.width
    }
}

impl fmt::Display for Size {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.height, self.width)
    }
}

/// How a 2-D view splits into shards. The last shard along a dimension may be
/// partial; a view that divides evenly ends with a full shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShardDivisionSpec {
    pub num_shards_height: usize,
    pub last_shard_height: usize,
    pub num_shards_width: usize,
    pub last_shard_width: usize,
}

impl ShardDivisionSpec {
    pub fn num_shards(&self) -> usize {
        self.num_shards_height * self.num_shards_width
    }
}

/// Collapse all leading dims of `shape` into the height.
pub fn get_2d_shape(shape: &Shape) -> Size {
    let (height, width) = shape.to_2d();
    Size::new(height, width)
}

pub fn compute_shard_division(shape: Size, shard_shape: Size) -> Result<ShardDivisionSpec> {
    if shard_shape.height == 0 || shard_shape.width == 0 {
        return Err(TensorError::ShapeError(format!(
            "shard shape {shard_shape} has a zero dimension"
        )));
    }
    let last = |dim: usize, shard: usize| match dim % shard {
        0 => shard,
        rem => rem,
    };
    Ok(ShardDivisionSpec {
        num_shards_height: shape.height.div_ceil(shard_shape.height),
        last_shard_height: last(shape.height, shard_shape.height),
        num_shards_width: shape.width.div_ceil(shard_shape.width),
        last_shard_width: last(shape.width, shard_shape.width),
    })
}

/// Check that `shard` is a legal shard shape of `shape` for a sharded layout.
pub fn validate_shard_shape(layout: TensorMemoryLayout, shape: Size, shard: Size) -> Result<()> {
    let fail = |what: &str| {
        Err(TensorError::ShapeError(format!(
            "{layout:?} shard {shard} of view {shape}: {what}"
        )))
    };
    if shard.height == 0 || shard.width == 0 {
        return fail("zero-sized shard");
    }
    match layout {
        TensorMemoryLayout::Interleaved => Ok(()),
        TensorMemoryLayout::HeightSharded if shard.width != shape.width => {
            fail("shard width must equal the full width")
        }
        TensorMemoryLayout::WidthSharded if shard.height != shape.height => {
            fail("shard height must equal the full height")
        }
        _ => Ok(()),
    }
}

/// Reorder a row-major `shape` view into shard-major order. Shards follow each
/// other row-major over the shard grid, each one row-major and padded with
/// `T::default()` up to the full shard shape.
pub fn shard_order<T: Copy + Default>(data: &[T], shape: Size, shard: Size) -> Result<Vec<T>> {
    let spec = compute_shard_division(shape, shard)?;
    check_len(data.len(), shape)?;
    let mut out = vec![T::default(); spec.num_shards() * shard.volume()];
    for_each_shard_row(shape, shard, &spec, |src, dst, len| {
        out[dst..dst + len].copy_from_slice(&data[src..src + len]);
    });
    Ok(out)
}

/// Inverse of [`shard_order`]: drop the padding and restore row-major order.
pub fn unshard_order<T: Copy + Default>(data: &[T], shape: Size, shard: Size) -> Result<Vec<T>> {
    let spec = compute_shard_division(shape, shard)?;
    if data.len() != spec.num_shards() * shard.volume() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![spec.num_shards(), shard.height, shard.width],
            got: vec![data.len()],
        });
    }
    let mut out = vec![T::default(); shape.volume()];
    for_each_shard_row(shape, shard, &spec, |src, dst, len| {
        out[src..src + len].copy_from_slice(&data[dst..dst + len]);
    });
    Ok(out)
}

fn check_len(len: usize, shape: Size) -> Result<()> {
    if len != shape.volume() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![shape.height, shape.width],
            got: vec![len],
        });
    }
    Ok(())
}

/// Visit every in-bounds row segment of every shard as
/// `(row-major offset, shard-major offset, len)`.
fn for_each_shard_row(
    shape: Size,
    shard: Size,
    spec: &ShardDivisionSpec,
    mut visit: impl FnMut(usize, usize, usize),
) {
    for sh in 0..spec.num_shards_height {
        let rows = if sh + 1 == spec.num_shards_height { spec.last_shard_height } else { shard.height };
        for sw in 0..spec.num_shards_width {
            let cols = if sw + 1 == spec.num_shards_width { spec.last_shard_width } else { shard.width };
            let shard_base = (sh * spec.num_shards_width + sw) * shard.volume();
            for r in 0..rows {
                let src = (sh * shard.height + r) * shape.width + sw * shard.width;
                visit(src, shard_base + r * shard.width, cols);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_last_shard() {
        let spec = compute_shard_division(Size::new(10, 10), Size::new(4, 4)).unwrap();
        assert_eq!(
            spec,
            ShardDivisionSpec {
                num_shards_height: 3,
                last_shard_height: 2,
                num_shards_width: 3,
                last_shard_width: 2,
            }
        );
    }

    #[test]
    fn test_exact_fit_has_full_last_shard() {
        let spec = compute_shard_division(Size::new(8, 8), Size::new(4, 4)).unwrap();
        assert_eq!(
            spec,
            ShardDivisionSpec {
                num_shards_height: 2,
                last_shard_height: 4,
                num_shards_width: 2,
                last_shard_width: 4,
            }
        );
        assert_eq!(spec.num_shards(), 4);
    }

    #[test]
    fn test_zero_shard_rejected() {
        assert!(compute_shard_division(Size::new(8, 8), Size::new(0, 4)).is_err());
    }

    #[test]
    fn test_get_2d_shape() {
        assert_eq!(get_2d_shape(&Shape::new(&[2, 3, 4, 5])), Size::new(24, 5));
    }

    #[test]
    fn test_shard_order_pads_partial_shards() {
        // 3x3 view in 2x2 shards: four shards, the last row/col partial
        let data: Vec<u32> = (1..=9).collect();
        let sharded = shard_order(&data, Size::new(3, 3), Size::new(2, 2)).unwrap();
        assert_eq!(
            sharded,
            vec![1, 2, 4, 5, 3, 0, 6, 0, 7, 8, 0, 0, 9, 0, 0, 0]
        );
        let back = unshard_order(&sharded, Size::new(3, 3), Size::new(2, 2)).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_height_sharded_is_contiguous() {
        let data: Vec<u16> = (0..64).collect();
        let sharded = shard_order(&data, Size::new(8, 8), Size::new(2, 8)).unwrap();
        assert_eq!(sharded, data);
    }

    #[test]
    fn test_validate_shard_shape() {
        let view = Size::new(64, 32);
        assert!(validate_shard_shape(TensorMemoryLayout::HeightSharded, view, Size::new(16, 32)).is_ok());
        assert!(validate_shard_shape(TensorMemoryLayout::HeightSharded, view, Size::new(16, 16)).is_err());
        assert!(validate_shard_shape(TensorMemoryLayout::WidthSharded, view, Size::new(64, 8)).is_ok());
        assert!(validate_shard_shape(TensorMemoryLayout::WidthSharded, view, Size::new(32, 8)).is_err());
        assert!(validate_shard_shape(TensorMemoryLayout::BlockSharded, view, Size::new(32, 8)).is_ok());
    }
}
