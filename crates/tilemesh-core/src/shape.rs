use smallvec::SmallVec;
use std::fmt;
use std::ops::Index;

use crate::error::TensorError;
use crate::Result;

/// Tensor shape with stack-allocated storage for ≤4 dimensions.
///
/// Convolution weights and activations are 4-D, so the common case never
/// touches the heap.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape {
    dims: SmallVec<[usize; 4]>,
}

impl Shape {
    /// Create a new shape from dimensions.
    pub fn new(dims: &[usize]) -> Self {
        Self {
            dims: SmallVec::from_slice(dims),
        }
    }

    /// Scalar shape (0 dimensions).
    pub fn scalar() -> Self {
        Self {
            dims: SmallVec::new(),
        }
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Total number of elements. A scalar has volume 1.
    pub fn volume(&self) -> usize {
        self.dims.iter().product()
    }

    /// Dimension sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    /// Size of a dimension; negative indices count from the end.
    ///
    /// # Panics
    /// Panics if the index is out of range.
    pub fn at(&self, index: isize) -> usize {
        let rank = self.rank() as isize;
        let resolved = if index < 0 { rank + index } else { index };
        assert!(
            (0..rank).contains(&resolved),
            "dimension index {index} out of range for rank {rank}"
        );
        self.dims[resolved as usize]
    }

    /// Whether this is a scalar (0-dimensional).
    pub fn is_scalar(&self) -> bool {
        self.dims.is_empty()
    }

    /// Row-major strides for this shape.
    pub fn strides(&self) -> SmallVec<[usize; 4]> {
        strides(self)
    }

    /// Resolve a reshape target against this shape. See [`infer_reshape`].
    pub fn resolve_reshape(&self, target: &[i64]) -> Result<Shape> {
        infer_reshape(self, target)
    }

    /// Collapse every leading dimension into the height of a 2-D view.
    /// A scalar views as `(1, 1)`.
    pub fn to_2d(&self) -> (usize, usize) {
        match self.dims.split_last() {
            Some((&last, lead)) => (lead.iter().product(), last),
            None => (1, 1),
        }
    }

    /// Copy of this shape with the last two dims replaced.
    pub fn with_hw(&self, height: usize, width: usize) -> Shape {
        let mut dims = self.dims.clone();
        let n = dims.len();
        assert!(n >= 2, "with_hw needs rank >= 2, got {n}");
        dims[n - 2] = height;
        dims[n - 1] = width;
        Shape { dims }
    }
}

/// Row-major strides: `stride[i]` is the product of `shape[i+1..]`, and the last
/// stride is 1.
pub fn strides(shape: &Shape) -> SmallVec<[usize; 4]> {
    let ndim = shape.rank();
    if ndim == 0 {
        return SmallVec::new();
    }
    let mut strides = SmallVec::from_elem(0usize, ndim);
    strides[ndim - 1] = 1;
    for i in (0..ndim - 1).rev() {
        strides[i] = strides[i + 1] * shape.dims[i + 1];
    }
    strides
}

/// Flat offset of `index` given row-major `strides`. Callers guarantee the
/// index is in bounds.
#[inline]
pub fn flat_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

/// Resolve a reshape target that may contain one `-1` wildcard.
///
/// The wildcard takes whatever size keeps the volume unchanged. A zero-sized
/// entry next to a wildcard is rejected because any wildcard size would fit.
pub fn infer_reshape(old: &Shape, requested: &[i64]) -> Result<Shape> {
    let invalid = |reason: &str| TensorError::InvalidReshape {
        requested: requested.to_vec(),
        reason: reason.to_string(),
    };

    let old_volume = old.volume();
    let mut wildcard = None;
    let mut new_volume: usize = 1;
    let mut has_zero = false;

    for (i, &d) in requested.iter().enumerate() {
        match d {
            -1 => {
                if wildcard.is_some() {
                    return Err(invalid("ambiguous reshape: more than one -1 dimension"));
                }
                wildcard = Some(i);
            }
            d if d < -1 => return Err(invalid("negative dimension")),
            0 => has_zero = true,
            d => {
                new_volume = new_volume
                    .checked_mul(d as usize)
                    .ok_or_else(|| invalid("volume overflows usize"))?;
            }
        }
    }
    if has_zero {
        new_volume = 0;
    }

    if has_zero && wildcard.is_some() {
        return Err(invalid(
            "the -1 dimension is ambiguous when another dimension is 0",
        ));
    }

    let mut dims: SmallVec<[usize; 4]> = requested
        .iter()
        .map(|&d| if d == -1 { 0 } else { d as usize })
        .collect();

    match wildcard {
        None => {
            if new_volume != old_volume {
                return Err(invalid(&format!(
                    "volume mismatch: {old} has {old_volume} elements, target has {new_volume}"
                )));
            }
        }
        Some(idx) => {
            if old_volume % new_volume != 0 {
                return Err(invalid(&format!(
                    "volume {old_volume} of {old} is not divisible by {new_volume}"
                )));
            }
            dims[idx] = old_volume / new_volume;
        }
    }

    Ok(Shape { dims })
}

impl Index<usize> for Shape {
    type Output = usize;

    fn index(&self, index: usize) -> &usize {
        &self.dims[index]
    }
}

impl fmt::Debug for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shape({:?})", self.dims.as_slice())
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape::new(dims)
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape {
            dims: SmallVec::from_vec(dims),
        }
    }
}

macro_rules! impl_shape_from_array {
    ($($n:expr),*) => {
        $(
            impl From<[usize; $n]> for Shape {
                fn from(dims: [usize; $n]) -> Self {
                    Shape::new(&dims)
                }
            }
        )*
    };
}

impl_shape_from_array!(0, 1, 2, 3, 4, 5, 6);
