use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{Result, Shape, TensorError};

/// Element ordering of a tensor's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Layout {
    /// Natural row-major order over all dims.
    #[default]
    RowMajor,
    /// Tile order over the last two dims, see [`Tile`].
    Tile,
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::RowMajor => write!(f, "row_major"),
            Layout::Tile => write!(f, "tile"),
        }
    }
}

/// Fixed-size tile descriptor.
///
/// Inside a tile the elements are stored face by face with faces in row-major
/// order, and each face is itself row-major. Tiles follow each other row-major
/// over the tile grid of every matrix; all leading dims are batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub height: usize,
    pub width: usize,
    pub face_height: usize,
    pub face_width: usize,
}

pub const TILE_HEIGHT: usize = 32;
pub const TILE_WIDTH: usize = 32;
pub const FACE_HEIGHT: usize = 16;
pub const FACE_WIDTH: usize = 16;

impl Default for Tile {
    fn default() -> Self {
        Self {
            height: TILE_HEIGHT,
            width: TILE_WIDTH,
            face_height: FACE_HEIGHT,
            face_width: FACE_WIDTH,
        }
    }
}

impl Tile {
    /// Elements in one tile.
    pub fn volume(&self) -> usize {
        self.height * self.width
    }

    fn face_volume(&self) -> usize {
        self.face_height * self.face_width
    }

    fn faces_per_row(&self) -> usize {
        self.width / self.face_width
    }

    /// Whether the last two dims of `shape` are whole multiples of this tile.
    pub fn is_aligned(&self, shape: &Shape) -> bool {
        shape.rank() >= 2
            && shape.at(-2) % self.height == 0
            && shape.at(-1) % self.width == 0
    }

    /// Offset inside a tile of element `(row, col)` of that tile.
    #[inline]
    pub fn offset_in_tile(&self, row: usize, col: usize) -> usize {
        let face = (row / self.face_height) * self.faces_per_row() + col / self.face_width;
        face * self.face_volume()
            + (row % self.face_height) * self.face_width
            + col % self.face_width
    }

    fn check(&self, shape: &Shape, len: usize) -> Result<(usize, usize)> {
        if !self.is_aligned(shape) {
            return Err(TensorError::ShapeError(format!(
                "shape {shape} is not a multiple of the {}x{} tile in its last two dims",
                self.height, self.width
            )));
        }
        if len != shape.volume() {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![len],
            });
        }
        Ok((shape.at(-2), shape.at(-1)))
    }
}

/// Reorder a row-major buffer of `shape` into tile order.
pub fn tilize<T>(data: &[T], shape: &Shape, tile: Tile) -> Result<Vec<T>>
where
    T: Copy + Default + Send + Sync,
{
    let (height, width) = tile.check(shape, data.len())?;
    let mut out = vec![T::default(); data.len()];
    if out.is_empty() {
        return Ok(out);
    }
    let tiles_w = width / tile.width;
    let tiles_per_matrix = (height / tile.height) * tiles_w;

    out.par_chunks_mut(tile.volume())
        .enumerate()
        .for_each(|(t, dst)| {
            let batch = t / tiles_per_matrix;
            let t_in_matrix = t % tiles_per_matrix;
            let row0 = (t_in_matrix / tiles_w) * tile.height;
            let col0 = (t_in_matrix % tiles_w) * tile.width;
            let base = batch * height * width;
            for r in 0..tile.height {
                let src_row = base + (row0 + r) * width + col0;
                for c in 0..tile.width {
                    dst[tile.offset_in_tile(r, c)] = data[src_row + c];
                }
            }
        });
    Ok(out)
}

/// Inverse of [`tilize`].
pub fn untilize<T>(data: &[T], shape: &Shape, tile: Tile) -> Result<Vec<T>>
where
    T: Copy + Default + Send + Sync,
{
    let (height, width) = tile.check(shape, data.len())?;
    let mut out = vec![T::default(); data.len()];
    if out.is_empty() {
        return Ok(out);
    }
    let tiles_w = width / tile.width;
    let tiles_per_matrix = (height / tile.height) * tiles_w;

    out.par_chunks_mut(width).enumerate().for_each(|(row, dst)| {
        let batch = row / height;
        let y = row % height;
        let tile_row = y / tile.height;
        for (x, v) in dst.iter_mut().enumerate() {
            let t = batch * tiles_per_matrix + tile_row * tiles_w + x / tile.width;
            *v = data[t * tile.volume() + tile.offset_in_tile(y % tile.height, x % tile.width)];
        }
    });
    Ok(out)
}
