//! Tensor operations: placement across host and devices, and shape changes.
//!
//! All operations return new tensors (functional style).

pub mod manipulation;
pub mod placement;
