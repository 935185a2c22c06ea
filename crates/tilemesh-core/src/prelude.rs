//! Convenience re-exports for common tilemesh-core types.
//!
//! ```rust
//! use tilemesh_core::prelude::*;
//! ```

pub use crate::device::{BufferType, DeviceConfig, MeshConfig, TensorMemoryLayout, WorkerMode};
pub use crate::distributed::{aggregate, distribute};
pub use crate::DType;
pub use crate::Device;
pub use crate::DeviceId;
pub use crate::DeviceMesh;
pub use crate::DistributedTensorConfig;
pub use crate::Layout;
pub use crate::MemoryConfig;
pub use crate::Result;
pub use crate::Shape;
pub use crate::StorageType;
pub use crate::Tensor;
pub use crate::TensorError;
