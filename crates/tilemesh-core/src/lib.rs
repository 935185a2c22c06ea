//! # tilemesh-core
//!
//! Tensor storage for a mesh of accelerator devices.
//!
//! Provides the `Tensor` handle together with:
//! - Host storage kinds (owned, borrowed) and device storage kinds
//!   (single device, multi device, multi device host)
//! - Row-major and tiled (32x32 tile, 16x16 face) layouts
//! - Shard planning for sharded device memory configs
//! - One FIFO worker queue per device, with synchronous and asynchronous modes
//! - Distribution of host tensors across a mesh and aggregation back

pub mod buffer;
pub mod device;
pub mod distributed;
pub mod dtype;
pub mod error;
pub mod guard;
pub mod ops;
pub mod prelude;
pub mod shape;
pub mod sharding;
pub mod storage;
pub mod tensor;
pub mod tile;

pub use buffer::{HostBuffer, HostElement};
pub use device::{Device, DeviceId, DeviceMesh, MemoryConfig};
pub use dtype::DType;
pub use error::{ErrorKind, TensorError};
pub use shape::Shape;
pub use storage::{DistributedTensorConfig, Storage, StorageType};
pub use tensor::Tensor;
pub use tile::{Layout, Tile};

pub type Result<T> = std::result::Result<T, TensorError>;
