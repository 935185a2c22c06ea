use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::buffer::HostBuffer;
use crate::device::{Device, DeviceBuffer, DeviceId};
use crate::{Result, Shape, TensorError};

/// How a multi-shard tensor relates to the logical tensor it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributedTensorConfig {
    /// Every shard is a full copy.
    Replicate { replication_factor: usize },
    /// Shards are consecutive slices along `dim`.
    Shard { dim: usize },
    /// Shards tile a `mesh_rows x mesh_cols` grid over the last two dims.
    Shard2D { mesh_rows: usize, mesh_cols: usize },
    /// Every shard holds the gathered result.
    AllGather,
}

impl fmt::Display for DistributedTensorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistributedTensorConfig::Replicate { replication_factor } => {
                write!(f, "replicate(x{replication_factor})")
            }
            DistributedTensorConfig::Shard { dim } => write!(f, "shard(dim={dim})"),
            DistributedTensorConfig::Shard2D { mesh_rows, mesh_cols } => {
                write!(f, "shard2d({mesh_rows}x{mesh_cols})")
            }
            DistributedTensorConfig::AllGather => write!(f, "all_gather"),
        }
    }
}

/// Host buffer exclusively owned by the tensor.
#[derive(Debug, Clone)]
pub struct OwnedStorage {
    pub buffer: HostBuffer,
}

/// Host buffer managed by someone else. The tensor only aliases it, so it must
/// be copied before a worker thread may hold on to it.
#[derive(Debug, Clone)]
pub struct BorrowedStorage {
    pub buffer: HostBuffer,
}

/// One buffer on one device.
#[derive(Debug, Clone)]
pub struct DeviceStorage {
    pub buffer: DeviceBuffer,
}

impl DeviceStorage {
    pub fn device(&self) -> &Device {
        self.buffer.device()
    }
}

/// One device buffer per participating device.
#[derive(Debug, Clone)]
pub struct MultiDeviceStorage {
    pub config: DistributedTensorConfig,
    /// Duplicate-free, in the order shards were registered.
    pub ordered_device_ids: Vec<DeviceId>,
    pub buffers: HashMap<DeviceId, DeviceBuffer>,
    pub shapes: HashMap<DeviceId, Shape>,
}

impl MultiDeviceStorage {
    pub fn new(config: DistributedTensorConfig) -> Self {
        Self {
            config,
            ordered_device_ids: Vec::new(),
            buffers: HashMap::new(),
            shapes: HashMap::new(),
        }
    }

    pub fn num_buffers(&self) -> usize {
        self.ordered_device_ids.len()
    }

    pub fn buffer(&self, id: DeviceId) -> Result<&DeviceBuffer> {
        self.buffers.get(&id).ok_or_else(|| unknown_device(id))
    }

    pub fn shape(&self, id: DeviceId) -> Result<&Shape> {
        self.shapes.get(&id).ok_or_else(|| unknown_device(id))
    }

    /// Register or replace the shard of device `id`. New ids go to the end.
    pub fn insert(&mut self, id: DeviceId, buffer: DeviceBuffer, shape: Shape) {
        if !self.buffers.contains_key(&id) {
            self.ordered_device_ids.push(id);
        }
        self.buffers.insert(id, buffer);
        self.shapes.insert(id, shape);
    }

    /// Device handles in registration order.
    pub fn devices(&self) -> Vec<Device> {
        self.ordered_device_ids
            .iter()
            .filter_map(|id| self.buffers.get(id))
            .map(|b| b.device().clone())
            .collect()
    }
}

fn unknown_device(id: DeviceId) -> TensorError {
    TensorError::StorageError(format!("no shard registered for device {id}"))
}

/// Host buffers of a tensor split into shards, indexed by position.
#[derive(Debug, Clone)]
pub struct MultiDeviceHostStorage {
    pub config: DistributedTensorConfig,
    pub buffers: Vec<HostBuffer>,
    pub shapes: Vec<Shape>,
}

impl MultiDeviceHostStorage {
    pub fn new(config: DistributedTensorConfig, buffers: Vec<HostBuffer>, shapes: Vec<Shape>) -> Self {
        assert_eq!(buffers.len(), shapes.len(), "one shape per host shard");
        Self { config, buffers, shapes }
    }

    pub fn num_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn get(&self, index: usize) -> Result<(&HostBuffer, &Shape)> {
        match (self.buffers.get(index), self.shapes.get(index)) {
            (Some(b), Some(s)) => Ok((b, s)),
            _ => Err(TensorError::StorageError(format!(
                "shard index {index} out of range for {} host shards",
                self.buffers.len()
            ))),
        }
    }

    /// Replace the shard at `index`, or append when `index == len`.
    pub fn insert(&mut self, index: usize, buffer: HostBuffer, shape: Shape) -> Result<()> {
        let len = self.buffers.len();
        if index < len {
            self.buffers[index] = buffer;
            self.shapes[index] = shape;
        } else if index == len {
            self.buffers.push(buffer);
            self.shapes.push(shape);
        } else {
            return Err(TensorError::StorageError(format!(
                "cannot insert host shard {index} into storage with {len} shards"
            )));
        }
        Ok(())
    }
}

/// Where a tensor's bytes live. Exactly one variant is active.
#[derive(Debug, Clone)]
pub enum Storage {
    Owned(OwnedStorage),
    Borrowed(BorrowedStorage),
    Device(DeviceStorage),
    MultiDevice(MultiDeviceStorage),
    MultiDeviceHost(MultiDeviceHostStorage),
}

/// Discriminant of [`Storage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageType {
    Owned,
    Borrowed,
    Device,
    MultiDevice,
    MultiDeviceHost,
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageType::Owned => write!(f, "owned"),
            StorageType::Borrowed => write!(f, "borrowed"),
            StorageType::Device => write!(f, "device"),
            StorageType::MultiDevice => write!(f, "multi_device"),
            StorageType::MultiDeviceHost => write!(f, "multi_device_host"),
        }
    }
}

impl Storage {
    pub fn storage_type(&self) -> StorageType {
        match self {
            Storage::Owned(_) => StorageType::Owned,
            Storage::Borrowed(_) => StorageType::Borrowed,
            Storage::Device(_) => StorageType::Device,
            Storage::MultiDevice(_) => StorageType::MultiDevice,
            Storage::MultiDeviceHost(_) => StorageType::MultiDeviceHost,
        }
    }

    /// Whether the bytes are in host memory.
    pub fn is_host(&self) -> bool {
        match self {
            Storage::Owned(_) | Storage::Borrowed(_) | Storage::MultiDeviceHost(_) => true,
            Storage::Device(_) | Storage::MultiDevice(_) => false,
        }
    }

    pub fn num_buffers(&self) -> usize {
        match self {
            Storage::Owned(_) | Storage::Borrowed(_) | Storage::Device(_) => 1,
            Storage::MultiDevice(s) => s.num_buffers(),
            Storage::MultiDeviceHost(s) => s.num_buffers(),
        }
    }

    /// The host buffer of a single-shard host tensor.
    pub fn host_buffer(&self) -> Result<&HostBuffer> {
        match self {
            Storage::Owned(s) => Ok(&s.buffer),
            Storage::Borrowed(s) => Ok(&s.buffer),
            other => Err(TensorError::StorageError(format!(
                "expected owned or borrowed host storage, found {}",
                other.storage_type()
            ))),
        }
    }

    pub fn distribution(&self) -> Option<DistributedTensorConfig> {
        match self {
            Storage::MultiDevice(s) => Some(s.config),
            Storage::MultiDeviceHost(s) => Some(s.config),
            Storage::Owned(_) | Storage::Borrowed(_) | Storage::Device(_) => None,
        }
    }
}
