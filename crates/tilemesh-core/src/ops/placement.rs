//! Moving tensors between host memory and devices, and between layouts.

use crate::buffer::HostBuffer;
use crate::device::{Device, DeviceBuffer, DeviceMemory, DeviceMesh, MemoryConfig};
use crate::distributed::{create_multi_device_tensor, transform};
use crate::guard::prepare_for_worker;
use crate::map_host_buffer;
use crate::sharding::{compute_shard_division, get_2d_shape, shard_order, unshard_order, validate_shard_shape};
use crate::storage::{
    DeviceStorage, DistributedTensorConfig, MultiDeviceHostStorage, OwnedStorage, Storage, StorageType,
};
use crate::tile::{tilize, untilize, Layout};
use crate::{DType, Result, Shape, Tensor, TensorError};

impl Tensor {
    // =========================================================================
    // Host -> device
    // =========================================================================

    /// Copy a host tensor to `device`.
    ///
    /// The write is queued on the device; the returned tensor is usable right
    /// away and its contents are in place once the queue drains. Sharded
    /// memory configs store the bytes in shard-major order.
    pub fn to_device(&self, device: &Device, memory_config: MemoryConfig) -> Result<Tensor> {
        match &*self.storage()? {
            Storage::Owned(_) | Storage::Borrowed(_) => {}
            Storage::Device(d) if d.device() == device => return Ok(self.clone()),
            Storage::Device(d) => {
                return Err(TensorError::StorageError(format!(
                    "tensor is on device {}; moving it directly to device {} is not supported",
                    d.device().id(),
                    device.id()
                )))
            }
            other => {
                return Err(TensorError::StorageError(format!(
                    "{} tensors are placed with to_mesh",
                    other.storage_type()
                )))
            }
        }

        let input = prepare_for_worker(device, self)?;
        let host = input.host_buffer()?;
        let bytes = encode_for_device(&host, self.shape(), self.dtype(), self.layout(), &memory_config)?;
        let buffer = device.allocate(bytes.len(), memory_config)?;
        device.enqueue_write(&buffer, bytes)?;
        tracing::debug!(
            "queued {} tensor {} for device {} ({} B of {} at {:#x})",
            self.dtype(),
            self.shape(),
            device.id(),
            buffer.size(),
            buffer.buffer_type(),
            buffer.address()
        );
        Tensor::new(
            Storage::Device(DeviceStorage { buffer }),
            self.shape().clone(),
            self.dtype(),
            self.layout(),
        )
    }

    /// Place a tensor on every device of `mesh`. See [`Tensor::to_devices`].
    pub fn to_mesh(&self, mesh: &DeviceMesh, memory_config: MemoryConfig) -> Result<Tensor> {
        self.to_devices(mesh.devices(), memory_config)
    }

    /// Place a tensor on `devices`.
    ///
    /// A multi-device host tensor sends shard `i` to `devices[i]`; a single
    /// host tensor is replicated to all of them.
    pub fn to_devices(&self, devices: &[Device], memory_config: MemoryConfig) -> Result<Tensor> {
        if devices.is_empty() {
            return Err(TensorError::StorageError("no devices to place the tensor on".into()));
        }
        let (shards, config) = match &*self.storage()? {
            Storage::MultiDeviceHost(host) => {
                if host.num_buffers() != devices.len() {
                    return Err(TensorError::StorageError(format!(
                        "{} host shards cannot be placed on {} devices",
                        host.num_buffers(),
                        devices.len()
                    )));
                }
                let shards = host
                    .buffers
                    .iter()
                    .zip(&host.shapes)
                    .map(|(b, s)| Tensor::owned(b.clone(), s.clone(), self.dtype(), self.layout()))
                    .collect::<Result<Vec<_>>>()?;
                (shards, host.config)
            }
            Storage::Owned(_) | Storage::Borrowed(_) => (
                vec![self.clone(); devices.len()],
                DistributedTensorConfig::Replicate { replication_factor: devices.len() },
            ),
            Storage::MultiDevice(multi) => {
                let same = multi.ordered_device_ids.len() == devices.len()
                    && devices.iter().zip(&multi.ordered_device_ids).all(|(d, id)| d.id() == *id);
                if same {
                    return Ok(self.clone());
                }
                return Err(TensorError::StorageError(
                    "tensor is already spread over a different set of devices".into(),
                ));
            }
            Storage::Device(d) => {
                return Err(TensorError::StorageError(format!(
                    "tensor is already on device {}",
                    d.device().id()
                )))
            }
        };

        let placed = shards
            .iter()
            .zip(devices)
            .map(|(shard, device)| shard.to_device(device, memory_config))
            .collect::<Result<Vec<_>>>()?;
        create_multi_device_tensor(&placed, StorageType::MultiDevice, config)
    }

    // =========================================================================
    // Device -> host
    // =========================================================================

    /// Bring a device tensor back to host memory.
    ///
    /// Host tensors are returned as they are. With `blocking = false` the
    /// reads are queued and the returned tensor is populated by the device
    /// workers; its data accessors wait for that. Only queue 0 exists.
    pub fn cpu(&self, blocking: bool, queue_id: u8) -> Result<Tensor> {
        if queue_id != 0 {
            return Err(TensorError::StorageError(format!(
                "command queue {queue_id} does not exist; only queue 0 is available"
            )));
        }
        let storage = self.storage()?.clone();
        match storage {
            Storage::Owned(_) | Storage::Borrowed(_) | Storage::MultiDeviceHost(_) => Ok(self.clone()),
            Storage::Device(d) => {
                if blocking {
                    let bytes = d.device().enqueue_read(&d.buffer)?.wait()?;
                    let host = decode_from_device(&bytes, self.shape(), self.dtype(), &d.buffer)?;
                    return Tensor::owned(host, self.shape().clone(), self.dtype(), self.layout());
                }
                let placeholder = Storage::Owned(OwnedStorage { buffer: HostBuffer::zeros(self.dtype(), 0) });
                let output = Tensor::pending(placeholder, self.shape().clone(), self.dtype(), self.layout(), 1);
                let target = output.clone();
                let shape = self.shape().clone();
                let dtype = self.dtype();
                let buffer = d.buffer.clone();
                d.device().push_work(move |memory| {
                    let outcome = read_shard(memory, &buffer, &shape, dtype).and_then(|host| {
                        target.update_storage(|s| {
                            *s = Storage::Owned(OwnedStorage { buffer: host });
                            Ok(())
                        })
                    });
                    target.complete_shard(outcome);
                })?;
                Ok(output)
            }
            Storage::MultiDevice(multi) => {
                let ids = multi.ordered_device_ids.clone();
                if blocking {
                    let mut buffers = Vec::with_capacity(ids.len());
                    let mut shapes = Vec::with_capacity(ids.len());
                    for id in &ids {
                        let buffer = multi.buffer(*id)?;
                        let shape = multi.shape(*id)?;
                        let bytes = buffer.device().enqueue_read(buffer)?.wait()?;
                        buffers.push(decode_from_device(&bytes, shape, self.dtype(), buffer)?);
                        shapes.push(shape.clone());
                    }
                    let host = MultiDeviceHostStorage::new(multi.config, buffers, shapes);
                    return Tensor::new(Storage::MultiDeviceHost(host), self.shape().clone(), self.dtype(), self.layout());
                }

                let placeholders = vec![HostBuffer::zeros(self.dtype(), 0); ids.len()];
                let mut shapes = Vec::with_capacity(ids.len());
                for id in &ids {
                    shapes.push(multi.shape(*id)?.clone());
                }
                let storage = Storage::MultiDeviceHost(MultiDeviceHostStorage::new(
                    multi.config,
                    placeholders,
                    shapes.clone(),
                ));
                let output = Tensor::pending(storage, self.shape().clone(), self.dtype(), self.layout(), ids.len());
                for (index, id) in ids.iter().enumerate() {
                    let buffer = multi.buffer(*id)?.clone();
                    let shape = shapes[index].clone();
                    let target = output.clone();
                    let dtype = self.dtype();
                    buffer.device().clone().push_work(move |memory| {
                        let outcome = read_shard(memory, &buffer, &shape, dtype).and_then(|host| {
                            target.update_storage(|s| match s {
                                Storage::MultiDeviceHost(h) => h.insert(index, host, shape.clone()),
                                other => Err(TensorError::StorageError(format!(
                                    "expected multi-device host storage, found {}",
                                    other.storage_type()
                                ))),
                            })
                        });
                        target.complete_shard(outcome);
                    })?;
                }
                Ok(output)
            }
        }
    }

    /// Read a sharded device tensor back as its raw shard-major 2-D view:
    /// shape `[num_shards * shard_height, shard_width]`, padding included.
    pub fn cpu_sharded(&self) -> Result<Tensor> {
        let storage = self.storage()?.clone();
        let storage_type = storage.storage_type();
        let Storage::Device(d) = storage else {
            return Err(TensorError::StorageError(format!(
                "cpu_sharded needs a single-device tensor, found {storage_type}"
            )));
        };
        let memory_config = d.buffer.memory_config();
        let shard = match memory_config.shard_shape {
            Some(shard) if memory_config.is_sharded() => shard,
            _ => {
                return Err(TensorError::StorageError(format!(
                    "tensor on device {} is not in a sharded memory config",
                    d.device().id()
                )))
            }
        };
        let spec = compute_shard_division(get_2d_shape(self.shape()), shard)?;
        let bytes = d.device().enqueue_read(&d.buffer)?.wait()?;
        let raw = HostBuffer::from_bytes(self.dtype(), &bytes)?;
        Tensor::owned(
            raw,
            [spec.num_shards() * shard.height, shard.width],
            self.dtype(),
            self.layout(),
        )
    }

    // =========================================================================
    // Layout conversion
    // =========================================================================

    /// Convert between row-major and tile layout on the host.
    pub fn to_layout(&self, layout: Layout) -> Result<Tensor> {
        if layout == self.layout() {
            return Ok(self.clone());
        }
        if self.dtype().is_block_float() {
            return Err(TensorError::TypeError(format!(
                "{} tensors only exist in tile layout",
                self.dtype()
            )));
        }
        match self.storage_type() {
            StorageType::Device | StorageType::MultiDevice => {
                return Err(TensorError::StorageError(
                    "layout conversion of device tensors is not supported; bring the tensor to host first".into(),
                ))
            }
            StorageType::MultiDeviceHost => return transform(self, |shard| shard.to_layout(layout)),
            StorageType::Owned | StorageType::Borrowed => {}
        }

        let host = self.host_buffer()?;
        let shape = self.shape();
        let tile = self.tile();
        let converted = map_host_buffer!(&host, data => HostBuffer::new(match layout {
            Layout::Tile => tilize(data.as_slice(), shape, tile)?,
            Layout::RowMajor => untilize(data.as_slice(), shape, tile)?,
        }));
        tracing::debug!("converted {} tensor {} from {} to {layout}", self.dtype(), shape, self.layout());
        Tensor::owned(converted, shape.clone(), self.dtype(), layout)
    }

    /// Same as [`Tensor::to_layout`], executed on `worker`'s queue.
    ///
    /// In asynchronous mode this returns at once; the result's data becomes
    /// readable when the worker has converted every shard.
    pub fn to_layout_on(&self, layout: Layout, worker: &Device) -> Result<Tensor> {
        if !self.is_host() {
            return Err(TensorError::StorageError(
                "layout conversion of device tensors is not supported; bring the tensor to host first".into(),
            ));
        }
        if layout != self.layout() {
            if self.dtype().is_block_float() {
                return Err(TensorError::TypeError(format!(
                    "{} tensors only exist in tile layout",
                    self.dtype()
                )));
            }
            if layout == Layout::Tile && !self.tile().is_aligned(self.shape()) {
                return Err(TensorError::ShapeError(format!(
                    "shape {} is not a multiple of the tile in its last two dims",
                    self.shape()
                )));
            }
        }

        let input = prepare_for_worker(worker, self)?;
        let (storage, shards) = input.with_storage(|s| match s {
            Storage::MultiDeviceHost(host) => (
                Storage::MultiDeviceHost(MultiDeviceHostStorage::new(
                    host.config,
                    vec![HostBuffer::zeros(self.dtype(), 0); host.num_buffers()],
                    host.shapes.clone(),
                )),
                host.num_buffers(),
            ),
            _ => (
                Storage::Owned(OwnedStorage { buffer: HostBuffer::zeros(self.dtype(), 0) }),
                1,
            ),
        });
        let output = Tensor::pending(storage, self.shape().clone(), self.dtype(), layout, shards);

        for index in 0..shards {
            let source = input.clone();
            let target = output.clone();
            worker.push_work(move |_| {
                let outcome = crate::distributed::shard_for_device(&source, index)
                    .and_then(|shard| shard.to_layout(layout))
                    .and_then(|converted| {
                        let buffer = converted.host_buffer()?;
                        let shape = converted.shape().clone();
                        target.update_storage(|s| match s {
                            Storage::MultiDeviceHost(h) => h.insert(index, buffer, shape),
                            Storage::Owned(o) => {
                                o.buffer = buffer;
                                Ok(())
                            }
                            other => Err(TensorError::StorageError(format!(
                                "unexpected {} storage while converting layout",
                                other.storage_type()
                            ))),
                        })
                    });
                target.complete_shard(outcome);
            })?;
        }
        Ok(output)
    }
}

/// Bytes to write to a device buffer for a host tensor.
fn encode_for_device(
    host: &HostBuffer,
    shape: &Shape,
    dtype: DType,
    layout: Layout,
    memory_config: &MemoryConfig,
) -> Result<Vec<u8>> {
    if !memory_config.is_sharded() {
        return Ok(host.as_bytes().to_vec());
    }
    let shard = memory_config.shard_shape.ok_or_else(|| {
        TensorError::ShapeError(format!("{:?} memory config needs a shard shape", memory_config.memory_layout))
    })?;
    if layout != Layout::RowMajor || dtype.is_block_float() {
        return Err(TensorError::TypeError(format!(
            "sharded placement supports row-major plain dtypes, got {dtype} in {layout} layout"
        )));
    }
    let view = get_2d_shape(shape);
    validate_shard_shape(memory_config.memory_layout, view, shard)?;
    let reordered = map_host_buffer!(host, data => HostBuffer::new(shard_order(data.as_slice(), view, shard)?));
    Ok(reordered.as_bytes().to_vec())
}

/// Host buffer for bytes read back from a device buffer.
fn decode_from_device(bytes: &[u8], shape: &Shape, dtype: DType, buffer: &DeviceBuffer) -> Result<HostBuffer> {
    let raw = HostBuffer::from_bytes(dtype, bytes)?;
    let memory_config = buffer.memory_config();
    match memory_config.shard_shape {
        Some(shard) if memory_config.is_sharded() => {
            let view = get_2d_shape(shape);
            Ok(map_host_buffer!(&raw, data => HostBuffer::new(unshard_order(data.as_slice(), view, shard)?)))
        }
        _ => Ok(raw),
    }
}

fn read_shard(memory: &mut DeviceMemory, buffer: &DeviceBuffer, shape: &Shape, dtype: DType) -> Result<HostBuffer> {
    let bytes = memory.read(buffer.buffer_type(), buffer.address(), buffer.size());
    decode_from_device(&bytes, shape, dtype, buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BufferType, DeviceConfig, DeviceId, MeshConfig, TensorMemoryLayout, WorkerMode};
    use crate::distributed::{aggregate, distribute, num_buffers, shard_for_device};
    use crate::sharding::Size;
    use half::bf16;

    fn device(id: u32, mode: WorkerMode) -> Device {
        Device::open(DeviceId(id), DeviceConfig { dram_size: 1 << 16, l1_size: 1 << 12, worker_mode: mode }).unwrap()
    }

    fn iota_f32(shape: &[usize]) -> Tensor {
        let n: usize = shape.iter().product();
        Tensor::from_vec((0..n).map(|i| i as f32).collect::<Vec<_>>(), Shape::new(shape), Layout::RowMajor).unwrap()
    }

    #[test]
    fn test_round_trip_through_device() {
        for mode in [WorkerMode::Synchronous, WorkerMode::Asynchronous] {
            let dev = device(0, mode);
            let host = iota_f32(&[3, 5]);
            let on_device = host.to_device(&dev, MemoryConfig::dram()).unwrap();
            assert_eq!(on_device.storage_type(), StorageType::Device);
            assert_eq!(on_device.shape(), host.shape());
            let back = on_device.cpu(true, 0).unwrap();
            assert_eq!(back.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
        }
    }

    #[test]
    fn test_non_blocking_cpu() {
        let dev = device(1, WorkerMode::Asynchronous);
        let host = Tensor::from_vec(vec![bf16::from_f32(2.5); 64], [8, 8], Layout::RowMajor).unwrap();
        let on_device = host.to_device(&dev, MemoryConfig::l1()).unwrap();
        let back = on_device.cpu(false, 0).unwrap();
        assert_eq!(back.storage_type(), StorageType::Owned);
        assert_eq!(back.shape().dims(), &[8, 8]);
        dev.drain().unwrap();
        assert!(back.is_populated());
        assert_eq!(back.to_vec::<bf16>().unwrap(), vec![bf16::from_f32(2.5); 64]);
    }

    #[test]
    fn test_cpu_rejects_other_queues() {
        let host = iota_f32(&[2]);
        assert!(matches!(host.cpu(true, 1), Err(TensorError::StorageError(_))));
        assert!(host.cpu(true, 0).unwrap().ptr_eq(&host));
    }

    #[test]
    fn test_same_device_is_identity() {
        let dev = device(2, WorkerMode::Asynchronous);
        let other = device(3, WorkerMode::Asynchronous);
        let on_device = iota_f32(&[4]).to_device(&dev, MemoryConfig::dram()).unwrap();
        assert!(on_device.to_device(&dev, MemoryConfig::dram()).unwrap().ptr_eq(&on_device));
        assert!(on_device.to_device(&other, MemoryConfig::dram()).is_err());
    }

    #[test]
    fn test_height_sharded_placement() {
        let dev = device(4, WorkerMode::Asynchronous);
        let host = iota_f32(&[2, 5, 4]);
        let config = MemoryConfig::sharded(TensorMemoryLayout::HeightSharded, BufferType::L1, Size::new(4, 4));
        let on_device = host.to_device(&dev, config).unwrap();

        let raw = on_device.cpu_sharded().unwrap();
        // 10 rows in shards of 4: three shards, the last padded by two rows
        assert_eq!(raw.shape().dims(), &[12, 4]);
        let raw = raw.to_vec::<f32>().unwrap();
        assert_eq!(&raw[..40], host.to_vec::<f32>().unwrap().as_slice());
        assert!(raw[40..].iter().all(|&v| v == 0.0));

        let back = on_device.cpu(true, 0).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_block_sharded_round_trip() {
        let dev = device(5, WorkerMode::Asynchronous);
        let host = iota_f32(&[6, 6]);
        let config = MemoryConfig::sharded(TensorMemoryLayout::BlockSharded, BufferType::Dram, Size::new(4, 4));
        let on_device = host.to_device(&dev, config).unwrap();
        assert_eq!(on_device.cpu_sharded().unwrap().shape().dims(), &[16, 4]);
        let back = on_device.cpu(false, 0).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_sharded_config_validation() {
        let dev = device(6, WorkerMode::Asynchronous);
        let host = iota_f32(&[8, 8]);
        let bad_width = MemoryConfig::sharded(TensorMemoryLayout::HeightSharded, BufferType::L1, Size::new(4, 4));
        assert!(matches!(host.to_device(&dev, bad_width), Err(TensorError::ShapeError(_))));
        let missing = MemoryConfig { memory_layout: TensorMemoryLayout::WidthSharded, ..MemoryConfig::l1() };
        assert!(host.to_device(&dev, missing).is_err());
        assert!(iota_f32(&[4]).cpu_sharded().is_err());
        let interleaved = host.to_device(&dev, MemoryConfig::dram()).unwrap();
        assert!(interleaved.cpu_sharded().is_err());
    }

    #[test]
    fn test_to_layout_round_trip() {
        let host = iota_f32(&[2, 32, 64]);
        let tiled = host.to_layout(Layout::Tile).unwrap();
        assert_eq!(tiled.layout(), Layout::Tile);
        assert_ne!(tiled.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
        let back = tiled.to_layout(Layout::RowMajor).unwrap();
        assert_eq!(back.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
        assert!(matches!(iota_f32(&[31, 32]).to_layout(Layout::Tile), Err(TensorError::ShapeError(_))));
    }

    #[test]
    fn test_to_layout_rejects_device_and_block_float() {
        let dev = device(7, WorkerMode::Asynchronous);
        let on_device = iota_f32(&[32, 32]).to_device(&dev, MemoryConfig::dram()).unwrap();
        assert!(matches!(on_device.to_layout(Layout::Tile), Err(TensorError::StorageError(_))));
        let bfp = Tensor::zeros([32, 32], DType::BFloat8B, Layout::Tile).unwrap();
        assert!(matches!(bfp.to_layout(Layout::RowMajor), Err(TensorError::TypeError(_))));
    }

    #[test]
    fn test_to_layout_on_worker() {
        let dev = device(8, WorkerMode::Asynchronous);
        let external = HostBuffer::new((0..1024).map(|i| i as f32).collect::<Vec<_>>());
        let borrowed = Tensor::borrowed(external, [32, 32], DType::Float32, Layout::RowMajor).unwrap();
        let tiled = borrowed.to_layout_on(Layout::Tile, &dev).unwrap();
        assert_eq!(tiled.layout(), Layout::Tile);
        assert_eq!(tiled.storage_type(), StorageType::Owned);
        let expected = borrowed.to_layout(Layout::Tile).unwrap().to_vec::<f32>().unwrap();
        assert_eq!(tiled.to_vec::<f32>().unwrap(), expected);
    }

    #[test]
    fn test_to_layout_on_multi_shard() {
        let dev = device(9, WorkerMode::Asynchronous);
        let split = distribute(&iota_f32(&[64, 32]), DistributedTensorConfig::Shard { dim: 0 }, 2).unwrap();
        let tiled = split.to_layout_on(Layout::Tile, &dev).unwrap();
        assert_eq!(tiled.num_shards_to_be_populated(), 2);
        assert_eq!(num_buffers(&tiled), 2);
        let back = tiled.to_layout(Layout::RowMajor).unwrap();
        assert_eq!(aggregate(&back).unwrap().to_vec::<f32>().unwrap(), iota_f32(&[64, 32]).to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_mesh_scatter_gather() {
        let mesh = DeviceMesh::open(MeshConfig {
            rows: 1,
            cols: 4,
            device: DeviceConfig { dram_size: 1 << 14, l1_size: 1 << 10, worker_mode: WorkerMode::Asynchronous },
        })
        .unwrap();
        let host = iota_f32(&[8, 4]);
        let split = distribute(&host, DistributedTensorConfig::Shard { dim: 0 }, 4).unwrap();
        let on_mesh = split.to_mesh(&mesh, MemoryConfig::dram()).unwrap();
        assert_eq!(on_mesh.storage_type(), StorageType::MultiDevice);
        assert_eq!(num_buffers(&on_mesh), 4);
        assert_eq!(shard_for_device(&on_mesh, DeviceId(2)).unwrap().shape().dims(), &[2, 4]);

        let back = on_mesh.cpu(false, 0).unwrap();
        assert_eq!(back.storage_type(), StorageType::MultiDeviceHost);
        let joined = aggregate(&back).unwrap();
        assert_eq!(joined.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());

        let replicated = host.to_mesh(&mesh, MemoryConfig::l1()).unwrap();
        let copies = replicated.cpu(true, 0).unwrap();
        assert_eq!(
            copies.storage().unwrap().distribution(),
            Some(DistributedTensorConfig::Replicate { replication_factor: 4 })
        );
        let third = shard_for_device(&copies, 3usize).unwrap();
        assert_eq!(third.to_vec::<f32>().unwrap(), host.to_vec::<f32>().unwrap());
    }

    #[test]
    fn test_closed_device_surfaces_unavailable() {
        let dev = device(10, WorkerMode::Asynchronous);
        let on_device = iota_f32(&[4]).to_device(&dev, MemoryConfig::dram()).unwrap();
        dev.close();
        let err = on_device.cpu(true, 0).unwrap_err();
        assert!(matches!(err, TensorError::DeviceUnavailable { .. }));
    }
}
