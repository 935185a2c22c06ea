//! Multi-shard tensors: per-shard access, decomposition and recomposition,
//! and splitting a host tensor across a mesh and joining it back.

use rayon::prelude::*;

use crate::buffer::{HostBuffer, HostElement};
use crate::device::{Device, DeviceId};
use crate::map_host_buffer;
use crate::storage::{
    DeviceStorage, DistributedTensorConfig, MultiDeviceHostStorage, MultiDeviceStorage, Storage, StorageType,
};
use crate::{Layout, Result, Shape, Tensor, TensorError};

/// Which shard of a multi-shard tensor an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardTarget {
    /// The shard held by a device of a `MultiDevice` tensor.
    Device(DeviceId),
    /// The shard at a position of a `MultiDeviceHost` tensor.
    Index(usize),
}

impl From<DeviceId> for ShardTarget {
    fn from(id: DeviceId) -> Self {
        ShardTarget::Device(id)
    }
}

impl From<&Device> for ShardTarget {
    fn from(device: &Device) -> Self {
        ShardTarget::Device(device.id())
    }
}

impl From<usize> for ShardTarget {
    fn from(index: usize) -> Self {
        ShardTarget::Index(index)
    }
}

/// The single-shard tensor that `target` names.
///
/// Single-shard tensors are their own shard and come back unchanged.
pub fn shard_for_device(tensor: &Tensor, target: impl Into<ShardTarget>) -> Result<Tensor> {
    let target = target.into();
    let storage = tensor.storage()?;
    match (&*storage, target) {
        (Storage::MultiDevice(s), ShardTarget::Device(id)) => Tensor::new(
            Storage::Device(DeviceStorage { buffer: s.buffer(id)?.clone() }),
            s.shape(id)?.clone(),
            tensor.dtype(),
            tensor.layout(),
        ),
        (Storage::MultiDeviceHost(s), ShardTarget::Index(index)) => {
            let (buffer, shape) = s.get(index)?;
            Tensor::owned(buffer.clone(), shape.clone(), tensor.dtype(), tensor.layout())
        }
        (Storage::Owned(_) | Storage::Borrowed(_) | Storage::Device(_), _) => Ok(tensor.clone()),
        (other, target) => Err(TensorError::StorageError(format!(
            "cannot address {target:?} in {} storage",
            other.storage_type()
        ))),
    }
}

/// Put `shard` into `target` at `destination`.
///
/// Host shards replace the buffer at an index or are appended when the index
/// equals the shard count; device shards replace or register the shard of a
/// device. Everything is validated before `target` is touched.
pub fn install_shard(target: &Tensor, shard: &Tensor, destination: impl Into<ShardTarget>) -> Result<()> {
    let destination = destination.into();
    let source = shard.storage()?.clone();
    let shard_shape = shard.shape().clone();
    let mismatch = |dst: StorageType, src: StorageType| {
        TensorError::StorageError(format!(
            "cannot install a {src} shard into {dst} storage at {destination:?}"
        ))
    };
    let same_volume = |expected: &Shape| -> Result<()> {
        if expected.volume() != shard_shape.volume() {
            return Err(TensorError::ShapeMismatch {
                expected: expected.dims().to_vec(),
                got: shard_shape.dims().to_vec(),
            });
        }
        Ok(())
    };
    let target_shape = target.shape().clone();

    target.update_storage(|storage| {
        let dst_type = storage.storage_type();
        match (storage, source, destination) {
            (Storage::MultiDeviceHost(s), Storage::Owned(owned), ShardTarget::Index(index)) => {
                s.insert(index, owned.buffer, shard_shape.clone())
            }
            (Storage::MultiDevice(s), Storage::Device(dev), ShardTarget::Device(id)) => {
                if dev.buffer.device().id() != id {
                    return Err(TensorError::StorageError(format!(
                        "shard lives on device {}, not device {id}",
                        dev.buffer.device().id()
                    )));
                }
                s.insert(id, dev.buffer, shard_shape.clone());
                Ok(())
            }
            (Storage::Owned(dst), Storage::Owned(src), _) => {
                same_volume(&target_shape)?;
                dst.buffer = src.buffer;
                Ok(())
            }
            (Storage::Device(dst), Storage::Device(src), _) => {
                same_volume(&target_shape)?;
                dst.buffer = src.buffer;
                Ok(())
            }
            (_, src, _) => Err(mismatch(dst_type, src.storage_type())),
        }
    })
}

/// Number of buffers behind a tensor: 1 unless it is multi-shard.
pub fn num_buffers(tensor: &Tensor) -> usize {
    tensor.with_storage(Storage::num_buffers)
}

/// Devices of a `MultiDevice` tensor, in shard order.
pub fn devices(tensor: &Tensor) -> Result<Vec<Device>> {
    match &*tensor.storage()? {
        Storage::MultiDevice(s) => Ok(s.devices()),
        other => Err(TensorError::StorageError(format!(
            "tensor is not a multi-device tensor (storage is {})",
            other.storage_type()
        ))),
    }
}

/// Split a multi-shard tensor into one single-shard tensor per shard.
/// Single-shard tensors yield themselves.
pub fn get_tensors_from_multi_device_storage(tensor: &Tensor) -> Result<Vec<Tensor>> {
    let storage = tensor.storage()?;
    match &*storage {
        Storage::MultiDevice(s) => s
            .ordered_device_ids
            .iter()
            .map(|&id| {
                Tensor::new(
                    Storage::Device(DeviceStorage { buffer: s.buffer(id)?.clone() }),
                    s.shape(id)?.clone(),
                    tensor.dtype(),
                    tensor.layout(),
                )
            })
            .collect(),
        Storage::MultiDeviceHost(s) => s
            .buffers
            .iter()
            .zip(&s.shapes)
            .map(|(buffer, shape)| Tensor::owned(buffer.clone(), shape.clone(), tensor.dtype(), tensor.layout()))
            .collect(),
        Storage::Owned(_) | Storage::Borrowed(_) | Storage::Device(_) => Ok(vec![tensor.clone()]),
    }
}

/// Reassemble single-shard tensors into one multi-shard tensor of kind
/// `storage_type`. The result takes its shape from the first shard.
pub fn create_multi_device_tensor(
    tensors: &[Tensor],
    storage_type: StorageType,
    config: DistributedTensorConfig,
) -> Result<Tensor> {
    let first = tensors
        .first()
        .ok_or_else(|| TensorError::StorageError("no shards to assemble".into()))?;
    let (dtype, layout) = (first.dtype(), first.layout());
    for t in tensors {
        if t.dtype() != dtype || t.layout() != layout {
            return Err(TensorError::TypeError(format!(
                "shards disagree: {dtype}/{layout} vs {}/{}",
                t.dtype(),
                t.layout()
            )));
        }
    }

    let storage = match storage_type {
        StorageType::MultiDevice => {
            let mut multi = MultiDeviceStorage::new(config);
            for t in tensors {
                let buffer = match &*t.storage()? {
                    Storage::Device(d) => d.buffer.clone(),
                    other => {
                        return Err(TensorError::StorageError(format!(
                            "multi-device tensors need device shards, got {}",
                            other.storage_type()
                        )))
                    }
                };
                let id = buffer.device().id();
                if multi.buffers.contains_key(&id) {
                    return Err(TensorError::StorageError(format!("device {id} holds more than one shard")));
                }
                multi.insert(id, buffer, t.shape().clone());
            }
            Storage::MultiDevice(multi)
        }
        StorageType::MultiDeviceHost => {
            let mut buffers = Vec::with_capacity(tensors.len());
            for t in tensors {
                buffers.push(t.host_buffer()?);
            }
            let shapes = tensors.iter().map(|t| t.shape().clone()).collect();
            Storage::MultiDeviceHost(MultiDeviceHostStorage::new(config, buffers, shapes))
        }
        other => {
            return Err(TensorError::StorageError(format!(
                "cannot assemble shards into {other} storage"
            )))
        }
    };
    Tensor::new(storage, first.shape().clone(), dtype, layout)
}

/// Apply `f` to every shard in parallel and reassemble the results with the
/// input's storage kind and distribution. Single-shard tensors are passed to
/// `f` directly.
pub fn transform<F>(tensor: &Tensor, f: F) -> Result<Tensor>
where
    F: Fn(&Tensor) -> Result<Tensor> + Sync + Send,
{
    let (storage_type, config) = tensor.with_storage(|s| (s.storage_type(), s.distribution()));
    let Some(config) = config else {
        return f(tensor);
    };
    let shards = get_tensors_from_multi_device_storage(tensor)?;
    let outputs = shards.par_iter().map(|shard| f(shard)).collect::<Result<Vec<_>>>()?;
    create_multi_device_tensor(&outputs, storage_type, config)
}

/// Run `f` on every shard for its side effects.
pub fn apply<F>(tensor: &Tensor, f: F) -> Result<()>
where
    F: Fn(&Tensor) + Sync + Send,
{
    let shards = get_tensors_from_multi_device_storage(tensor)?;
    shards.par_iter().for_each(|shard| f(shard));
    Ok(())
}

// =============================================================================
// Mesh mappers
// =============================================================================

/// Split a single-shard host tensor into `num_shards` host shards.
///
/// `Replicate` and `AllGather` share the source buffer in every shard,
/// `Shard { dim }` cuts `dim` into equal slices, and `Shard2D` cuts the second
/// to last dim into `mesh_rows` and the last into `mesh_cols`, numbering shards
/// row-major.
pub fn distribute(tensor: &Tensor, config: DistributedTensorConfig, num_shards: usize) -> Result<Tensor> {
    if num_shards == 0 {
        return Err(TensorError::ShapeError("cannot distribute over zero shards".into()));
    }
    let buffer = tensor.host_buffer()?;
    let shape = tensor.shape().clone();

    let (config, buffers, shapes) = match config {
        DistributedTensorConfig::Replicate { .. } | DistributedTensorConfig::AllGather => {
            let config = match config {
                DistributedTensorConfig::AllGather => config,
                _ => DistributedTensorConfig::Replicate { replication_factor: num_shards },
            };
            (config, vec![buffer; num_shards], vec![shape; num_shards])
        }
        DistributedTensorConfig::Shard { dim } => {
            require_row_major(tensor)?;
            let pieces = split(&buffer, &shape, dim, num_shards)?;
            let (buffers, shapes): (Vec<_>, Vec<_>) = pieces.into_iter().unzip();
            (config, buffers, shapes)
        }
        DistributedTensorConfig::Shard2D { mesh_rows, mesh_cols } => {
            require_row_major(tensor)?;
            if mesh_rows * mesh_cols != num_shards {
                return Err(TensorError::ShapeError(format!(
                    "a {mesh_rows}x{mesh_cols} grid does not have {num_shards} shards"
                )));
            }
            if shape.rank() < 2 {
                return Err(TensorError::ShapeError(format!("2-D sharding needs rank >= 2, got {shape}")));
            }
            let rank = shape.rank();
            let mut buffers = Vec::with_capacity(num_shards);
            let mut shapes = Vec::with_capacity(num_shards);
            for (row_buffer, row_shape) in split(&buffer, &shape, rank - 2, mesh_rows)? {
                for (b, s) in split(&row_buffer, &row_shape, rank - 1, mesh_cols)? {
                    buffers.push(b);
                    shapes.push(s);
                }
            }
            (config, buffers, shapes)
        }
    };
    tracing::debug!("distributed {} tensor {} as {config} over {num_shards} shards", tensor.dtype(), tensor.shape());
    let first = shapes[0].clone();
    Tensor::new(
        Storage::MultiDeviceHost(MultiDeviceHostStorage::new(config, buffers, shapes)),
        first,
        tensor.dtype(),
        tensor.layout(),
    )
}

/// Join the shards of a `MultiDeviceHost` tensor back into one owned tensor,
/// undoing [`distribute`].
pub fn aggregate(tensor: &Tensor) -> Result<Tensor> {
    let storage = tensor.storage()?;
    let Storage::MultiDeviceHost(host) = &*storage else {
        return Err(TensorError::StorageError(format!(
            "aggregate needs multi-device host storage, found {}",
            storage.storage_type()
        )));
    };
    if host.buffers.is_empty() {
        return Err(TensorError::StorageError("no shards to aggregate".into()));
    }

    let (buffer, shape) = match host.config {
        DistributedTensorConfig::Replicate { .. } | DistributedTensorConfig::AllGather => {
            (host.buffers[0].clone(), host.shapes[0].clone())
        }
        DistributedTensorConfig::Shard { dim } => {
            require_row_major(tensor)?;
            concat(&host.buffers, &host.shapes, dim)?
        }
        DistributedTensorConfig::Shard2D { mesh_rows, mesh_cols } => {
            require_row_major(tensor)?;
            if host.buffers.len() != mesh_rows * mesh_cols {
                return Err(TensorError::ShapeError(format!(
                    "{} shards cannot fill a {mesh_rows}x{mesh_cols} grid",
                    host.buffers.len()
                )));
            }
            let rank = host.shapes[0].rank();
            let mut row_buffers = Vec::with_capacity(mesh_rows);
            let mut row_shapes = Vec::with_capacity(mesh_rows);
            for r in 0..mesh_rows {
                let span = r * mesh_cols..(r + 1) * mesh_cols;
                let (b, s) = concat(&host.buffers[span.clone()], &host.shapes[span], rank - 1)?;
                row_buffers.push(b);
                row_shapes.push(s);
            }
            concat(&row_buffers, &row_shapes, rank - 2)?
        }
    };
    Tensor::owned(buffer, shape, tensor.dtype(), tensor.layout())
}

fn require_row_major(tensor: &Tensor) -> Result<()> {
    if tensor.layout() != Layout::RowMajor {
        return Err(TensorError::TypeError(format!(
            "sharding along a dimension needs row-major layout, got {}",
            tensor.layout()
        )));
    }
    Ok(())
}

/// `(outer, inner)` extents around `dim`.
fn extents(shape: &Shape, dim: usize) -> (usize, usize) {
    let outer = shape.dims()[..dim].iter().product();
    let inner = shape.dims()[dim + 1..].iter().product();
    (outer, inner)
}

fn split(buffer: &HostBuffer, shape: &Shape, dim: usize, parts: usize) -> Result<Vec<(HostBuffer, Shape)>> {
    if dim >= shape.rank() {
        return Err(TensorError::ShapeError(format!("cannot shard dim {dim} of {shape}")));
    }
    if parts == 0 || shape[dim] % parts != 0 {
        return Err(TensorError::ShapeError(format!(
            "dim {dim} of {shape} does not split evenly into {parts} shards"
        )));
    }
    let chunk = shape[dim] / parts;
    let mut piece_dims = shape.dims().to_vec();
    piece_dims[dim] = chunk;
    let piece_shape = Shape::from(piece_dims);
    let (outer, inner) = extents(shape, dim);

    Ok((0..parts)
        .map(|p| {
            let piece = map_host_buffer!(buffer, data => {
                let mut out = Vec::with_capacity(piece_shape.volume());
                for o in 0..outer {
                    let start = (o * shape[dim] + p * chunk) * inner;
                    out.extend_from_slice(&data[start..start + chunk * inner]);
                }
                HostBuffer::new(out)
            });
            (piece, piece_shape.clone())
        })
        .collect())
}

fn concat(buffers: &[HostBuffer], shapes: &[Shape], dim: usize) -> Result<(HostBuffer, Shape)> {
    let first = &shapes[0];
    if dim >= first.rank() {
        return Err(TensorError::ShapeError(format!("cannot concatenate along dim {dim} of {first}")));
    }
    for s in shapes {
        let same_rank = s.rank() == first.rank();
        let same_others = same_rank && (0..s.rank()).all(|d| d == dim || s[d] == first[d]);
        if !same_others {
            return Err(TensorError::ShapeMismatch {
                expected: first.dims().to_vec(),
                got: s.dims().to_vec(),
            });
        }
    }
    let mut dims = first.dims().to_vec();
    dims[dim] = shapes.iter().map(|s| s[dim]).sum();
    let shape = Shape::from(dims);
    let buffer = map_host_buffer!(&buffers[0], like => concat_typed(like.as_slice(), buffers, shapes, dim)?);
    Ok((buffer, shape))
}

fn concat_typed<T: HostElement>(_like: &[T], buffers: &[HostBuffer], shapes: &[Shape], dim: usize) -> Result<HostBuffer> {
    let parts = buffers.iter().map(|b| b.as_slice::<T>()).collect::<Result<Vec<_>>>()?;
    let (outer, _) = extents(&shapes[0], dim);
    let total: usize = parts.iter().map(|p| p.len()).sum();
    let mut out = Vec::with_capacity(total);
    for o in 0..outer {
        for (part, shape) in parts.iter().zip(shapes) {
            let (_, inner) = extents(shape, dim);
            let run = shape[dim] * inner;
            out.extend_from_slice(&part[o * run..(o + 1) * run]);
        }
    }
    Ok(HostBuffer::new(out))
}
