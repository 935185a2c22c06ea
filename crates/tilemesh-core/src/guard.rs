use crate::device::{Device, WorkerMode};
use crate::storage::Storage;
use crate::{Result, Tensor};

/// Make `tensor` safe to hand to `worker`'s queue.
///
/// A borrowed buffer may be released by its owner while an asynchronous
/// worker still holds it, so single-shard borrowed tensors are copied into an
/// owned buffer. Everything else is returned as the same handle.
pub fn prepare_for_worker(worker: &Device, tensor: &Tensor) -> Result<Tensor> {
    if worker.worker_mode() == WorkerMode::Synchronous || tensor.num_shards_to_be_populated() > 1 {
        return Ok(tensor.clone());
    }
    let buffer = match &*tensor.storage()? {
        Storage::Borrowed(borrowed) => borrowed.buffer.deep_copy(),
        Storage::Owned(_) | Storage::Device(_) | Storage::MultiDevice(_) | Storage::MultiDeviceHost(_) => {
            return Ok(tensor.clone());
        }
    };
    tracing::debug!(
        "copying borrowed {} tensor {} before queueing it on device {}",
        tensor.dtype(),
        tensor.shape(),
        worker.id()
    );
    Tensor::owned(buffer, tensor.shape().clone(), tensor.dtype(), tensor.layout())
}
