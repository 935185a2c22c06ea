//! End-to-end tests across a device mesh: scatter, gather, worker ordering
//! and the borrowed-storage guard.

use std::sync::Arc;

use half::bf16;
use parking_lot::Mutex;
use tilemesh_core::distributed::{aggregate, distribute, get_tensors_from_multi_device_storage, shard_for_device};
use tilemesh_core::prelude::*;
use tilemesh_core::HostBuffer;

fn iota(n: usize) -> Vec<f32> {
    (0..n).map(|i| i as f32).collect()
}

fn mesh(rows: usize, cols: usize, mode: WorkerMode) -> DeviceMesh {
    let mut config = MeshConfig::new(rows, cols);
    config.device.worker_mode = mode;
    config.device.dram_size = 1 << 20;
    config.device.l1_size = 64 << 10;
    DeviceMesh::open(config).unwrap()
}

// ============================================================================
// Scatter and gather
// ============================================================================

#[test]
fn test_shard_scatter_gather_blocking() {
    let mesh = mesh(1, 4, WorkerMode::Asynchronous);
    let data = iota(8 * 6);
    let host = Tensor::from_vec(data.clone(), [8, 6], Layout::RowMajor).unwrap();

    let scattered = distribute(&host, DistributedTensorConfig::Shard { dim: 0 }, 4).unwrap();
    let on_mesh = scattered.to_mesh(&mesh, MemoryConfig::dram()).unwrap();
    assert_eq!(on_mesh.storage_type(), StorageType::MultiDevice);

    let gathered = on_mesh.cpu(true, 0).unwrap();
    assert_eq!(gathered.storage_type(), StorageType::MultiDeviceHost);
    let joined = aggregate(&gathered).unwrap();
    assert_eq!(joined.shape().dims(), &[8, 6]);
    assert_eq!(joined.to_vec::<f32>().unwrap(), data);
}

#[test]
fn test_shard_2d_scatter_gather_non_blocking() {
    let mesh = mesh(2, 2, WorkerMode::Asynchronous);
    let data = iota(4 * 8);
    let host = Tensor::from_vec(data.clone(), [4, 8], Layout::RowMajor).unwrap();

    let config = DistributedTensorConfig::Shard2D { mesh_rows: 2, mesh_cols: 2 };
    let on_mesh = distribute(&host, config, 4)
        .unwrap()
        .to_mesh(&mesh, MemoryConfig::l1())
        .unwrap();

    let gathered = on_mesh.cpu(false, 0).unwrap();
    let joined = aggregate(&gathered).unwrap();
    assert!(gathered.is_populated());
    assert_eq!(joined.to_vec::<f32>().unwrap(), data);
}

#[test]
fn test_replicated_shards_hold_the_same_data() {
    let mesh = mesh(2, 2, WorkerMode::Synchronous);
    let data: Vec<bf16> = iota(32 * 32).into_iter().map(bf16::from_f32).collect();
    let host = Tensor::from_vec(data.clone(), [32, 32], Layout::RowMajor)
        .unwrap()
        .to_layout(Layout::Tile)
        .unwrap();

    let on_mesh = host.to_mesh(&mesh, MemoryConfig::dram()).unwrap();
    for device in mesh.devices() {
        let shard = shard_for_device(&on_mesh, device).unwrap();
        assert_eq!(shard.storage_type(), StorageType::Device);
        let back = shard.cpu(true, 0).unwrap().to_layout(Layout::RowMajor).unwrap();
        assert_eq!(back.to_vec::<bf16>().unwrap(), data);
    }
}

#[test]
fn test_gathered_shards_keep_device_order() {
    let mesh = mesh(1, 3, WorkerMode::Asynchronous);
    let host = Tensor::from_vec(iota(3 * 4), [3, 4], Layout::RowMajor).unwrap();
    let on_mesh = distribute(&host, DistributedTensorConfig::Shard { dim: 0 }, 3)
        .unwrap()
        .to_mesh(&mesh, MemoryConfig::dram())
        .unwrap();

    let shards = get_tensors_from_multi_device_storage(&on_mesh.cpu(true, 0).unwrap()).unwrap();
    assert_eq!(shards.len(), 3);
    for (i, shard) in shards.iter().enumerate() {
        let first = (i * 4) as f32;
        assert_eq!(shard.to_vec::<f32>().unwrap(), vec![first, first + 1.0, first + 2.0, first + 3.0]);
    }
}

// ============================================================================
// Workers and the borrowed-storage guard
// ============================================================================

#[test]
fn test_worker_runs_tasks_in_submission_order() {
    let mesh = mesh(1, 2, WorkerMode::Asynchronous);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for device in mesh.devices() {
        for i in 0..50 {
            let seen = Arc::clone(&seen);
            let id = device.id();
            device.push_work(move |_| seen.lock().push((id, i))).unwrap();
        }
    }
    mesh.drain().unwrap();

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);
    for device in mesh.devices() {
        let order: Vec<i32> = seen.iter().filter(|(id, _)| *id == device.id()).map(|(_, i)| *i).collect();
        assert_eq!(order, (0..50).collect::<Vec<_>>());
    }
}

#[test]
fn test_borrowed_input_survives_async_upload() {
    let mesh = mesh(1, 1, WorkerMode::Asynchronous);
    let device = &mesh.devices()[0];
    let data = iota(64);
    let borrowed = Tensor::borrowed(HostBuffer::new(data.clone()), [8, 8], DType::Float32, Layout::RowMajor).unwrap();

    let on_device = borrowed.to_device(device, MemoryConfig::dram()).unwrap();
    drop(borrowed);
    let back = on_device.cpu(false, 0).unwrap();
    assert_eq!(back.to_vec::<f32>().unwrap(), data);
}

#[test]
fn test_closing_mesh_rejects_new_work() {
    let mesh = mesh(1, 2, WorkerMode::Asynchronous);
    let host = Tensor::from_vec(iota(16), [4, 4], Layout::RowMajor).unwrap();
    let on_mesh = host.to_mesh(&mesh, MemoryConfig::dram()).unwrap();
    mesh.close();

    let err = on_mesh.cpu(true, 0).unwrap_err();
    assert_eq!(err.kind(), tilemesh_core::ErrorKind::Device);
}
