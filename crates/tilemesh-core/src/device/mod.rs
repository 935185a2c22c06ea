//! Simulated accelerator devices.
//!
//! Each [`Device`] owns a worker thread that exclusively holds the device's
//! memory and executes submitted tasks in FIFO order. Submissions from other
//! threads only ever go through the queue, so device bytes are never shared.

pub mod memory;
pub mod mesh;
mod worker;

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use memory::{BufferType, DeviceMemory, MemoryConfig, TensorMemoryLayout};
pub use mesh::{DeviceMesh, MeshConfig};

use memory::RegionAllocator;
use worker::Task;

use crate::{Result, TensorError};

/// Identifier of a device within a mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Whether submissions block until the worker has executed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerMode {
    Synchronous,
    #[default]
    Asynchronous,
}

/// Per-device settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// DRAM region size in bytes.
    pub dram_size: usize,
    /// L1 region size in bytes.
    pub l1_size: usize,
    pub worker_mode: WorkerMode,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            dram_size: 64 << 20,
            l1_size: 1 << 20,
            worker_mode: WorkerMode::Asynchronous,
        }
    }
}

struct DeviceInner {
    id: DeviceId,
    config: DeviceConfig,
    mode: Mutex<WorkerMode>,
    queue: Mutex<Option<mpsc::Sender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
    dram: Mutex<RegionAllocator>,
    l1: Mutex<RegionAllocator>,
}

impl DeviceInner {
    fn allocator(&self, buffer_type: BufferType) -> &Mutex<RegionAllocator> {
        match buffer_type {
            BufferType::Dram => &self.dram,
            BufferType::L1 => &self.l1,
        }
    }

    fn shutdown(&self) {
        let Some(sender) = self.queue.lock().take() else {
            return;
        };
        let pending = self.pending.load(Ordering::Acquire);
        if pending > 0 {
            tracing::warn!("closing device {} with {} queued tasks; waiting for them", self.id, pending);
        }
        drop(sender);

        if let Some(handle) = self.thread.lock().take() {
            // The last handle can be released by a task running on the worker
            // itself; joining there would wait on our own thread.
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::warn!("device {} worker panicked", self.id);
            }
        }
        tracing::debug!("closed device {}", self.id);
    }
}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Cheap, cloneable handle to an open device.
#[derive(Clone)]
pub struct Device {
    inner: Arc<DeviceInner>,
}

impl Device {
    /// Open device `id`, spawning its worker thread.
    pub fn open(id: DeviceId, config: DeviceConfig) -> Result<Self> {
        let worker = worker::spawn(id, config.dram_size, config.l1_size).map_err(|e| {
            TensorError::DeviceUnavailable {
                device: id,
                reason: format!("failed to spawn worker: {e}"),
            }
        })?;
        tracing::debug!("opened device {id} in {:?} mode", config.worker_mode);
        Ok(Self {
            inner: Arc::new(DeviceInner {
                id,
                mode: Mutex::new(config.worker_mode),
                queue: Mutex::new(Some(worker.sender)),
                thread: Mutex::new(Some(worker.handle)),
                pending: Arc::new(AtomicUsize::new(0)),
                dram: Mutex::new(RegionAllocator::new(config.dram_size)),
                l1: Mutex::new(RegionAllocator::new(config.l1_size)),
                config,
            }),
        })
    }

    pub fn id(&self) -> DeviceId {
        self.inner.id
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.inner.config
    }

    pub fn worker_mode(&self) -> WorkerMode {
        *self.inner.mode.lock()
    }

    pub fn set_worker_mode(&self, mode: WorkerMode) {
        *self.inner.mode.lock() = mode;
    }

    /// Whether the device still accepts work.
    pub fn is_open(&self) -> bool {
        self.inner.queue.lock().is_some()
    }

    /// Tasks submitted but not yet executed.
    pub fn pending_tasks(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// Unallocated bytes in a region.
    pub fn free_bytes(&self, buffer_type: BufferType) -> usize {
        self.inner.allocator(buffer_type).lock().free_bytes()
    }

    /// Reserve `size` bytes in the region named by `memory_config`.
    pub fn allocate(&self, size: usize, memory_config: MemoryConfig) -> Result<DeviceBuffer> {
        let buffer_type = memory_config.buffer_type;
        let address = self
            .inner
            .allocator(buffer_type)
            .lock()
            .allocate(size)
            .ok_or_else(|| {
                TensorError::StorageError(format!(
                    "device {} is out of {buffer_type} memory allocating {size} bytes",
                    self.id()
                ))
            })?;
        tracing::trace!("device {} allocated {size} B of {buffer_type} at {address:#x}", self.id());
        Ok(DeviceBuffer {
            inner: Arc::new(BufferAllocation {
                device: self.clone(),
                address,
                size,
                memory_config,
            }),
        })
    }

    fn unavailable(&self, reason: &str) -> TensorError {
        TensorError::DeviceUnavailable {
            device: self.id(),
            reason: reason.to_string(),
        }
    }

    fn submit(&self, task: Task) -> Result<()> {
        let queue = self.inner.queue.lock();
        let sender = queue.as_ref().ok_or_else(|| self.unavailable("device is closed"))?;
        let pending = Arc::clone(&self.inner.pending);
        pending.fetch_add(1, Ordering::AcqRel);
        let counted: Task = Box::new(move |memory| {
            task(memory);
            pending.fetch_sub(1, Ordering::AcqRel);
        });
        sender.send(counted).map_err(|_| {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.unavailable("worker thread is gone")
        })
    }

    /// Queue a closure for the worker. In synchronous mode this returns only
    /// after the closure has run.
    pub fn push_work<F>(&self, work: F) -> Result<()>
    where
        F: FnOnce(&mut DeviceMemory) + Send + 'static,
    {
        self.submit(Box::new(work))?;
        if self.worker_mode() == WorkerMode::Synchronous {
            self.drain()?;
        }
        Ok(())
    }

    /// Queue a copy of `bytes` into `buffer`.
    pub fn enqueue_write(&self, buffer: &DeviceBuffer, bytes: Vec<u8>) -> Result<()> {
        self.check_owner(buffer)?;
        if bytes.len() > buffer.size() {
            return Err(TensorError::StorageError(format!(
                "cannot write {} bytes into a {} byte buffer on device {}",
                bytes.len(),
                buffer.size(),
                self.id()
            )));
        }
        let target = buffer.clone();
        self.push_work(move |memory| {
            memory.write(target.buffer_type(), target.address(), &bytes);
        })
    }

    /// Queue a read of the whole of `buffer`.
    pub fn enqueue_read(&self, buffer: &DeviceBuffer) -> Result<ReadHandle> {
        self.check_owner(buffer)?;
        let (sender, receiver) = mpsc::sync_channel(1);
        let source = buffer.clone();
        self.push_work(move |memory| {
            let bytes = memory.read(source.buffer_type(), source.address(), source.size());
            let _ = sender.send(bytes);
        })?;
        Ok(ReadHandle {
            device: self.id(),
            receiver,
        })
    }

    /// Block until every task submitted before this call has executed.
    pub fn drain(&self) -> Result<()> {
        let (sender, receiver) = mpsc::sync_channel(1);
        self.submit(Box::new(move |_| {
            let _ = sender.send(());
        }))?;
        receiver
            .recv()
            .map_err(|_| self.unavailable("worker exited before draining"))
    }

    /// Stop accepting work, let the queue run dry, and join the worker.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    fn check_owner(&self, buffer: &DeviceBuffer) -> Result<()> {
        if buffer.device() != self {
            return Err(TensorError::StorageError(format!(
                "buffer belongs to device {}, not device {}",
                buffer.device().id(),
                self.id()
            )));
        }
        Ok(())
    }
}

impl PartialEq for Device {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Device {}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device({})", self.id())
    }
}

struct BufferAllocation {
    device: Device,
    address: usize,
    size: usize,
    memory_config: MemoryConfig,
}

impl Drop for BufferAllocation {
    fn drop(&mut self) {
        self.device
            .inner
            .allocator(self.memory_config.buffer_type)
            .lock()
            .free(self.address, self.size);
    }
}

/// A region of one device's memory. Freed when the last clone drops.
#[derive(Clone)]
pub struct DeviceBuffer {
    inner: Arc<BufferAllocation>,
}

impl DeviceBuffer {
    pub fn device(&self) -> &Device {
        &self.inner.device
    }

    pub fn address(&self) -> usize {
        self.inner.address
    }

    /// Size in bytes as requested at allocation.
    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn buffer_type(&self) -> BufferType {
        self.inner.memory_config.buffer_type
    }

    pub fn memory_config(&self) -> MemoryConfig {
        self.inner.memory_config
    }

    /// Whether both handles name the same allocation.
    pub fn ptr_eq(&self, other: &DeviceBuffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("device", &self.device().id())
            .field("address", &self.address())
            .field("size", &self.size())
            .field("buffer_type", &self.buffer_type())
            .finish()
    }
}

/// Completion of an [`Device::enqueue_read`].
pub struct ReadHandle {
    device: DeviceId,
    receiver: mpsc::Receiver<Vec<u8>>,
}

impl ReadHandle {
    /// Block until the read has executed and return the bytes.
    pub fn wait(self) -> Result<Vec<u8>> {
        self.receiver.recv().map_err(|_| TensorError::DeviceUnavailable {
            device: self.device,
            reason: "worker exited before completing the read".into(),
        })
    }
}
