use std::sync::mpsc::{Receiver, Sender};
use std::thread::{self, JoinHandle};

use super::memory::DeviceMemory;
use super::DeviceId;

/// A unit of work executed on a device's worker thread.
pub(crate) type Task = Box<dyn FnOnce(&mut DeviceMemory) + Send + 'static>;

/// Sending half of a device's queue plus the thread draining it.
pub(crate) struct Worker {
    pub(crate) sender: Sender<Task>,
    pub(crate) handle: JoinHandle<()>,
}

/// Spawn the worker for `id`. The thread owns the device memory and runs
/// tasks strictly in submission order until every sender is gone.
pub(crate) fn spawn(id: DeviceId, dram_size: usize, l1_size: usize) -> std::io::Result<Worker> {
    let (sender, receiver) = std::sync::mpsc::channel::<Task>();
    let handle = thread::Builder::new()
        .name(format!("tilemesh-device-{id}"))
        .spawn(move || run(id, dram_size, l1_size, receiver))?;
    Ok(Worker { sender, handle })
}

fn run(id: DeviceId, dram_size: usize, l1_size: usize, receiver: Receiver<Task>) {
    let mut memory = DeviceMemory::new(dram_size, l1_size);
    tracing::debug!("device {id} worker started ({dram_size} B dram, {l1_size} B l1)");
    let mut executed = 0usize;
    while let Ok(task) = receiver.recv() {
        task(&mut memory);
        executed += 1;
        tracing::trace!("device {id} executed task {executed}");
    }
    tracing::debug!("device {id} worker exiting after {executed} tasks");
}
