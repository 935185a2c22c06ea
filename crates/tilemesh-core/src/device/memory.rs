//! Device memory regions, their allocators, and memory configs.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::sharding::Size;

/// Allocation granularity in bytes for both regions.
pub const ALLOCATION_ALIGNMENT: usize = 32;

/// Which memory region a device buffer lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum BufferType {
    #[default]
    Dram,
    L1,
}

impl fmt::Display for BufferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BufferType::Dram => write!(f, "dram"),
            BufferType::L1 => write!(f, "l1"),
        }
    }
}

/// How a buffer's pages are spread over the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum TensorMemoryLayout {
    #[default]
    Interleaved,
    HeightSharded,
    WidthSharded,
    BlockSharded,
}

impl TensorMemoryLayout {
    pub fn is_sharded(&self) -> bool {
        !matches!(self, TensorMemoryLayout::Interleaved)
    }
}

/// Placement of a device buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemoryConfig {
    pub memory_layout: TensorMemoryLayout,
    pub buffer_type: BufferType,
    /// Shard shape in elements of the tensor's 2-D view. Required for sharded
    /// layouts.
    pub shard_shape: Option<Size>,
}

impl MemoryConfig {
    /// Interleaved DRAM, the default placement.
    pub fn dram() -> Self {
        Self::default()
    }

    /// Interleaved L1.
    pub fn l1() -> Self {
        Self {
            buffer_type: BufferType::L1,
            ..Self::default()
        }
    }

    /// Sharded placement in the given region.
    pub fn sharded(memory_layout: TensorMemoryLayout, buffer_type: BufferType, shard_shape: Size) -> Self {
        Self {
            memory_layout,
            buffer_type,
            shard_shape: Some(shard_shape),
        }
    }

    pub fn is_sharded(&self) -> bool {
        self.memory_layout.is_sharded()
    }
}

/// First-fit free-list allocator over one region.
#[derive(Debug)]
pub(crate) struct RegionAllocator {
    size: usize,
    /// Free blocks as `(offset, len)`, sorted by offset and never adjacent.
    free: Vec<(usize, usize)>,
}

impl RegionAllocator {
    pub(crate) fn new(size: usize) -> Self {
        let free = if size > 0 { vec![(0, size)] } else { Vec::new() };
        Self { size, free }
    }

    /// Bytes reserved for a request of `size` bytes.
    pub(crate) fn rounded(size: usize) -> usize {
        size.max(1).div_ceil(ALLOCATION_ALIGNMENT) * ALLOCATION_ALIGNMENT
    }

    /// Reserve `size` bytes, returning the offset of the block.
    pub(crate) fn allocate(&mut self, size: usize) -> Option<usize> {
        let size = Self::rounded(size);
        let slot = self.free.iter().position(|&(_, len)| len >= size)?;
        let (offset, len) = self.free[slot];
        if len == size {
            self.free.remove(slot);
        } else {
            self.free[slot] = (offset + size, len - size);
        }
        Some(offset)
    }

    /// Return a block previously handed out by [`allocate`](Self::allocate).
    pub(crate) fn free(&mut self, offset: usize, size: usize) {
        let size = Self::rounded(size);
        let slot = self.free.partition_point(|&(o, _)| o < offset);
        self.free.insert(slot, (offset, size));
        if slot + 1 < self.free.len() && offset + size == self.free[slot + 1].0 {
            self.free[slot].1 += self.free[slot + 1].1;
            self.free.remove(slot + 1);
        }
        if slot > 0 && self.free[slot - 1].0 + self.free[slot - 1].1 == offset {
            self.free[slot - 1].1 += self.free[slot].1;
            self.free.remove(slot);
        }
    }

    pub(crate) fn free_bytes(&self) -> usize {
        self.free.iter().map(|&(_, len)| len).sum()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.size
    }
}

/// The bytes of one device. Only the device's worker thread ever touches it.
pub struct DeviceMemory {
    dram: Vec<u8>,
    l1: Vec<u8>,
}

impl DeviceMemory {
    pub(crate) fn new(dram_size: usize, l1_size: usize) -> Self {
        Self {
            dram: vec![0u8; dram_size],
            l1: vec![0u8; l1_size],
        }
    }

    fn region(&self, buffer_type: BufferType) -> &[u8] {
        match buffer_type {
            BufferType::Dram => &self.dram,
            BufferType::L1 => &self.l1,
        }
    }

    fn region_mut(&mut self, buffer_type: BufferType) -> &mut [u8] {
        match buffer_type {
            BufferType::Dram => &mut self.dram,
            BufferType::L1 => &mut self.l1,
        }
    }

    /// Copy `bytes` to `address` in the given region.
    pub fn write(&mut self, buffer_type: BufferType, address: usize, bytes: &[u8]) {
        self.region_mut(buffer_type)[address..address + bytes.len()].copy_from_slice(bytes);
    }

    /// Copy `len` bytes out of the given region starting at `address`.
    pub fn read(&self, buffer_type: BufferType, address: usize, len: usize) -> Vec<u8> {
        self.region(buffer_type)[address..address + len].to_vec()
    }
}
