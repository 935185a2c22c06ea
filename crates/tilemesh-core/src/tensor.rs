use std::fmt;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};

use crate::buffer::{HostBuffer, HostElement};
use crate::storage::{BorrowedStorage, OwnedStorage, Storage, StorageType};
use crate::tile::{Layout, Tile};
use crate::{DType, Result, Shape, TensorError};

/// Counts down as a worker fills in the shards of a tensor it produces.
struct Population {
    state: Mutex<PopulationState>,
    ready: Condvar,
}

struct PopulationState {
    remaining: usize,
    error: Option<TensorError>,
}

impl Population {
    fn new(remaining: usize) -> Self {
        Self {
            state: Mutex::new(PopulationState { remaining, error: None }),
            ready: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock();
        while state.remaining > 0 {
            self.ready.wait(&mut state);
        }
        match &state.error {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().remaining == 0
    }

    fn complete_one(&self, outcome: Result<()>) {
        let mut state = self.state.lock();
        if let Err(e) = outcome {
            state.error.get_or_insert(e);
        }
        state.remaining = state.remaining.saturating_sub(1);
        if state.remaining == 0 {
            self.ready.notify_all();
        }
    }
}

/// Everything a [`Tensor`] handle points at.
pub struct TensorAttributes {
    shape: Shape,
    dtype: DType,
    layout: Layout,
    tile: Tile,
    storage: RwLock<Storage>,
    num_shards_to_be_populated: usize,
    population: Population,
}

/// Handle to a tensor. Clones share the same attributes and storage.
///
/// Shape, dtype, layout and storage kind are valid as soon as the handle
/// exists. When a worker produces the tensor asynchronously, host data becomes
/// readable once every shard has been populated; accessors that need the bytes
/// wait for that.
#[derive(Clone)]
pub struct Tensor {
    attributes: Arc<TensorAttributes>,
}

impl Tensor {
    // =========================================================================
    // Constructors
    // =========================================================================

    /// Wrap existing storage with the given metadata.
    pub fn new(storage: Storage, shape: impl Into<Shape>, dtype: DType, layout: Layout) -> Result<Self> {
        let shape = shape.into();
        validate(&storage, &shape, dtype, layout)?;
        Ok(Self::with_population(storage, shape, dtype, layout, 0))
    }

    /// Tensor that exclusively owns `buffer`.
    pub fn owned(buffer: HostBuffer, shape: impl Into<Shape>, dtype: DType, layout: Layout) -> Result<Self> {
        Self::new(Storage::Owned(OwnedStorage { buffer }), shape, dtype, layout)
    }

    /// Tensor that aliases an externally managed `buffer`.
    pub fn borrowed(buffer: HostBuffer, shape: impl Into<Shape>, dtype: DType, layout: Layout) -> Result<Self> {
        Self::new(Storage::Borrowed(BorrowedStorage { buffer }), shape, dtype, layout)
    }

    /// Owned tensor from a typed vector; the dtype follows the element type.
    pub fn from_vec<T: HostElement>(data: Vec<T>, shape: impl Into<Shape>, layout: Layout) -> Result<Self> {
        Self::owned(HostBuffer::new(data), shape, T::DTYPE, layout)
    }

    /// Zero-filled owned tensor.
    pub fn zeros(shape: impl Into<Shape>, dtype: DType, layout: Layout) -> Result<Self> {
        let shape = shape.into();
        let buffer = HostBuffer::zeros(dtype, dtype.buffer_elements(shape.volume()));
        Self::owned(buffer, shape, dtype, layout)
    }

    /// Tensor whose storage a worker will fill in `num_shards` steps. Callers
    /// report each step through [`Tensor::complete_shard`].
    pub(crate) fn pending(storage: Storage, shape: Shape, dtype: DType, layout: Layout, num_shards: usize) -> Self {
        Self::with_population(storage, shape, dtype, layout, num_shards)
    }

    fn with_population(storage: Storage, shape: Shape, dtype: DType, layout: Layout, pending: usize) -> Self {
        Self {
            attributes: Arc::new(TensorAttributes {
                shape,
                dtype,
                layout,
                tile: Tile::default(),
                storage: RwLock::new(storage),
                num_shards_to_be_populated: pending.max(1),
                population: Population::new(pending),
            }),
        }
    }

    // =========================================================================
    // Metadata
    // =========================================================================

    pub fn shape(&self) -> &Shape {
        &self.attributes.shape
    }

    pub fn dtype(&self) -> DType {
        self.attributes.dtype
    }

    pub fn layout(&self) -> Layout {
        self.attributes.layout
    }

    pub fn tile(&self) -> Tile {
        self.attributes.tile
    }

    pub fn volume(&self) -> usize {
        self.attributes.shape.volume()
    }

    /// Kind of storage. Never waits.
    pub fn storage_type(&self) -> StorageType {
        self.attributes.storage.read().storage_type()
    }

    pub fn is_host(&self) -> bool {
        self.attributes.storage.read().is_host()
    }

    /// Number of shards the producing worker fills in; 1 for ordinary tensors.
    pub fn num_shards_to_be_populated(&self) -> usize {
        self.attributes.num_shards_to_be_populated
    }

    /// Whether both handles point at the same tensor.
    pub fn ptr_eq(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.attributes, &other.attributes)
    }

    // =========================================================================
    // Contents
    // =========================================================================

    /// Block until every shard has been populated, surfacing a worker failure.
    pub fn wait(&self) -> Result<()> {
        self.attributes.population.wait()
    }

    pub fn is_populated(&self) -> bool {
        self.attributes.population.is_ready()
    }

    /// Read access to the storage once it is populated.
    pub fn storage(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.wait()?;
        Ok(self.attributes.storage.read())
    }

    /// Shared handle to the host buffer of a single-shard host tensor.
    pub fn host_buffer(&self) -> Result<HostBuffer> {
        self.storage()?.host_buffer().cloned()
    }

    /// Copy of the elements of a single-shard host tensor.
    pub fn to_vec<T: HostElement>(&self) -> Result<Vec<T>> {
        self.host_buffer()?.to_vec::<T>()
    }

    /// Run `f` on the storage as it is right now, without waiting for
    /// population.
    pub fn with_storage<R>(&self, f: impl FnOnce(&Storage) -> R) -> R {
        f(&self.attributes.storage.read())
    }

    /// Mutate the storage in place. Validation must happen inside `update`
    /// before anything is written.
    pub(crate) fn update_storage<R>(&self, update: impl FnOnce(&mut Storage) -> Result<R>) -> Result<R> {
        update(&mut self.attributes.storage.write())
    }

    /// Record that one pending shard has been filled in (or failed).
    pub(crate) fn complete_shard(&self, outcome: Result<()>) {
        self.attributes.population.complete_one(outcome);
    }
}

fn validate(storage: &Storage, shape: &Shape, dtype: DType, layout: Layout) -> Result<()> {
    if dtype.is_block_float() && layout != Layout::Tile {
        return Err(TensorError::TypeError(format!("{dtype} tensors must use tile layout")));
    }
    if layout == Layout::Tile && !Tile::default().is_aligned(shape) {
        return Err(TensorError::ShapeError(format!(
            "tile layout needs the last two dims of {shape} to be multiples of 32"
        )));
    }
    let check = |buffer: &HostBuffer, shape: &Shape| -> Result<()> {
        if buffer.dtype() != dtype.buffer_dtype() {
            return Err(TensorError::TypeError(format!(
                "{dtype} tensor cannot be backed by a {} buffer",
                buffer.dtype()
            )));
        }
        let expected = dtype.buffer_elements(shape.volume());
        if buffer.len() != expected {
            return Err(TensorError::ShapeMismatch {
                expected: shape.dims().to_vec(),
                got: vec![buffer.len()],
            });
        }
        Ok(())
    };
    match storage {
        Storage::Owned(s) => check(&s.buffer, shape),
        Storage::Borrowed(s) => check(&s.buffer, shape),
        Storage::MultiDeviceHost(s) => {
            for (buffer, shard_shape) in s.buffers.iter().zip(&s.shapes) {
                check(buffer, shard_shape)?;
            }
            Ok(())
        }
        Storage::Device(_) | Storage::MultiDevice(_) => Ok(()),
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, layout={}, storage={})",
            self.shape(),
            self.dtype(),
            self.layout(),
            self.storage_type()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use half::bf16;

    #[test]
    fn test_from_vec() {
        let t = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], [2, 3], Layout::RowMajor).unwrap();
        assert_eq!(t.shape().dims(), &[2, 3]);
        assert_eq!(t.dtype(), DType::Float32);
        assert_eq!(t.storage_type(), StorageType::Owned);
        assert_eq!(t.to_vec::<f32>().unwrap(), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert!(t.is_populated());
        assert_eq!(t.num_shards_to_be_populated(), 1);
    }

    #[test]
    fn test_clone_shares_attributes() {
        let t = Tensor::from_vec(vec![bf16::ONE; 4], [4], Layout::RowMajor).unwrap();
        let u = t.clone();
        assert!(t.ptr_eq(&u));
        assert!(t.host_buffer().unwrap().ptr_eq(&u.host_buffer().unwrap()));
    }

    #[test]
    fn test_volume_mismatch_rejected() {
        let err = Tensor::from_vec(vec![0u32; 5], [2, 3], Layout::RowMajor).unwrap_err();
        assert!(matches!(err, TensorError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_dtype_buffer_mismatch_rejected() {
        let err = Tensor::owned(HostBuffer::new(vec![0u32; 4]), [4], DType::Float32, Layout::RowMajor).unwrap_err();
        assert!(matches!(err, TensorError::TypeError(_)));
    }

    #[test]
    fn test_tile_layout_alignment() {
        assert!(Tensor::zeros([32, 64], DType::BFloat16, Layout::Tile).is_ok());
        assert!(Tensor::zeros([30, 64], DType::BFloat16, Layout::Tile).is_err());
        assert!(Tensor::zeros([32, 32], DType::BFloat8B, Layout::RowMajor).is_err());
        let bfp = Tensor::zeros([32, 32], DType::BFloat8B, Layout::Tile).unwrap();
        assert_eq!(bfp.host_buffer().unwrap().len(), 272);
    }

    #[test]
    fn test_pending_tensor_waits_for_population() {
        let storage = Storage::Owned(OwnedStorage { buffer: HostBuffer::zeros(DType::UInt32, 2) });
        let t = Tensor::pending(storage, Shape::new(&[2]), DType::UInt32, Layout::RowMajor, 1);
        assert_eq!(t.storage_type(), StorageType::Owned);
        assert!(!t.is_populated());

        let producer = t.clone();
        let handle = std::thread::spawn(move || {
            producer
                .update_storage(|s| {
                    *s = Storage::Owned(OwnedStorage { buffer: HostBuffer::new(vec![5u32, 6]) });
                    Ok(())
                })
                .unwrap();
            producer.complete_shard(Ok(()));
        });
        assert_eq!(t.to_vec::<u32>().unwrap(), vec![5, 6]);
        handle.join().unwrap();
    }

    #[test]
    fn test_population_error_propagates() {
        let storage = Storage::Owned(OwnedStorage { buffer: HostBuffer::zeros(DType::UInt32, 1) });
        let t = Tensor::pending(storage, Shape::new(&[1]), DType::UInt32, Layout::RowMajor, 2);
        t.complete_shard(Err(TensorError::StorageError("boom".into())));
        t.complete_shard(Ok(()));
        assert!(matches!(t.wait(), Err(TensorError::StorageError(_))));
        assert_eq!(t.num_shards_to_be_populated(), 2);
    }
}
