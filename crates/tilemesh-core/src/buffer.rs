use std::fmt;
use std::sync::Arc;

use half::bf16;

use crate::{DType, Result, TensorError};

/// Plain element types that a [`HostBuffer`] can hold.
pub trait HostElement:
    bytemuck::Pod + Default + PartialEq + fmt::Debug + Send + Sync + 'static
{
    const DTYPE: DType;

    /// Wrap an owned vector into the matching buffer variant.
    fn wrap(data: Vec<Self>) -> HostBuffer;

    /// Borrow the elements if `buffer` holds this type.
    fn view(buffer: &HostBuffer) -> Option<&[Self]>;

    fn from_f32(v: f32) -> Self;
    fn to_f32(self) -> f32;
}

/// Reference-counted host vector of one of the plain element types.
///
/// Cloning shares the allocation. Block-float tensors are backed by `UInt32`
/// buffers holding packed words.
#[derive(Clone)]
pub enum HostBuffer {
    BFloat16(Arc<Vec<bf16>>),
    Float32(Arc<Vec<f32>>),
    UInt32(Arc<Vec<u32>>),
    Int32(Arc<Vec<i32>>),
    UInt16(Arc<Vec<u16>>),
    UInt8(Arc<Vec<u8>>),
}

/// Run `$body` with `$data` bound to the typed `Arc<Vec<T>>` of whichever
/// variant `$buffer` holds. Every arm must produce the same type.
#[macro_export]
macro_rules! map_host_buffer {
    ($buffer:expr, $data:ident => $body:expr) => {
        match $buffer {
            $crate::buffer::HostBuffer::BFloat16($data) => $body,
            $crate::buffer::HostBuffer::Float32($data) => $body,
            $crate::buffer::HostBuffer::UInt32($data) => $body,
            $crate::buffer::HostBuffer::Int32($data) => $body,
            $crate::buffer::HostBuffer::UInt16($data) => $body,
            $crate::buffer::HostBuffer::UInt8($data) => $body,
        }
    };
}

macro_rules! impl_host_element {
    ($ty:ty, $variant:ident, $to_f32:expr, $from_f32:expr) => {
        impl HostElement for $ty {
            const DTYPE: DType = DType::$variant;

            fn wrap(data: Vec<Self>) -> HostBuffer {
                HostBuffer::$variant(Arc::new(data))
            }

            fn view(buffer: &HostBuffer) -> Option<&[Self]> {
                match buffer {
                    HostBuffer::$variant(v) => Some(v.as_slice()),
                    _ => None,
                }
            }

            #[inline]
            fn from_f32(v: f32) -> Self {
                let f: fn(f32) -> $ty = $from_f32;
                f(v)
            }

            #[inline]
            fn to_f32(self) -> f32 {
                let f: fn($ty) -> f32 = $to_f32;
                f(self)
            }
        }
    };
}

impl_host_element!(bf16, BFloat16, |v| v.to_f32(), bf16::from_f32);
impl_host_element!(f32, Float32, |v| v, |v| v);
impl_host_element!(u32, UInt32, |v| v as f32, |v| v as u32);
impl_host_element!(i32, Int32, |v| v as f32, |v| v as i32);
impl_host_element!(u16, UInt16, |v| v as f32, |v| v as u16);
impl_host_element!(u8, UInt8, |v| v as f32, |v| v as u8);

impl HostBuffer {
    /// Take ownership of a typed vector.
    pub fn new<T: HostElement>(data: Vec<T>) -> Self {
        T::wrap(data)
    }

    /// Zero-filled buffer of `len` elements. Block-float dtypes get a `u32`
    /// buffer of `len` words.
    pub fn zeros(dtype: DType, len: usize) -> Self {
        match dtype.buffer_dtype() {
            DType::BFloat16 => Self::new(vec![bf16::ZERO; len]),
            DType::Float32 => Self::new(vec![0f32; len]),
            DType::Int32 => Self::new(vec![0i32; len]),
            DType::UInt16 => Self::new(vec![0u16; len]),
            DType::UInt8 => Self::new(vec![0u8; len]),
            _ => Self::new(vec![0u32; len]),
        }
    }

    /// Rebuild a buffer from native-endian bytes.
    pub fn from_bytes(dtype: DType, bytes: &[u8]) -> Result<Self> {
        let buffer_dtype = dtype.buffer_dtype();
        let elem = buffer_dtype.element_size().unwrap_or(4);
        if bytes.len() % elem != 0 {
            return Err(TensorError::StorageError(format!(
                "{} bytes is not a whole number of {buffer_dtype} elements",
                bytes.len()
            )));
        }
        Ok(match buffer_dtype {
            DType::BFloat16 => Self::new(bytemuck::pod_collect_to_vec::<u8, bf16>(bytes)),
            DType::Float32 => Self::new(bytemuck::pod_collect_to_vec::<u8, f32>(bytes)),
            DType::Int32 => Self::new(bytemuck::pod_collect_to_vec::<u8, i32>(bytes)),
            DType::UInt16 => Self::new(bytemuck::pod_collect_to_vec::<u8, u16>(bytes)),
            DType::UInt8 => Self::new(bytes.to_vec()),
            _ => Self::new(bytemuck::pod_collect_to_vec::<u8, u32>(bytes)),
        })
    }

    /// Element type stored in this buffer.
    pub fn dtype(&self) -> DType {
        match self {
            HostBuffer::BFloat16(_) => DType::BFloat16,
            HostBuffer::Float32(_) => DType::Float32,
            HostBuffer::UInt32(_) => DType::UInt32,
            HostBuffer::Int32(_) => DType::Int32,
            HostBuffer::UInt16(_) => DType::UInt16,
            HostBuffer::UInt8(_) => DType::UInt8,
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        map_host_buffer!(self, data => data.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw bytes of the elements.
    pub fn as_bytes(&self) -> &[u8] {
        map_host_buffer!(self, data => bytemuck::cast_slice(data.as_slice()))
    }

    /// Borrow the elements as `T`, failing if the buffer holds another type.
    pub fn as_slice<T: HostElement>(&self) -> Result<&[T]> {
        T::view(self).ok_or_else(|| {
            TensorError::TypeError(format!(
                "buffer holds {}, requested {}",
                self.dtype(),
                T::DTYPE
            ))
        })
    }

    /// Copy of the elements as `T`.
    pub fn to_vec<T: HostElement>(&self) -> Result<Vec<T>> {
        self.as_slice::<T>().map(<[T]>::to_vec)
    }

    /// All elements converted to `f32`.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        map_host_buffer!(self, data => data.iter().map(|v| v.to_f32()).collect())
    }

    /// New allocation holding a copy of the elements.
    pub fn deep_copy(&self) -> Self {
        map_host_buffer!(self, data => HostBuffer::new(data.as_slice().to_vec()))
    }

    /// Whether both handles point at the same allocation.
    pub fn ptr_eq(&self, other: &HostBuffer) -> bool {
        self.as_bytes().as_ptr() == other.as_bytes().as_ptr() && self.len() == other.len()
    }
}

impl fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostBuffer({}, len={})", self.dtype(), self.len())
    }
}

impl<T: HostElement> From<Vec<T>> for HostBuffer {
    fn from(data: Vec<T>) -> Self {
        HostBuffer::new(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_access() {
        let buf = HostBuffer::new(vec![1.0f32, 2.0, 3.0]);
        assert_eq!(buf.dtype(), DType::Float32);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf.as_slice::<f32>().unwrap(), &[1.0, 2.0, 3.0]);
        assert!(buf.as_slice::<u32>().is_err());
    }

    #[test]
    fn test_zeros_for_block_float_is_words() {
        let buf = HostBuffer::zeros(DType::BFloat8B, 272);
        assert_eq!(buf.dtype(), DType::UInt32);
        assert_eq!(buf.len(), 272);
    }

    #[test]
    fn test_bytes_round_trip() {
        let buf = HostBuffer::new(vec![bf16::from_f32(1.5), bf16::from_f32(-2.0)]);
        let back = HostBuffer::from_bytes(DType::BFloat16, buf.as_bytes()).unwrap();
        assert_eq!(back.to_f32_vec(), vec![1.5, -2.0]);
        assert!(HostBuffer::from_bytes(DType::Float32, &[0u8; 6]).is_err());
    }

    #[test]
    fn test_clone_shares_deep_copy_does_not() {
        let buf = HostBuffer::new(vec![7u16; 8]);
        let shared = buf.clone();
        let copied = buf.deep_copy();
        assert!(buf.ptr_eq(&shared));
        assert!(!buf.ptr_eq(&copied));
        assert_eq!(copied.as_slice::<u16>().unwrap(), buf.as_slice::<u16>().unwrap());
    }

    #[test]
    fn test_map_macro() {
        let buf = HostBuffer::new(vec![1i32, -2, 3]);
        let sum: f32 = map_host_buffer!(&buf, data => data.iter().map(|v| v.to_f32()).sum());
        assert_eq!(sum, 2.0);
    }
}
