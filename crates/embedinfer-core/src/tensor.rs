use std::fmt;

use bytes::{Bytes, BytesMut};
use smallvec::SmallVec;

use crate::{count_strings, encode_strings, Error, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Unset; resolved from the model configuration at submission time.
    Invalid,
    Bool,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Int8,
    Int16,
    Int32,
    Int64,
    Fp16,
    Fp32,
    Fp64,
    /// Variable-length elements in the length-prefixed string encoding.
    Bytes,
}

impl DataType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Invalid => "INVALID",
            Self::Bool => "BOOL",
            Self::Uint8 => "UINT8",
            Self::Uint16 => "UINT16",
            Self::Uint32 => "UINT32",
            Self::Uint64 => "UINT64",
            Self::Int8 => "INT8",
            Self::Int16 => "INT16",
            Self::Int32 => "INT32",
            Self::Int64 => "INT64",
            Self::Fp16 => "FP16",
            Self::Fp32 => "FP32",
            Self::Fp64 => "FP64",
            Self::Bytes => "BYTES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "INVALID" => Self::Invalid,
            "BOOL" => Self::Bool,
            "UINT8" => Self::Uint8,
            "UINT16" => Self::Uint16,
            "UINT32" => Self::Uint32,
            "UINT64" => Self::Uint64,
            "INT8" => Self::Int8,
            "INT16" => Self::Int16,
            "INT32" => Self::Int32,
            "INT64" => Self::Int64,
            "FP16" => Self::Fp16,
            "FP32" => Self::Fp32,
            "FP64" => Self::Fp64,
            "BYTES" => Self::Bytes,
            _ => return None,
        })
    }

    /// Model configurations spell types as `TYPE_FP32`, `TYPE_STRING`, ...
    pub fn from_config_str(s: &str) -> Option<Self> {
        let bare = s.strip_prefix("TYPE_")?;
        match bare {
            "STRING" => Some(Self::Bytes),
            "INVALID" => None,
            other => Self::parse(other),
        }
    }

    /// Size of one element in bytes; `None` for `Invalid` and `Bytes`.
    pub const fn element_size(self) -> Option<usize> {
        match self {
            Self::Invalid | Self::Bytes => None,
            Self::Bool | Self::Uint8 | Self::Int8 => Some(1),
            Self::Uint16 | Self::Int16 | Self::Fp16 => Some(2),
            Self::Uint32 | Self::Int32 | Self::Fp32 => Some(4),
            Self::Uint64 | Self::Int64 | Self::Fp64 => Some(8),
        }
    }

    pub const fn is_resolved(self) -> bool {
        !matches!(self, Self::Invalid)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum MemoryType {
    #[default]
    Cpu,
    CpuPinned,
    Gpu,
}

impl MemoryType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "CPU",
            Self::CpuPinned => "CPU_PINNED",
            Self::Gpu => "GPU",
        }
    }
}

impl fmt::Display for MemoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Memory kind plus device id (e.g. `GPU` / `0` is the first GPU).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct MemoryLocation {
    pub memory_type: MemoryType,
    pub device_id: i64,
}

impl MemoryLocation {
    pub const fn cpu() -> Self {
        Self {
            memory_type: MemoryType::Cpu,
            device_id: 0,
        }
    }

    pub const fn cpu_pinned() -> Self {
        Self {
            memory_type: MemoryType::CpuPinned,
            device_id: 0,
        }
    }

    pub const fn gpu(device_id: i64) -> Self {
        Self {
            memory_type: MemoryType::Gpu,
            device_id,
        }
    }
}

impl fmt::Display for MemoryLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.memory_type, self.device_id)
    }
}

/// Tensor dimensions. Empty means "take the shape from the model config";
/// negative entries are variable-size dimensions.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct Shape(pub SmallVec<[i64; 6]>);

impl Shape {
    pub fn from_slice(d: &[i64]) -> Self {
        Self(d.iter().copied().collect())
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
    pub fn as_slice(&self) -> &[i64] {
        &self.0
    }
    /// Number of elements, or `None` while any dimension is variable.
    pub fn element_count(&self) -> Option<usize> {
        self.0.iter().try_fold(1usize, |acc, d| {
            usize::try_from(*d).ok().and_then(|d| acc.checked_mul(d))
        })
    }
}

impl From<Vec<i64>> for Shape {
    fn from(v: Vec<i64>) -> Self {
        Self(SmallVec::from_vec(v))
    }
}

impl From<&[i64]> for Shape {
    fn from(v: &[i64]) -> Self {
        Self::from_slice(v)
    }
}

impl<const N: usize> From<[i64; N]> for Shape {
    fn from(v: [i64; N]) -> Self {
        Self::from_slice(&v)
    }
}

/// A named input buffer. The bytes are reference counted, so a caller's
/// buffer is shared with the engine without copying and stays alive for as
/// long as any in-flight request still points at it.
#[derive(Clone, Debug)]
pub struct Tensor {
    pub name: String,
    pub data: Bytes,
    pub data_type: DataType,
    pub shape: Shape,
    pub location: MemoryLocation,
}

impl Tensor {
    /// Type and shape are left unset and resolved from the model config.
    pub fn new(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            data: data.into(),
            data_type: DataType::Invalid,
            shape: Shape::default(),
            location: MemoryLocation::cpu(),
        }
    }

    /// Copies typed elements into a little-endian buffer.
    pub fn from_slice<T: TensorElement>(name: impl Into<String>, values: &[T]) -> Self {
        let mut buf = BytesMut::with_capacity(std::mem::size_of_val(values));
        T::extend_le(values, &mut buf);
        Self::new(name, buf.freeze()).with_data_type(T::DATA_TYPE)
    }

    /// Serializes `items` with the length-prefixed string encoding. The
    /// encoded buffer is owned by the tensor.
    pub fn from_strings<I, S>(name: impl Into<String>, items: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let data = encode_strings(items)?;
        Ok(Self::new(name, data).with_data_type(DataType::Bytes))
    }

    pub fn with_data_type(mut self, data_type: DataType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn with_shape(mut self, shape: impl Into<Shape>) -> Self {
        self.shape = shape.into();
        self
    }

    pub fn with_location(mut self, location: MemoryLocation) -> Self {
        self.location = location;
        self
    }

    pub fn byte_size(&self) -> usize {
        self.data.len()
    }

    pub fn needs_resolution(&self) -> bool {
        !self.data_type.is_resolved() || self.shape.is_empty()
    }

    /// Checks byte length against type and shape. Tensors whose shape still
    /// has variable dimensions pass unchecked.
    pub fn check_consistency(&self) -> Result<()> {
        let Some(count) = self.shape.element_count() else {
            return Ok(());
        };
        match self.data_type {
            DataType::Invalid => Ok(()),
            DataType::Bytes => {
                let actual = count_strings(&self.data)?;
                if actual != count {
                    return Err(Error::invalid_argument(format!(
                        "input '{}' holds {actual} string elements, shape {:?} expects {count}",
                        self.name,
                        self.shape.as_slice()
                    )));
                }
                Ok(())
            }
            dtype => {
                let element = dtype.element_size().unwrap_or(1);
                let expected = count.checked_mul(element).ok_or_else(|| {
                    Error::invalid_argument(format!("input '{}' shape overflows", self.name))
                })?;
                if expected != self.data.len() {
                    return Err(Error::invalid_argument(format!(
                        "input '{}' has {} bytes, {dtype} shape {:?} expects {expected}",
                        self.name,
                        self.data.len(),
                        self.shape.as_slice()
                    )));
                }
                Ok(())
            }
        }
    }
}

/// A requested output. A non-empty `buffer` is a pre-allocated destination
/// the allocator uses instead of allocating fresh memory; its length is the
/// space available.
#[derive(Debug)]
pub struct RequestedOutput {
    pub name: String,
    pub buffer: Option<BytesMut>,
    pub location: MemoryLocation,
}

impl RequestedOutput {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            buffer: None,
            location: MemoryLocation::cpu(),
        }
    }

    pub fn with_buffer(mut self, buffer: BytesMut, location: MemoryLocation) -> Self {
        self.buffer = Some(buffer);
        self.location = location;
        self
    }
}

/// Fixed-size element types that can be packed into a tensor buffer.
pub trait TensorElement: Copy + 'static {
    const DATA_TYPE: DataType;

    fn extend_le(values: &[Self], out: &mut BytesMut);
}

macro_rules! numeric_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl TensorElement for $ty {
                const DATA_TYPE: DataType = DataType::$dtype;

                fn extend_le(values: &[Self], out: &mut BytesMut) {
                    for v in values {
                        out.extend_from_slice(&v.to_le_bytes());
                    }
                }
            }
        )*
    };
}

numeric_element! {
    u8 => Uint8,
    u16 => Uint16,
    u32 => Uint32,
    u64 => Uint64,
    i8 => Int8,
    i16 => Int16,
    i32 => Int32,
    i64 => Int64,
    f32 => Fp32,
    f64 => Fp64,
}

impl TensorElement for bool {
    const DATA_TYPE: DataType = DataType::Bool;

    fn extend_le(values: &[Self], out: &mut BytesMut) {
        out.extend(values.iter().map(|v| u8::from(*v)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_type_names_map_to_data_types() {
        assert_eq!(DataType::from_config_str("TYPE_FP32"), Some(DataType::Fp32));
        assert_eq!(DataType::from_config_str("TYPE_STRING"), Some(DataType::Bytes));
        assert_eq!(DataType::from_config_str("TYPE_INVALID"), None);
        assert_eq!(DataType::from_config_str("FP32"), None);
    }

    #[test]
    fn new_tensor_is_unresolved() {
        let t = Tensor::new("x", vec![0u8; 8]);
        assert_eq!(t.data_type, DataType::Invalid);
        assert!(t.shape.is_empty());
        assert!(t.needs_resolution());
        assert_eq!(t.location, MemoryLocation::cpu());
    }

    #[test]
    fn typed_slice_packs_little_endian() {
        let t = Tensor::from_slice("x", &[1i32, -2]).with_shape([2]);
        assert_eq!(t.data_type, DataType::Int32);
        assert_eq!(&t.data[..], &[1, 0, 0, 0, 0xfe, 0xff, 0xff, 0xff]);
        t.check_consistency().unwrap();

        let b = Tensor::from_slice("mask", &[true, false, true]);
        assert_eq!(&b.data[..], &[1, 0, 1]);
    }

    #[test]
    fn inconsistent_byte_length_is_rejected() {
        let t = Tensor::from_slice("x", &[1.0f32, 2.0, 3.0]).with_shape([1, 4]);
        assert!(matches!(t.check_consistency(), Err(Error::InvalidArgument(_))));

        let variable = Tensor::from_slice("x", &[1.0f32, 2.0, 3.0]).with_shape([1, -1]);
        variable.check_consistency().unwrap();
    }

    #[test]
    fn string_tensor_counts_elements() {
        let t = Tensor::from_strings("s", ["ab", "c"]).unwrap().with_shape([2]);
        t.check_consistency().unwrap();
        let wrong = t.clone().with_shape([3]);
        assert!(wrong.check_consistency().is_err());
    }

    #[test]
    fn shape_element_count() {
        assert_eq!(Shape::from_slice(&[2, 3]).element_count(), Some(6));
        assert_eq!(Shape::from_slice(&[]).element_count(), Some(1));
        assert_eq!(Shape::from_slice(&[2, -1]).element_count(), None);
    }
}
