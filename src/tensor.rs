use ndarray::ArrayD;
use num_traits::ToBytes;
use std::collections::BTreeMap;

/// A name to parameter mapping, iterated in name order.
pub(crate) type Parameters = BTreeMap<String, Parameter>;

/// A fixed-width numeric type that can be dumped as raw bytes.
pub(crate) trait Element: Copy + ToBytes {
    const DTYPE: Dtype;

    /// Decode a single value from exactly `size_of::<Self>()` little-endian bytes.
    fn from_le_chunk(chunk: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($ty:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $ty {
                const DTYPE: Dtype = Dtype::$dtype;

                fn from_le_chunk(chunk: &[u8]) -> Self {
                    let mut bytes = [0_u8; std::mem::size_of::<$ty>()];
                    bytes.copy_from_slice(chunk);
                    <$ty>::from_le_bytes(bytes)
                }
            }
        )*
    };
}

impl_element!(f32 => F32, f64 => F64, i32 => I32, i64 => I64);

/// Element types a checkpoint may hold.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Dtype {
    F32,
    F64,
    I32,
    I64,
}

impl Dtype {
    pub(crate) fn parse(name: &str) -> Option<Self> {
        match name {
            "F32" => Some(Self::F32),
            "F64" => Some(Self::F64),
            "I32" => Some(Self::I32),
            "I64" => Some(Self::I64),
            _ => None,
        }
    }

    pub(crate) fn size(self) -> usize {
        match self {
            Self::F32 | Self::I32 => 4,
            Self::F64 | Self::I64 => 8,
        }
    }
}

/// One learned parameter (or buffer) of a model.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Parameter {
    F32(ArrayD<f32>),
    F64(ArrayD<f64>),
    I32(ArrayD<i32>),
    I64(ArrayD<i64>),
}

macro_rules! impl_from_array {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<ArrayD<$ty>> for Parameter {
                fn from(array: ArrayD<$ty>) -> Self {
                    Self::$variant(array)
                }
            }
        )*
    };
}

impl_from_array!(f32 => F32, f64 => F64, i32 => I32, i64 => I64);

impl Parameter {
    pub(crate) fn dtype(&self) -> Dtype {
        match self {
            Self::F32(_) => Dtype::F32,
            Self::F64(_) => Dtype::F64,
            Self::I32(_) => Dtype::I32,
            Self::I64(_) => Dtype::I64,
        }
    }

    pub(crate) fn shape(&self) -> &[usize] {
        match self {
            Self::F32(array) => array.shape(),
            Self::F64(array) => array.shape(),
            Self::I32(array) => array.shape(),
            Self::I64(array) => array.shape(),
        }
    }

    /// Number of elements.
    pub(crate) fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Size of the raw dump of this parameter.
    pub(crate) fn byte_len(&self) -> usize {
        self.len() * self.dtype().size()
    }
}
