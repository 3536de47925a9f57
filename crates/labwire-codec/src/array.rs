//! Fixed-shape multi-dimensional numeric arrays.
//!
//! Arrays travel as `[shape, dtype, base64(data)]` where `dtype` is a numpy
//! type string such as `<f8` and `data` is the C-order element buffer.
//! In memory the buffer is always little-endian.

use crate::error::CodecError;
use crate::value::{Complex, Value};
use num_bigint::BigInt;

/// Element type of an [`NdArray`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dtype {
    /// `|b1`
    Bool,
    /// `|i1`
    I8,
    /// `<i2`
    I16,
    /// `<i4`
    I32,
    /// `<i8`
    I64,
    /// `|u1`
    U8,
    /// `<u2`
    U16,
    /// `<u4`
    U32,
    /// `<u8`
    U64,
    /// `<f4`
    F32,
    /// `<f8`
    F64,
    /// `<c8`, two `f32`
    C64,
    /// `<c16`, two `f64`
    C128,
}

impl Dtype {
    /// Size of one element in bytes.
    #[must_use]
    pub fn itemsize(self) -> usize {
        match self {
            Self::Bool | Self::I8 | Self::U8 => 1,
            Self::I16 | Self::U16 => 2,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::U64 | Self::F64 | Self::C64 => 8,
            Self::C128 => 16,
        }
    }

    /// Little-endian numpy type string.
    #[must_use]
    pub fn type_str(self) -> &'static str {
        match self {
            Self::Bool => "|b1",
            Self::I8 => "|i1",
            Self::I16 => "<i2",
            Self::I32 => "<i4",
            Self::I64 => "<i8",
            Self::U8 => "|u1",
            Self::U16 => "<u2",
            Self::U32 => "<u4",
            Self::U64 => "<u8",
            Self::F32 => "<f4",
            Self::F64 => "<f8",
            Self::C64 => "<c8",
            Self::C128 => "<c16",
        }
    }

    /// Parse a numpy type string.
    ///
    /// Returns the element type and whether the source buffer is big-endian.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedType`] for types outside the supported set.
    pub fn parse(type_str: &str) -> Result<(Self, bool), CodecError> {
        let unsupported = || CodecError::UnsupportedType(format!("dtype `{type_str}`"));
        let mut chars = type_str.chars();
        let order = chars.next().ok_or_else(unsupported)?;
        let big_endian = match order {
            '<' | '|' => false,
            '>' => true,
            '=' => cfg!(target_endian = "big"),
            _ => return Err(unsupported()),
        };
        let dtype = match chars.as_str() {
            "b1" | "?" => Self::Bool,
            "i1" => Self::I8,
            "i2" => Self::I16,
            "i4" => Self::I32,
            "i8" => Self::I64,
            "u1" => Self::U8,
            "u2" => Self::U16,
            "u4" => Self::U32,
            "u8" => Self::U64,
            "f4" => Self::F32,
            "f8" => Self::F64,
            "c8" => Self::C64,
            "c16" => Self::C128,
            _ => return Err(unsupported()),
        };
        Ok((dtype, big_endian))
    }

    /// Width of the scalar parts whose bytes get swapped on byte-order conversion.
    fn part_size(self) -> usize {
        match self {
            Self::C64 => 4,
            Self::C128 => 8,
            other => other.itemsize(),
        }
    }

    /// Decode one little-endian element into a scalar value.
    pub(crate) fn scalar(self, b: &[u8]) -> Value {
        match self {
            Self::Bool => Value::Bool(b[0] != 0),
            Self::I8 => Value::Int(i64::from(i8::from_le_bytes([b[0]]))),
            Self::I16 => Value::Int(i64::from(i16::from_le_bytes([b[0], b[1]]))),
            Self::I32 => Value::Int(i64::from(i32::from_le_bytes(le4(b)))),
            Self::I64 => Value::Int(i64::from_le_bytes(le8(b))),
            Self::U8 => Value::Int(i64::from(b[0])),
            Self::U16 => Value::Int(i64::from(u16::from_le_bytes([b[0], b[1]]))),
            Self::U32 => Value::Int(i64::from(u32::from_le_bytes(le4(b)))),
            Self::U64 => Value::integer(BigInt::from(u64::from_le_bytes(le8(b)))),
            Self::F32 => Value::Float(f64::from(f32::from_le_bytes(le4(b)))),
            Self::F64 => Value::Float(f64::from_le_bytes(le8(b))),
            Self::C64 => Value::Complex(Complex::new(
                f64::from(f32::from_le_bytes(le4(b))),
                f64::from(f32::from_le_bytes(le4(&b[4..]))),
            )),
            Self::C128 => Value::Complex(Complex::new(
                f64::from_le_bytes(le8(b)),
                f64::from_le_bytes(le8(&b[8..])),
            )),
        }
    }
}

fn le4(b: &[u8]) -> [u8; 4] {
    [b[0], b[1], b[2], b[3]]
}

fn le8(b: &[u8]) -> [u8; 8] {
    [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// A Rust scalar type that can be stored in an [`NdArray`].
pub trait Element: Copy {
    /// The array element type for `Self`.
    const DTYPE: Dtype;

    /// Append the little-endian representation.
    fn put(self, out: &mut Vec<u8>);

    /// Read from exactly `DTYPE.itemsize()` little-endian bytes.
    fn take(bytes: &[u8]) -> Self;
}

macro_rules! impl_element {
    ($($t:ty => $dtype:ident),* $(,)?) => {
        $(
            impl Element for $t {
                const DTYPE: Dtype = Dtype::$dtype;

                fn put(self, out: &mut Vec<u8>) {
                    out.extend_from_slice(&self.to_le_bytes());
                }

                fn take(bytes: &[u8]) -> Self {
                    let mut buf = [0u8; std::mem::size_of::<$t>()];
                    buf.copy_from_slice(bytes);
                    <$t>::from_le_bytes(buf)
                }
            }
        )*
    };
}

impl_element! {
    i8 => I8, i16 => I16, i32 => I32, i64 => I64,
    u8 => U8, u16 => U16, u32 => U32, u64 => U64,
    f32 => F32, f64 => F64,
}

impl Element for bool {
    const DTYPE: Dtype = Dtype::Bool;

    fn put(self, out: &mut Vec<u8>) {
        out.push(u8::from(self));
    }

    fn take(bytes: &[u8]) -> Self {
        bytes[0] != 0
    }
}

impl Element for Complex {
    const DTYPE: Dtype = Dtype::C128;

    fn put(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.re.to_le_bytes());
        out.extend_from_slice(&self.im.to_le_bytes());
    }

    fn take(bytes: &[u8]) -> Self {
        Self::new(
            f64::from_le_bytes(le8(bytes)),
            f64::from_le_bytes(le8(&bytes[8..])),
        )
    }
}

/// A C-order array with a fixed shape and a homogeneous element type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NdArray {
    dtype: Dtype,
    shape: Vec<usize>,
    data: Vec<u8>,
}

impl NdArray {
    /// Build an array from a little-endian element buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedType`] if the buffer length does not
    /// match the shape.
    pub fn from_raw(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, CodecError> {
        let expected = element_count(&shape)
            .and_then(|n| n.checked_mul(dtype.itemsize()))
            .ok_or_else(|| CodecError::UnsupportedType(format!("array shape {shape:?} too large")))?;
        if expected != data.len() {
            return Err(CodecError::UnsupportedType(format!(
                "array of shape {shape:?} and dtype {} needs {expected} bytes, got {}",
                dtype.type_str(),
                data.len()
            )));
        }
        Ok(Self { dtype, shape, data })
    }

    /// Build an array from a buffer in the byte order given by `big_endian`.
    pub(crate) fn from_wire(
        dtype: Dtype,
        big_endian: bool,
        shape: Vec<usize>,
        mut data: Vec<u8>,
    ) -> Result<Self, CodecError> {
        if big_endian {
            for part in data.chunks_mut(dtype.part_size()) {
                part.reverse();
            }
        }
        Self::from_raw(dtype, shape, data)
    }

    /// Build an array from typed elements.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedType`] if `elements` does not fill `shape`.
    pub fn from_elements<T: Element>(shape: Vec<usize>, elements: &[T]) -> Result<Self, CodecError> {
        let mut data = Vec::with_capacity(elements.len() * T::DTYPE.itemsize());
        for &e in elements {
            e.put(&mut data);
        }
        Self::from_raw(T::DTYPE, shape, data)
    }

    /// A one-dimensional array.
    #[must_use]
    pub fn vector<T: Element>(elements: &[T]) -> Self {
        let mut data = Vec::with_capacity(elements.len() * T::DTYPE.itemsize());
        for &e in elements {
            e.put(&mut data);
        }
        Self {
            dtype: T::DTYPE,
            shape: vec![elements.len()],
            data,
        }
    }

    /// An array of zeros.
    #[must_use]
    pub fn zeros(dtype: Dtype, shape: Vec<usize>) -> Self {
        let len = element_count(&shape).unwrap_or(0) * dtype.itemsize();
        Self {
            dtype,
            shape,
            data: vec![0; len],
        }
    }

    /// Element type.
    #[must_use]
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// Dimensions, outermost first.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Little-endian element buffer.
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Number of elements.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.itemsize()
    }

    /// Whether the array holds no elements.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat element at `index` as a scalar value.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<Value> {
        let size = self.dtype.itemsize();
        let start = index.checked_mul(size)?;
        let bytes = self.data.get(start..start + size)?;
        Some(self.dtype.scalar(bytes))
    }

    /// All elements in C order as scalar values.
    #[must_use]
    pub fn elements(&self) -> Vec<Value> {
        self.data
            .chunks_exact(self.dtype.itemsize())
            .map(|b| self.dtype.scalar(b))
            .collect()
    }

    /// Elements as `T`, if `T` matches the element type.
    #[must_use]
    pub fn to_vec<T: Element>(&self) -> Option<Vec<T>> {
        if T::DTYPE != self.dtype {
            return None;
        }
        Some(
            self.data
                .chunks_exact(self.dtype.itemsize())
                .map(T::take)
                .collect(),
        )
    }

    /// Overwrite the flat element at `index`.
    ///
    /// Returns `false` if the element type differs or the index is out of range.
    pub fn set<T: Element>(&mut self, index: usize, element: T) -> bool {
        let size = self.dtype.itemsize();
        if T::DTYPE != self.dtype || index >= self.len() {
            return false;
        }
        let mut buf = Vec::with_capacity(size);
        element.put(&mut buf);
        self.data[index * size..(index + 1) * size].copy_from_slice(&buf);
        true
    }
}

fn element_count(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtype_strings() {
        for dtype in [Dtype::Bool, Dtype::I16, Dtype::U64, Dtype::F32, Dtype::C128] {
            let (parsed, big) = Dtype::parse(dtype.type_str()).unwrap();
            assert_eq!(parsed, dtype);
            assert!(!big);
        }
        assert_eq!(Dtype::parse(">f8").unwrap(), (Dtype::F64, true));
        assert!(matches!(
            Dtype::parse("<M8[ns]"),
            Err(CodecError::UnsupportedType(_))
        ));
    }

    #[test]
    fn shape_must_match_data() {
        assert!(NdArray::from_elements(vec![2, 2], &[1.0f64, 2.0, 3.0]).is_err());
        let a = NdArray::from_elements(vec![2, 2], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(a.len(), 4);
        assert_eq!(a.get(3), Some(Value::Float(4.0)));
        assert_eq!(a.get(4), None);
    }

    #[test]
    fn scalar_array_has_one_element() {
        let a = NdArray::from_elements(Vec::new(), &[7i32]).unwrap();
        assert_eq!(a.elements(), vec![Value::Int(7)]);
    }

    #[test]
    fn big_endian_input_is_normalized() {
        let be: Vec<u8> = 1.5f64.to_be_bytes().to_vec();
        let a = NdArray::from_wire(Dtype::F64, true, vec![1], be).unwrap();
        assert_eq!(a.to_vec::<f64>(), Some(vec![1.5]));

        let mut be = 2.0f64.to_be_bytes().to_vec();
        be.extend_from_slice(&(-3.0f64).to_be_bytes());
        let c = NdArray::from_wire(Dtype::C128, true, vec![1], be).unwrap();
        assert_eq!(c.get(0), Some(Value::Complex(Complex::new(2.0, -3.0))));
    }

    #[test]
    fn set_element() {
        let mut a = NdArray::zeros(Dtype::F64, vec![1]);
        assert!(a.set(0, 10.0f64));
        assert!(!a.set(0, 10i64));
        assert!(!a.set(1, 1.0f64));
        assert_eq!(a.to_vec::<f64>(), Some(vec![10.0]));
    }
}
