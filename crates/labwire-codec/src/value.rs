//! The value model exchanged over the wire.

use crate::array::NdArray;
use crate::error::CodecError;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::ToPrimitive;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::hash::{Hash, Hasher};

/// A complex number with `f64` parts.
#[derive(Debug, Clone, Copy)]
pub struct Complex {
    /// Real part
    pub re: f64,
    /// Imaginary part
    pub im: f64,
}

impl Complex {
    /// Create a complex number.
    #[must_use]
    pub fn new(re: f64, im: f64) -> Self {
        Self { re, im }
    }
}

impl PartialEq for Complex {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Complex {}

impl PartialOrd for Complex {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Complex {
    fn cmp(&self, other: &Self) -> Ordering {
        self.re
            .total_cmp(&other.re)
            .then_with(|| self.im.total_cmp(&other.im))
    }
}

impl Hash for Complex {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.re.to_bits().hash(state);
        self.im.to_bits().hash(state);
    }
}

/// A slice descriptor.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Slice {
    /// First index, usually `None` or an integer
    pub start: Value,
    /// End index (exclusive)
    pub stop: Value,
    /// Stride
    pub step: Value,
}

/// A structured value.
///
/// Equality, ordering and hashing are structural and total: floats compare
/// by their IEEE total order, so a NaN equals a NaN with the same bits.
/// Integers that fit in `i64` are always stored as [`Value::Int`]; use
/// [`Value::integer`] to build one from a [`BigInt`].
#[derive(Debug, Clone, Default)]
pub enum Value {
    /// Absence of a value
    #[default]
    None,
    /// Boolean
    Bool(bool),
    /// Integer in `i64` range
    Int(i64),
    /// Integer outside `i64` range
    BigInt(BigInt),
    /// Double precision float, including infinities and NaN
    Float(f64),
    /// Complex number
    Complex(Complex),
    /// Exact rational
    Fraction(BigRational),
    /// Unicode string
    Str(String),
    /// Byte sequence
    Bytes(Vec<u8>),
    /// Mutable sequence
    List(Vec<Value>),
    /// Immutable sequence
    Tuple(Vec<Value>),
    /// Set
    Set(BTreeSet<Value>),
    /// Mapping with arbitrary keys
    Dict(BTreeMap<Value, Value>),
    /// Mapping that keeps insertion order
    OrderedDict(Vec<(Value, Value)>),
    /// Multi-dimensional numeric array
    Array(NdArray),
    /// Slice descriptor
    Slice(Box<Slice>),
}

impl Value {
    /// Build a normalized integer value.
    #[must_use]
    pub fn integer(n: BigInt) -> Self {
        n.to_i64().map_or(Self::BigInt(n), Self::Int)
    }

    /// Build a byte-sequence value.
    #[must_use]
    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(b.into())
    }

    /// Build a string-keyed mapping.
    pub fn map<K: Into<String>, V: Into<Value>>(entries: impl IntoIterator<Item = (K, V)>) -> Self {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Self::Str(k.into()), v.into()))
                .collect(),
        )
    }

    /// Build a slice descriptor.
    #[must_use]
    pub fn slice(start: Value, stop: Value, step: Value) -> Self {
        Self::Slice(Box::new(Slice { start, stop, step }))
    }

    /// Short name of the variant, used in error messages.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bool(_) => "bool",
            Self::Int(_) | Self::BigInt(_) => "int",
            Self::Float(_) => "float",
            Self::Complex(_) => "complex",
            Self::Fraction(_) => "fraction",
            Self::Str(_) => "str",
            Self::Bytes(_) => "bytes",
            Self::List(_) => "list",
            Self::Tuple(_) => "tuple",
            Self::Set(_) => "set",
            Self::Dict(_) => "dict",
            Self::OrderedDict(_) => "ordered_dict",
            Self::Array(_) => "array",
            Self::Slice(_) => "slice",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Bool(_) => 1,
            Self::Int(_) | Self::BigInt(_) => 2,
            Self::Float(_) => 3,
            Self::Complex(_) => 4,
            Self::Fraction(_) => 5,
            Self::Str(_) => 6,
            Self::Bytes(_) => 7,
            Self::List(_) => 8,
            Self::Tuple(_) => 9,
            Self::Set(_) => 10,
            Self::Dict(_) => 11,
            Self::OrderedDict(_) => 12,
            Self::Array(_) => 13,
            Self::Slice(_) => 14,
        }
    }

    /// Whether this is [`Value::None`].
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Boolean content.
    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer content, if it fits `i64`.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            Self::BigInt(n) => n.to_i64(),
            _ => None,
        }
    }

    /// Float content; integers are widened.
    #[must_use]
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Float(f) => Some(*f),
            Self::Int(n) => n.to_f64(),
            Self::BigInt(n) => n.to_f64(),
            _ => None,
        }
    }

    /// String content.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Items of a list or tuple.
    #[must_use]
    pub fn as_seq(&self) -> Option<&[Value]> {
        match self {
            Self::List(items) | Self::Tuple(items) => Some(items),
            _ => None,
        }
    }

    /// Entries of an unordered mapping.
    #[must_use]
    pub fn as_dict(&self) -> Option<&BTreeMap<Value, Value>> {
        match self {
            Self::Dict(map) => Some(map),
            _ => None,
        }
    }

    /// Look up `key` in a mapping.
    #[must_use]
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self {
            Self::Dict(map) => map.get(key),
            Self::OrderedDict(entries) => entries.iter().find(|(k, _)| k == key).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Look up a string key in a mapping.
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.get(&Self::Str(key.to_string()))
    }

    /// Convert into a Rust type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedType`] if the value has another kind.
    pub fn extract<T: FromValue>(&self) -> Result<T, CodecError> {
        T::from_value(self)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Self::None, Self::None) => Ordering::Equal,
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::Int(a), Self::BigInt(b)) => BigInt::from(*a).cmp(b),
            (Self::BigInt(a), Self::Int(b)) => a.cmp(&BigInt::from(*b)),
            (Self::BigInt(a), Self::BigInt(b)) => a.cmp(b),
            (Self::Float(a), Self::Float(b)) => a.total_cmp(b),
            (Self::Complex(a), Self::Complex(b)) => a.cmp(b),
            (Self::Fraction(a), Self::Fraction(b)) => a.cmp(b),
            (Self::Str(a), Self::Str(b)) => a.cmp(b),
            (Self::Bytes(a), Self::Bytes(b)) => a.cmp(b),
            (Self::List(a), Self::List(b)) | (Self::Tuple(a), Self::Tuple(b)) => a.cmp(b),
            (Self::Set(a), Self::Set(b)) => a.cmp(b),
            (Self::Dict(a), Self::Dict(b)) => a.cmp(b),
            (Self::OrderedDict(a), Self::OrderedDict(b)) => a.cmp(b),
            (Self::Array(a), Self::Array(b)) => a.cmp(b),
            (Self::Slice(a), Self::Slice(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::None => {}
            Self::Bool(b) => b.hash(state),
            Self::Int(n) => n.hash(state),
            Self::BigInt(n) => match n.to_i64() {
                Some(small) => small.hash(state),
                None => n.hash(state),
            },
            Self::Float(f) => f.to_bits().hash(state),
            Self::Complex(c) => c.hash(state),
            Self::Fraction(r) => r.hash(state),
            Self::Str(s) => s.hash(state),
            Self::Bytes(b) => b.hash(state),
            Self::List(items) | Self::Tuple(items) => items.hash(state),
            Self::Set(items) => items.hash(state),
            Self::Dict(map) => map.hash(state),
            Self::OrderedDict(entries) => entries.hash(state),
            Self::Array(a) => a.hash(state),
            Self::Slice(s) => s.hash(state),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(
            impl From<$t> for Value {
                fn from(n: $t) -> Self {
                    Self::Int(i64::from(n))
                }
            }
        )*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Self::integer(BigInt::from(n))
    }
}

impl From<usize> for Value {
    fn from(n: usize) -> Self {
        Self::integer(BigInt::from(n))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<f32> for Value {
    fn from(f: f32) -> Self {
        Self::Float(f64::from(f))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<BigInt> for Value {
    fn from(n: BigInt) -> Self {
        Self::integer(n)
    }
}

impl From<BigRational> for Value {
    fn from(r: BigRational) -> Self {
        Self::Fraction(r)
    }
}

impl From<Complex> for Value {
    fn from(c: Complex) -> Self {
        Self::Complex(c)
    }
}

impl From<NdArray> for Value {
    fn from(a: NdArray) -> Self {
        Self::Array(a)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Self::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::None, Into::into)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Self::None,
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Self::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Self::from(u)
                } else {
                    Self::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Self::Str(s),
            serde_json::Value::Array(items) => {
                Self::List(items.into_iter().map(Self::from).collect())
            }
            serde_json::Value::Object(map) => Self::Dict(
                map.into_iter()
                    .map(|(k, v)| (Self::Str(k), Self::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Conversion from a [`Value`] into a Rust type.
pub trait FromValue: Sized {
    /// Perform the conversion.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::UnsupportedType`] on a kind mismatch.
    fn from_value(value: &Value) -> Result<Self, CodecError>;
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        Ok(value.clone())
    }
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        value
            .as_bool()
            .ok_or_else(|| CodecError::expected("bool", value.type_name()))
    }
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        value
            .as_int()
            .ok_or_else(|| CodecError::expected("int", value.type_name()))
    }
}

macro_rules! impl_from_value_narrow {
    ($($t:ty),*) => {
        $(
            impl FromValue for $t {
                fn from_value(value: &Value) -> Result<Self, CodecError> {
                    let n = i64::from_value(value)?;
                    <$t>::try_from(n).map_err(|_| {
                        CodecError::UnsupportedType(format!(
                            "{n} out of range for {}",
                            stringify!($t)
                        ))
                    })
                }
            }
        )*
    };
}

impl_from_value_narrow!(i32, u32, u64, usize);

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        value
            .as_float()
            .ok_or_else(|| CodecError::expected("float", value.type_name()))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        value
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| CodecError::expected("str", value.type_name()))
    }
}

impl FromValue for BigInt {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Int(n) => Ok(BigInt::from(*n)),
            Value::BigInt(n) => Ok(n.clone()),
            other => Err(CodecError::expected("int", other.type_name())),
        }
    }
}

impl FromValue for BigRational {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Fraction(r) => Ok(r.clone()),
            Value::Int(_) | Value::BigInt(_) => Ok(BigRational::from_integer(BigInt::from_value(value)?)),
            other => Err(CodecError::expected("fraction", other.type_name())),
        }
    }
}

impl FromValue for Complex {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Complex(c) => Ok(*c),
            other => other
                .as_float()
                .map(|re| Complex::new(re, 0.0))
                .ok_or_else(|| CodecError::expected("complex", other.type_name())),
        }
    }
}

impl FromValue for NdArray {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        match value {
            Value::Array(a) => Ok(a.clone()),
            other => Err(CodecError::expected("array", other.type_name())),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        value
            .as_seq()
            .ok_or_else(|| CodecError::expected("list", value.type_name()))?
            .iter()
            .map(T::from_value)
            .collect()
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self, CodecError> {
        if value.is_none() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

/// Compact rendering for people: tuples as `(a,)`, `None`, `True`.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn seq(f: &mut fmt::Formatter<'_>, items: &[Value]) -> fmt::Result {
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{item}")?;
            }
            Ok(())
        }

        fn pairs<'a>(
            f: &mut fmt::Formatter<'_>,
            entries: impl Iterator<Item = (&'a Value, &'a Value)>,
        ) -> fmt::Result {
            for (i, (k, v)) in entries.enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{k}: {v}")?;
            }
            Ok(())
        }

        match self {
            Self::None => f.write_str("None"),
            Self::Bool(true) => f.write_str("True"),
            Self::Bool(false) => f.write_str("False"),
            Self::Int(n) => write!(f, "{n}"),
            Self::BigInt(n) => write!(f, "{n}"),
            Self::Float(x) if x.is_nan() => f.write_str("nan"),
            Self::Float(x) if x.is_infinite() => {
                f.write_str(if *x > 0.0 { "inf" } else { "-inf" })
            }
            Self::Float(x) => write!(f, "{x:?}"),
            Self::Complex(c) => write!(f, "({:?}{:+?}j)", c.re, c.im),
            Self::Fraction(r) => write!(f, "Fraction({}, {})", r.numer(), r.denom()),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => write!(f, "b{:?}", String::from_utf8_lossy(b)),
            Self::List(items) => {
                f.write_str("[")?;
                seq(f, items)?;
                f.write_str("]")
            }
            Self::Tuple(items) => {
                f.write_str("(")?;
                seq(f, items)?;
                if items.len() == 1 {
                    f.write_str(",")?;
                }
                f.write_str(")")
            }
            Self::Set(items) if items.is_empty() => f.write_str("set()"),
            Self::Set(items) => {
                f.write_str("{")?;
                seq(f, &items.iter().cloned().collect::<Vec<_>>())?;
                f.write_str("}")
            }
            Self::Dict(map) => {
                f.write_str("{")?;
                pairs(f, map.iter())?;
                f.write_str("}")
            }
            Self::OrderedDict(entries) => {
                f.write_str("OrderedDict({")?;
                pairs(f, entries.iter().map(|(k, v)| (k, v)))?;
                f.write_str("})")
            }
            Self::Array(a) => {
                write!(f, "array(shape={:?}, dtype={}, [", a.shape(), a.dtype().type_str())?;
                seq(f, &a.elements())?;
                f.write_str("])")
            }
            Self::Slice(s) => write!(f, "slice({}, {}, {})", s.start, s.stop, s.step),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn nan_equals_itself_structurally() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));
    }

    #[test]
    fn integers_normalize() {
        assert_eq!(Value::integer(BigInt::from(5)), Value::Int(5));
        assert!(matches!(Value::from(u64::MAX), Value::BigInt(_)));
        // A non-normalized big integer still compares and hashes like the small one.
        let mut set = HashSet::new();
        set.insert(Value::Int(7));
        assert!(set.contains(&Value::BigInt(BigInt::from(7))));
    }

    #[test]
    fn mixed_keys_in_dict() {
        let mut map = BTreeMap::new();
        map.insert(Value::from("a"), Value::from(5));
        map.insert(Value::from(2), Value::from("two"));
        map.insert(Value::Float(1.5), Value::Float(1.5));
        let dict = Value::Dict(map);
        assert_eq!(dict.get(&Value::from(2)), Some(&Value::from("two")));
        assert_eq!(dict.get_str("a"), Some(&Value::Int(5)));
    }

    #[test]
    fn typed_extraction() {
        let v = Value::from(vec![1, 2, 3]);
        assert_eq!(v.extract::<Vec<i64>>().unwrap(), vec![1, 2, 3]);
        assert!(matches!(
            Value::from("x").extract::<i64>(),
            Err(CodecError::UnsupportedType(_))
        ));
        assert_eq!(Value::None.extract::<Option<String>>().unwrap(), None);
        assert_eq!(Value::Int(3).extract::<f64>().unwrap(), 3.0);
    }

    #[test]
    fn display_for_people() {
        let v = Value::Tuple(vec![Value::from(10)]);
        assert_eq!(v.to_string(), "(10,)");
        let v = Value::from(vec![Value::None, Value::Bool(true), Value::Float(2.5)]);
        assert_eq!(v.to_string(), "[None, True, 2.5]");
    }

    #[test]
    fn from_json() {
        let v = Value::from(serde_json::json!({"a": [1, 2.5, null]}));
        assert_eq!(
            v,
            Value::map([("a", Value::from(vec![Value::Int(1), Value::Float(2.5), Value::None]))])
        );
    }
}
