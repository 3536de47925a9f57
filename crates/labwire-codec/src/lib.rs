//! # labwire codec
//!
//! Self-describing text encoding for structured values.
//!
//! This crate provides:
//! - [`Value`], the dynamic value model (arbitrary-precision integers,
//!   special floats, complex numbers, rationals, containers and arrays)
//! - [`encode`] and [`decode`] for the single-line wire format
//! - [`NdArray`] for fixed-shape numeric arrays
//! - [`store_file`] / [`load_file`] for atomic value files

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod array;
pub mod decode;
pub mod encode;
pub mod error;
pub mod file;
pub mod value;

pub use array::{Dtype, Element, NdArray};
pub use decode::decode;
pub use encode::{encode, encode_checked, CLASS_KEY};
pub use error::CodecError;
pub use file::{load_file, store_file};
pub use value::{Complex, FromValue, Slice, Value};
