//! Value encoder.
//!
//! Produces one line of ASCII text: JSON plus the `NaN`/`Infinity` literals
//! and `{"__jsonclass__": [name, args]}` constructors.

use crate::decode::MAX_DEPTH;
use crate::error::CodecError;
use crate::value::{Complex, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use num_bigint::BigInt;
use std::fmt::Write;

/// Key that marks a constructor object.
pub const CLASS_KEY: &str = "__jsonclass__";

/// Encode a value as a single line of text.
#[must_use]
pub fn encode(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

/// Encode a value, refusing text the decoder would reject for nesting.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] if the encoded text nests more
/// than [`MAX_DEPTH`] containers.
pub fn encode_checked(value: &Value) -> Result<String, CodecError> {
    let text = encode(value);
    match deepest_offset(&text) {
        Some(offset) => Err(CodecError::malformed(offset, "nesting too deep")),
        None => Ok(text),
    }
}

/// Offset of the first container opening past [`MAX_DEPTH`], if any.
fn deepest_offset(text: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, byte) in text.bytes().enumerate() {
        if in_string {
            match byte {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match byte {
            b'"' => in_string = true,
            b'[' | b'{' => {
                depth += 1;
                if depth > MAX_DEPTH {
                    return Some(offset);
                }
            }
            b']' | b'}' => depth = depth.saturating_sub(1),
            _ => {}
        }
    }
    None
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::None => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Int(n) => {
            let _ = write!(out, "{n}");
        }
        Value::BigInt(n) => write_bigint(out, n),
        Value::Float(x) => write_float(out, *x),
        Value::Complex(Complex { re, im }) => {
            constructor(out, "complex", |out| {
                write_float(out, *re);
                out.push(',');
                write_float(out, *im);
            });
        }
        Value::Fraction(r) => constructor(out, "fraction", |out| {
            write_bigint(out, r.numer());
            out.push(',');
            write_bigint(out, r.denom());
        }),
        Value::Str(s) => write_str(out, s),
        Value::Bytes(b) => constructor(out, "bytes", |out| {
            write_str(out, &STANDARD.encode(b));
        }),
        Value::List(items) => write_seq(out, items.iter()),
        Value::Tuple(items) => constructor(out, "tuple", |out| write_seq(out, items.iter())),
        Value::Set(items) => constructor(out, "set", |out| write_seq(out, items.iter())),
        Value::Dict(map) => {
            let plain = map
                .keys()
                .all(|k| matches!(k, Value::Str(s) if s != CLASS_KEY));
            if plain {
                out.push('{');
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write_value(out, k);
                    out.push(':');
                    write_value(out, v);
                }
                out.push('}');
            } else {
                constructor(out, "dict", |out| write_pairs(out, map.iter()));
            }
        }
        Value::OrderedDict(entries) => constructor(out, "ordered_dict", |out| {
            write_pairs(out, entries.iter().map(|(k, v)| (k, v)));
        }),
        Value::Array(a) => {
            let shape: Vec<Value> = a.shape().iter().map(|&d| Value::from(d)).collect();
            constructor(out, "nparray", |out| {
                write_seq(out, shape.iter());
                out.push(',');
                write_str(out, a.dtype().type_str());
                out.push(',');
                write_str(out, &STANDARD.encode(a.data()));
            });
        }
        Value::Slice(s) => constructor(out, "slice", |out| {
            write_value(out, &s.start);
            out.push(',');
            write_value(out, &s.stop);
            out.push(',');
            write_value(out, &s.step);
        }),
    }
}

/// Writes `{"__jsonclass__":["name",[ARGS]]}` where `args` writes ARGS.
fn constructor(out: &mut String, name: &str, args: impl FnOnce(&mut String)) {
    out.push_str("{\"");
    out.push_str(CLASS_KEY);
    out.push_str("\":[\"");
    out.push_str(name);
    out.push_str("\",[");
    args(out);
    out.push_str("]]}");
}

fn write_seq<'a>(out: &mut String, items: impl Iterator<Item = &'a Value>) {
    out.push('[');
    for (i, item) in items.enumerate() {
        if i > 0 {
            out.push(',');
        }
        write_value(out, item);
    }
    out.push(']');
}

fn write_pairs<'a>(out: &mut String, entries: impl Iterator<Item = (&'a Value, &'a Value)>) {
    out.push('[');
    for (i, (k, v)) in entries.enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push('[');
        write_value(out, k);
        out.push(',');
        write_value(out, v);
        out.push(']');
    }
    out.push(']');
}

fn write_bigint(out: &mut String, n: &BigInt) {
    let _ = write!(out, "{n}");
}

fn write_float(out: &mut String, x: f64) {
    if x.is_nan() {
        out.push_str("NaN");
    } else if x.is_infinite() {
        out.push_str(if x > 0.0 { "Infinity" } else { "-Infinity" });
    } else {
        // Debug keeps a fraction or exponent, so the token never reads back as an integer.
        let _ = write!(out, "{x:?}");
    }
}

fn write_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{8}' => out.push_str("\\b"),
            '\u{c}' => out.push_str("\\f"),
            ' '..='~' => out.push(c),
            _ => {
                let mut units = [0u16; 2];
                for unit in c.encode_utf16(&mut units) {
                    let _ = write!(out, "\\u{unit:04x}");
                }
            }
        }
    }
    out.push('"');
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::NdArray;
    use num_rational::BigRational;
    use std::collections::BTreeMap;

    fn nested(levels: usize) -> Value {
        (0..levels).fold(Value::List(Vec::new()), |inner, _| Value::List(vec![inner]))
    }

    #[test]
    fn checked_encoding_stops_at_the_decoder_limit() {
        // `levels` wrappers around an empty list open `levels + 1` brackets.
        let at_limit = nested(MAX_DEPTH - 1);
        let text = encode_checked(&at_limit).unwrap();
        assert_eq!(crate::decode(&text).unwrap(), at_limit);

        let too_deep = nested(MAX_DEPTH);
        assert!(matches!(
            encode_checked(&too_deep),
            Err(CodecError::MalformedPayload { offset, .. }) if offset == MAX_DEPTH
        ));
        assert!(crate::decode(&encode(&too_deep)).is_err());
    }

    #[test]
    fn brackets_inside_strings_do_not_count() {
        let text = "[".repeat(MAX_DEPTH + 1);
        let v = Value::List(vec![Value::from(text.as_str()), Value::from("\\\"[")]);
        assert!(encode_checked(&v).is_ok());
    }

    #[test]
    fn constructors_count_their_own_brackets() {
        // Each tuple opens four containers on the wire.
        let v = (0..MAX_DEPTH / 4 + 1).fold(Value::None, |inner, _| Value::Tuple(vec![inner]));
        assert!(encode_checked(&v).is_err());
        assert!(crate::decode(&encode(&v)).is_err());
    }

    #[test]
    fn scalars() {
        assert_eq!(encode(&Value::None), "null");
        assert_eq!(encode(&Value::Int(5)), "5");
        assert_eq!(encode(&Value::Float(1.0)), "1.0");
        assert_eq!(encode(&Value::Float(f64::NAN)), "NaN");
        assert_eq!(encode(&Value::Float(f64::NEG_INFINITY)), "-Infinity");
    }

    #[test]
    fn strings_are_ascii_single_line() {
        let text = encode(&Value::from("ab\nx\"'é𝄞"));
        assert_eq!(text, r#""ab\nx\"'\u00e9\ud834\udd1e""#);
        assert!(text.is_ascii());
    }

    #[test]
    fn tuples_and_non_string_keys_use_constructors() {
        let t = Value::Tuple(vec![Value::Int(4), Value::Int(5)]);
        assert_eq!(encode(&t), r#"{"__jsonclass__":["tuple",[[4,5]]]}"#);

        let mut map = BTreeMap::new();
        map.insert(Value::Int(2), Value::None);
        assert_eq!(
            encode(&Value::Dict(map)),
            r#"{"__jsonclass__":["dict",[[[2,null]]]]}"#
        );

        assert_eq!(encode(&Value::map([("a", 5)])), r#"{"a":5}"#);
    }

    #[test]
    fn numeric_constructors() {
        let r = BigRational::new(6.into(), 4.into());
        assert_eq!(
            encode(&Value::Fraction(r)),
            r#"{"__jsonclass__":["fraction",[3,2]]}"#
        );
        assert_eq!(
            encode(&Value::Complex(Complex::new(1.0, -2.0))),
            r#"{"__jsonclass__":["complex",[1.0,-2.0]]}"#
        );
        let a = NdArray::vector(&[1u8, 2]);
        assert_eq!(
            encode(&Value::Array(a)),
            r#"{"__jsonclass__":["nparray",[[2],"|u1","AQI="]]}"#
        );
    }
}
