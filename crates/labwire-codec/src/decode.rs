//! Recursive-descent decoder.
//!
//! The accepted grammar is exactly what [`crate::encode`] produces plus
//! insignificant whitespace. Constructor objects are resolved against a
//! fixed table of names; nothing else is ever evaluated.

use crate::array::{Dtype, NdArray};
use crate::encode::CLASS_KEY;
use crate::error::CodecError;
use crate::value::{Complex, Slice, Value};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use num_bigint::BigInt;
use num_rational::BigRational;
use num_traits::Zero;
use std::collections::{BTreeMap, BTreeSet};

/// Maximum nesting of containers.
pub const MAX_DEPTH: usize = 512;

/// Decode one value from `text`.
///
/// Leading and trailing whitespace (including a line terminator) is ignored.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] on syntax errors and
/// [`CodecError::UnsupportedType`] on unknown constructors or dtypes.
pub fn decode(text: &str) -> Result<Value, CodecError> {
    let mut parser = Parser {
        src: text.as_bytes(),
        pos: 0,
        depth: 0,
    };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos != parser.src.len() {
        return Err(parser.error("trailing characters"));
    }
    Ok(value)
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    depth: usize,
}

impl Parser<'_> {
    fn error(&self, reason: impl Into<String>) -> CodecError {
        CodecError::malformed(self.pos, reason)
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\n' | b'\r')) {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), CodecError> {
        self.skip_ws();
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(format!("expected `{}`", byte as char)))
        }
    }

    fn keyword(&mut self, word: &str) -> Result<(), CodecError> {
        if self.src[self.pos..].starts_with(word.as_bytes()) {
            self.pos += word.len();
            Ok(())
        } else {
            Err(self.error("invalid literal"))
        }
    }

    fn enter(&mut self) -> Result<(), CodecError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        Ok(())
    }

    fn value(&mut self) -> Result<Value, CodecError> {
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some(b'n') => self.keyword("null").map(|()| Value::None),
            Some(b't') => self.keyword("true").map(|()| Value::Bool(true)),
            Some(b'f') => self.keyword("false").map(|()| Value::Bool(false)),
            Some(b'N') => self.keyword("NaN").map(|()| Value::Float(f64::NAN)),
            Some(b'I') => self
                .keyword("Infinity")
                .map(|()| Value::Float(f64::INFINITY)),
            Some(b'-') if self.src[self.pos + 1..].starts_with(b"Infinity") => {
                self.pos += "-Infinity".len();
                Ok(Value::Float(f64::NEG_INFINITY))
            }
            Some(b'-' | b'0'..=b'9') => self.number(),
            Some(b'"') => self.string().map(Value::Str),
            Some(b'[') => self.array().map(Value::List),
            Some(b'{') => self.object(),
            Some(c) => Err(self.error(format!("unexpected character `{}`", c as char))),
        }
    }

    fn number(&mut self) -> Result<Value, CodecError> {
        let start = self.pos;
        if self.peek() == Some(b'-') {
            self.pos += 1;
        }
        let digits = self.digits();
        if digits == 0 {
            return Err(self.error("expected digits"));
        }
        if digits > 1 && self.src[self.pos - digits] == b'0' {
            return Err(CodecError::malformed(start, "leading zero"));
        }
        let mut is_float = false;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            is_float = true;
            if self.digits() == 0 {
                return Err(self.error("expected fraction digits"));
            }
        }
        if matches!(self.peek(), Some(b'e' | b'E')) {
            self.pos += 1;
            is_float = true;
            if matches!(self.peek(), Some(b'+' | b'-')) {
                self.pos += 1;
            }
            if self.digits() == 0 {
                return Err(self.error("expected exponent digits"));
            }
        }
        // Only ASCII digits and signs were consumed.
        let token = std::str::from_utf8(&self.src[start..self.pos])
            .map_err(|_| CodecError::malformed(start, "invalid number"))?;
        if is_float {
            token
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| CodecError::malformed(start, e.to_string()))
        } else if let Ok(n) = token.parse::<i64>() {
            Ok(Value::Int(n))
        } else {
            token
                .parse::<BigInt>()
                .map(Value::integer)
                .map_err(|e| CodecError::malformed(start, e.to_string()))
        }
    }

    fn digits(&mut self) -> usize {
        let start = self.pos;
        while matches!(self.peek(), Some(b'0'..=b'9')) {
            self.pos += 1;
        }
        self.pos - start
    }

    fn string(&mut self) -> Result<String, CodecError> {
        self.expect(b'"')?;
        let mut out = String::new();
        loop {
            let run_start = self.pos;
            while let Some(c) = self.peek() {
                if c == b'"' || c == b'\\' || c < 0x20 {
                    break;
                }
                self.pos += 1;
            }
            // The input is a &str and runs stop only at ASCII bytes, so this is valid UTF-8.
            out.push_str(
                std::str::from_utf8(&self.src[run_start..self.pos])
                    .map_err(|_| self.error("invalid UTF-8"))?,
            );
            match self.peek() {
                None => return Err(self.error("unterminated string")),
                Some(b'"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(b'\\') => {
                    self.pos += 1;
                    self.escape(&mut out)?;
                }
                Some(_) => return Err(self.error("control character in string")),
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), CodecError> {
        let c = self.peek().ok_or_else(|| self.error("unterminated escape"))?;
        self.pos += 1;
        match c {
            b'"' => out.push('"'),
            b'\\' => out.push('\\'),
            b'/' => out.push('/'),
            b'b' => out.push('\u{8}'),
            b'f' => out.push('\u{c}'),
            b'n' => out.push('\n'),
            b'r' => out.push('\r'),
            b't' => out.push('\t'),
            b'u' => {
                let first = self.hex4()?;
                let code = if (0xD800..0xDC00).contains(&first) {
                    if !self.src[self.pos..].starts_with(b"\\u") {
                        return Err(self.error("unpaired surrogate"));
                    }
                    self.pos += 2;
                    let second = self.hex4()?;
                    if !(0xDC00..0xE000).contains(&second) {
                        return Err(self.error("invalid low surrogate"));
                    }
                    0x10000 + ((first - 0xD800) << 10) + (second - 0xDC00)
                } else {
                    first
                };
                out.push(char::from_u32(code).ok_or_else(|| self.error("invalid code point"))?);
            }
            _ => return Err(self.error("invalid escape")),
        }
        Ok(())
    }

    fn hex4(&mut self) -> Result<u32, CodecError> {
        let hex = self
            .src
            .get(self.pos..self.pos + 4)
            .and_then(|h| std::str::from_utf8(h).ok())
            .and_then(|h| u32::from_str_radix(h, 16).ok())
            .ok_or_else(|| self.error("invalid \\u escape"))?;
        self.pos += 4;
        Ok(hex)
    }

    fn array(&mut self) -> Result<Vec<Value>, CodecError> {
        self.expect(b'[')?;
        self.enter()?;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b']') {
            self.pos += 1;
        } else {
            loop {
                items.push(self.value()?);
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b']') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected `,` or `]`")),
                }
            }
        }
        self.depth -= 1;
        Ok(items)
    }

    fn object(&mut self) -> Result<Value, CodecError> {
        let start = self.pos;
        self.expect(b'{')?;
        self.enter()?;
        let mut entries = Vec::new();
        self.skip_ws();
        if self.peek() == Some(b'}') {
            self.pos += 1;
        } else {
            loop {
                self.skip_ws();
                let key = self.string()?;
                self.expect(b':')?;
                let value = self.value()?;
                entries.push((key, value));
                self.skip_ws();
                match self.peek() {
                    Some(b',') => self.pos += 1,
                    Some(b'}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(self.error("expected `,` or `}`")),
                }
            }
        }
        self.depth -= 1;

        if entries.len() == 1 && entries[0].0 == CLASS_KEY {
            let (_, form) = entries.remove(0);
            return construct(form).map_err(|e| match e {
                CodecError::MalformedPayload { reason, .. } => CodecError::malformed(start, reason),
                other => other,
            });
        }
        Ok(Value::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (Value::Str(k), v))
                .collect(),
        ))
    }
}

fn bad(reason: impl Into<String>) -> CodecError {
    CodecError::malformed(0, reason)
}

/// Resolve `["name", [args...]]` against the constructor table.
fn construct(form: Value) -> Result<Value, CodecError> {
    let Value::List(mut form) = form else {
        return Err(bad("constructor form must be a list"));
    };
    if form.len() != 2 {
        return Err(bad("constructor form must be [name, args]"));
    }
    let Value::List(args) = form.pop().unwrap_or_default() else {
        return Err(bad("constructor arguments must be a list"));
    };
    let Value::Str(name) = form.pop().unwrap_or_default() else {
        return Err(bad("constructor name must be a string"));
    };
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(bad(format!("`{name}` takes {n} argument(s), got {}", args.len())))
        }
    };

    match name.as_str() {
        "tuple" => {
            arity(1)?;
            Ok(Value::Tuple(into_list(one(args))?))
        }
        "set" => {
            arity(1)?;
            Ok(Value::Set(into_list(one(args))?.into_iter().collect::<BTreeSet<_>>()))
        }
        "dict" => {
            arity(1)?;
            Ok(Value::Dict(into_pairs(one(args))?.into_iter().collect::<BTreeMap<_, _>>()))
        }
        "ordered_dict" => {
            arity(1)?;
            Ok(Value::OrderedDict(into_pairs(one(args))?))
        }
        "complex" => {
            arity(2)?;
            let re = args[0].as_float().ok_or_else(|| bad("complex parts must be numbers"))?;
            let im = args[1].as_float().ok_or_else(|| bad("complex parts must be numbers"))?;
            Ok(Value::Complex(Complex::new(re, im)))
        }
        "bytes" => {
            arity(1)?;
            Ok(Value::Bytes(base64_arg(&args[0])?))
        }
        "slice" => {
            arity(3)?;
            let mut it = args.into_iter();
            let (start, stop, step) = (
                it.next().unwrap_or_default(),
                it.next().unwrap_or_default(),
                it.next().unwrap_or_default(),
            );
            Ok(Value::Slice(Box::new(Slice { start, stop, step })))
        }
        "fraction" => {
            arity(2)?;
            let numer: BigInt = args[0].extract().map_err(|_| bad("numerator must be an integer"))?;
            let denom: BigInt = args[1].extract().map_err(|_| bad("denominator must be an integer"))?;
            if denom.is_zero() {
                return Err(bad("zero denominator"));
            }
            Ok(Value::Fraction(BigRational::new(numer, denom)))
        }
        "nparray" => {
            arity(3)?;
            let shape = args[0]
                .as_seq()
                .ok_or_else(|| bad("array shape must be a list"))?
                .iter()
                .map(|d| {
                    d.as_int()
                        .and_then(|d| usize::try_from(d).ok())
                        .ok_or_else(|| bad("array dimensions must be non-negative integers"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            let type_str = args[1].as_str().ok_or_else(|| bad("dtype must be a string"))?;
            let (dtype, big_endian) = Dtype::parse(type_str)?;
            let data = base64_arg(&args[2])?;
            NdArray::from_wire(dtype, big_endian, shape, data)
                .map(Value::Array)
                .map_err(|e| bad(e.to_string()))
        }
        "npscalar" => {
            arity(2)?;
            let type_str = args[0].as_str().ok_or_else(|| bad("dtype must be a string"))?;
            let (dtype, big_endian) = Dtype::parse(type_str)?;
            let data = base64_arg(&args[1])?;
            let array = NdArray::from_wire(dtype, big_endian, vec![1], data)
                .map_err(|e| bad(e.to_string()))?;
            Ok(array.get(0).unwrap_or_default())
        }
        other => Err(CodecError::UnsupportedType(format!("constructor `{other}`"))),
    }
}

fn one(args: Vec<Value>) -> Value {
    args.into_iter().next().unwrap_or_default()
}

fn into_list(value: Value) -> Result<Vec<Value>, CodecError> {
    match value {
        Value::List(items) => Ok(items),
        _ => Err(bad("expected a list")),
    }
}

fn into_pairs(value: Value) -> Result<Vec<(Value, Value)>, CodecError> {
    into_list(value)?
        .into_iter()
        .map(|pair| match into_list(pair)?.as_mut_slice() {
            [k, v] => Ok((std::mem::take(k), std::mem::take(v))),
            _ => Err(bad("mapping entries must be [key, value] pairs")),
        })
        .collect()
}

fn base64_arg(value: &Value) -> Result<Vec<u8>, CodecError> {
    let text = value.as_str().ok_or_else(|| bad("expected a base64 string"))?;
    STANDARD.decode(text).map_err(|e| bad(format!("invalid base64: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::encode;

    #[test]
    fn five_decodes_to_integer_five() {
        assert_eq!(decode(&encode(&Value::Int(5))).unwrap(), Value::Int(5));
    }

    #[test]
    fn special_floats_round_trip_by_bits() {
        for x in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 1e300, 5e-324] {
            let Value::Float(back) = decode(&encode(&Value::Float(x))).unwrap() else {
                panic!("not a float");
            };
            assert_eq!(back.to_bits(), x.to_bits());
        }
    }

    #[test]
    fn accepts_exponents_and_special_floats() {
        let v = decode(r#"{"a": [1e+16, -Infinity, NaN], "b": {"__jsonclass__": ["tuple", [[]]]}}"#)
            .unwrap();
        assert_eq!(v.get_str("b"), Some(&Value::Tuple(Vec::new())));
        let a = v.get_str("a").and_then(Value::as_seq).unwrap();
        assert_eq!(a[0], Value::Float(1e16));
    }

    #[test]
    fn big_integers() {
        let v = decode("123456789012345678901234567890").unwrap();
        assert!(matches!(v, Value::BigInt(_)));
        assert_eq!(decode(&encode(&v)).unwrap(), v);
        assert_eq!(decode("-9223372036854775808").unwrap(), Value::Int(i64::MIN));
    }

    #[test]
    fn malformed_inputs() {
        for text in [
            "",
            "[1,",
            "[1 2]",
            "{\"a\" 1}",
            "01",
            "1.",
            "tru",
            "\"abc",
            "\"\\x\"",
            "\"\\ud834\"",
            "1 2",
            "__import__('os')",
            r#"{"__jsonclass__": ["fraction", [1, 0]]}"#,
            r#"{"__jsonclass__": ["complex", [1]]}"#,
            r#"{"__jsonclass__": ["bytes", ["***"]]}"#,
            r#"{"__jsonclass__": ["nparray", [[3], "<f8", "AAAAAAAAAAA="]]}"#,
        ] {
            assert!(
                matches!(decode(text), Err(CodecError::MalformedPayload { .. })),
                "{text:?} should be malformed"
            );
        }
    }

    #[test]
    fn unknown_constructor_is_unsupported() {
        let err = decode(r#"{"__jsonclass__": ["os.system", ["rm -rf /"]]}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnsupportedType(_)));
    }

    #[test]
    fn nesting_limit() {
        let deep = "[".repeat(MAX_DEPTH + 1) + &"]".repeat(MAX_DEPTH + 1);
        assert!(matches!(decode(&deep), Err(CodecError::MalformedPayload { .. })));
        let ok = "[".repeat(MAX_DEPTH) + &"]".repeat(MAX_DEPTH);
        assert!(decode(&ok).is_ok());
    }

    #[test]
    fn class_key_in_plain_mapping_round_trips() {
        let v = Value::map([(CLASS_KEY, 1), ("other", 2)]);
        assert_eq!(decode(&encode(&v)).unwrap(), v);
    }

    #[test]
    fn npscalar_becomes_plain_scalar() {
        let v = decode(r#"{"__jsonclass__": ["npscalar", ["<i8", "KgAAAAAAAAA="]]}"#).unwrap();
        assert_eq!(v, Value::Int(42));
    }
}
