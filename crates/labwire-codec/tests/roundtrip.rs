//! Property tests for the wire format.
//!
//! Every generated value must decode back to a structurally equal value and
//! its encoding must be a single ASCII line.

use labwire_codec::{decode, encode, CodecError, Complex, NdArray, Value};
use num_bigint::BigInt;
use num_rational::BigRational;
use proptest::prelude::*;

/// Floats with every NaN collapsed to the one the decoder produces.
fn float() -> impl Strategy<Value = f64> {
    any::<f64>().prop_map(|x| if x.is_nan() { f64::NAN } else { x })
}

fn leaf() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::None),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<i128>().prop_map(|n| Value::integer(BigInt::from(n))),
        float().prop_map(Value::Float),
        (float(), float()).prop_map(|(re, im)| Value::Complex(Complex::new(re, im))),
        (any::<i64>(), 1i64..1_000_000)
            .prop_map(|(n, d)| Value::Fraction(BigRational::new(n.into(), d.into()))),
        ".*".prop_map(Value::Str),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(Value::Bytes),
        proptest::collection::vec(any::<f64>(), 0..8)
            .prop_map(|v| Value::Array(NdArray::vector(&v))),
        proptest::collection::vec(any::<i32>(), 0..12).prop_map(|v| {
            let rows = v.len() / 3;
            let v = &v[..rows * 3];
            Value::Array(NdArray::from_elements(vec![rows, 3], v).unwrap())
        }),
    ]
}

fn value() -> impl Strategy<Value = Value> {
    leaf().prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::List),
            proptest::collection::vec(inner.clone(), 0..6).prop_map(Value::Tuple),
            proptest::collection::btree_set(inner.clone(), 0..6).prop_map(Value::Set),
            proptest::collection::btree_map(inner.clone(), inner.clone(), 0..6)
                .prop_map(Value::Dict),
            proptest::collection::btree_map(".*", inner.clone(), 0..6).prop_map(|m| {
                Value::Dict(m.into_iter().map(|(k, v)| (Value::Str(k), v)).collect())
            }),
            proptest::collection::vec((inner.clone(), inner.clone()), 0..6)
                .prop_map(Value::OrderedDict),
            (inner.clone(), inner.clone(), inner).prop_map(|(a, b, c)| Value::slice(a, b, c)),
        ]
    })
}

proptest! {
    #[test]
    fn prop_decode_inverts_encode(v in value()) {
        let text = encode(&v);
        prop_assert!(text.is_ascii());
        prop_assert!(!text.contains('\n'));
        prop_assert_eq!(decode(&text).unwrap(), v);
    }

    #[test]
    fn prop_decoder_never_panics(text in ".{0,64}") {
        let _ = decode(&text);
    }
}

#[test]
fn integer_five_crosses_the_wire_as_integer() {
    let text = encode(&Value::Int(5));
    assert_eq!(text, "5");
    let back = decode(&text).unwrap();
    assert_eq!(back.extract::<i64>().unwrap(), 5);
    assert!(back.extract::<String>().is_err());
}

#[test]
fn big_endian_arrays_are_normalized() {
    // [1.0, 2.0] as big-endian doubles
    let text = r#"{"__jsonclass__": ["nparray", [[2], ">f8", "P/AAAAAAAABAAAAAAAAAAA=="]]}"#;
    let Value::Array(a) = decode(text).unwrap() else {
        panic!("expected an array");
    };
    assert_eq!(a.to_vec::<f64>().unwrap(), vec![1.0, 2.0]);
    assert_eq!(
        encode(&Value::Array(a)),
        r#"{"__jsonclass__":["nparray",[[2],"<f8","AAAAAAAA8D8AAAAAAAAAQA=="]]}"#
    );
}

#[test]
fn unsupported_dtype() {
    let text = r#"{"__jsonclass__": ["nparray", [[1], "<M8", "AAAAAAAAAAA="]]}"#;
    assert!(matches!(decode(text), Err(CodecError::UnsupportedType(_))));
}

#[test]
fn fraction_is_reduced() {
    let v = decode(r#"{"__jsonclass__": ["fraction", [10, -4]]}"#).unwrap();
    let r: BigRational = v.extract().unwrap();
    assert_eq!(r, BigRational::new((-5).into(), 2.into()));
}

#[test]
fn json_interop() {
    let json: serde_json::Value = serde_json::json!({"a": [1, 2.5, null, true], "b": "x"});
    let v = Value::from(json);
    assert_eq!(
        decode(&encode(&v)).unwrap(),
        Value::map([
            (
                "a",
                Value::List(vec![1.into(), 2.5.into(), Value::None, true.into()])
            ),
            ("b", "x".into()),
        ])
    );
}
