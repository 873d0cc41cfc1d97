//! Property-style tests covering the round-trip, ordering, and error
//! guarantees the codec makes.

use test_log::test;

use crate::decoder::{DecodeErrorCode, Decoder};
use crate::encoder::Encoder;
use crate::field::FieldKey;
use crate::listener::RowRecorder;
use crate::types::ValueType;
use crate::value::Value;

fn roundtrip(values: &[Value]) -> Vec<Value> {
    let mut enc = Encoder::new();
    for (i, v) in values.iter().enumerate() {
        enc.put(FieldKey::by_name(format!("field_{i}")), v.value_type(), v);
    }
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    dec.decode(&mut listener).unwrap();
    listener.rows.into_iter().map(|(_, v)| v).collect()
}

#[test]
fn roundtrip_every_primitive_type() {
    let values = vec![
        Value::Int8(i8::MIN),
        Value::Int8(i8::MAX),
        Value::UInt8(u8::MAX),
        Value::Int16(i16::MIN),
        Value::UInt16(u16::MAX),
        Value::Int32(i32::MIN),
        Value::UInt32(u32::MAX),
        Value::Int64(i64::MIN),
        Value::UInt64(u64::MAX),
        Value::Float32(f32::NAN),
        Value::Float32(-0.0),
        Value::Float64(f64::INFINITY),
        Value::String("hello crow".into()),
        Value::Bytes(vec![0, 1, 2, 255]),
    ];
    let decoded = roundtrip(&values);
    assert_eq!(decoded.len(), values.len());
    for (original, got) in values.iter().zip(decoded.iter()) {
        match (original, got) {
            (Value::Float32(a), Value::Float32(b)) => assert_eq!(a.to_bits(), b.to_bits()),
            (Value::Float64(a), Value::Float64(b)) => assert_eq!(a.to_bits(), b.to_bits()),
            (a, b) => assert_eq!(a, b),
        }
    }
}

#[test]
fn index_assignment_is_monotonic_in_first_touch_order() {
    let mut enc = Encoder::new();
    let names = ["z", "a", "m"];
    for name in names {
        enc.put(FieldKey::by_name(name.into()), ValueType::Int32, &Value::Int32(0));
    }
    // Re-touching an already-registered field must not reassign its index.
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(1));
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    dec.decode(&mut listener).unwrap();
    assert_eq!(listener.rows.len(), 4);
    assert_eq!(listener.rows[0].0, 0); // z
    assert_eq!(listener.rows[1].0, 1); // a
    assert_eq!(listener.rows[2].0, 2); // m
    assert_eq!(listener.rows[3].0, 1); // a again, same index
}

#[test]
fn header_emitted_exactly_once_per_field() {
    use crate::listener::Listener;

    struct HeaderCounter {
        seen: std::collections::HashMap<u8, u32>,
    }
    impl Listener for HeaderCounter {
        fn on_field_header(&mut self, index: u8, _def: &crate::field::FieldDef) {
            *self.seen.entry(index).or_insert(0) += 1;
        }
    }

    let mut enc = Encoder::new();
    for _ in 0..5 {
        enc.put(FieldKey::by_name("x".into()), ValueType::UInt8, &Value::UInt8(1));
    }
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = HeaderCounter {
        seen: std::collections::HashMap::new(),
    };
    dec.decode(&mut listener).unwrap();
    assert_eq!(listener.seen.get(&0), Some(&1));
}

#[test]
fn deferred_header_precedes_first_reference() {
    // Touch field "a" first, then a brand new field "b" interleaved with
    // more uses of "a". The header for "b" must still land in the stream
    // before any row referencing it, even though "a" was registered first.
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(1));
    enc.put(FieldKey::by_name("b".into()), ValueType::Int32, &Value::Int32(2));
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(3));
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    dec.decode(&mut listener).unwrap();
    assert_eq!(
        listener.rows,
        vec![(0, Value::Int32(1)), (1, Value::Int32(2)), (0, Value::Int32(3))]
    );
}

#[test]
fn empty_stream_decodes_cleanly() {
    let mut dec = Decoder::new(&[]);
    let mut listener = RowRecorder::default();
    let rows = dec.decode(&mut listener).unwrap();
    assert_eq!(rows, 0);
    assert!(listener.rows.is_empty());
    assert!(dec.error().is_none());
    assert_eq!(dec.err_code(), 0);
}

#[test]
fn truncation_at_every_prefix_is_either_clean_or_truncated() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("name".into()), ValueType::String, &Value::String("bob".into()));
    enc.put(FieldKey::by_name("age".into()), ValueType::Int32, &Value::Int32(23));
    let bytes = enc.flush();

    for k in 0..bytes.len() {
        let mut dec = Decoder::new(&bytes[..k]);
        let mut listener = RowRecorder::default();
        let result = dec.decode(&mut listener);
        match result {
            Ok(rows) => {
                assert!(rows <= 2);
                assert_eq!(dec.err_code(), 0);
            }
            Err(code) => {
                assert!(matches!(
                    code,
                    DecodeErrorCode::Truncated | DecodeErrorCode::Malformed
                ));
                assert_ne!(dec.err_code(), 0);
            }
        }
    }
}

#[test]
fn dangling_index_reference_is_rejected() {
    // An index reference to a field that has never had a header is an
    // error, never a silent no-op.
    let bytes = vec![0x80]; // index-ref to field 0, no header seen yet
    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    let err = dec.decode(&mut listener).unwrap_err();
    assert_eq!(err, DecodeErrorCode::Dangling);
}

#[test]
fn header_index_byte_mismatch_is_malformed() {
    // Encode a single field, then corrupt its header's index byte (the
    // byte right after the header tag) so it no longer equals the
    // registry length at the point of definition.
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::UInt8, &Value::UInt8(1));
    let mut bytes = enc.flush();
    assert_eq!(bytes[1], 0); // the index byte of field "a"'s header
    bytes[1] = 5;

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    let err = dec.decode(&mut listener).unwrap_err();
    assert_eq!(err, DecodeErrorCode::Malformed);
}

#[test]
#[should_panic(expected = "does not match declared field type")]
fn put_with_mismatched_value_and_declared_type_panics() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::UInt8(1));
}

#[test]
#[should_panic(expected = "first declared as")]
fn put_changing_an_established_fields_type_panics() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(1));
    enc.put(FieldKey::by_name("a".into()), ValueType::UInt8, &Value::UInt8(2));
}

#[test]
fn decode_row_walks_one_row_at_a_time() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("n".into()), ValueType::UInt8, &Value::UInt8(1));
    enc.start_row();
    enc.put(FieldKey::by_name("n".into()), ValueType::UInt8, &Value::UInt8(2));
    enc.start_row();
    enc.put(FieldKey::by_name("n".into()), ValueType::UInt8, &Value::UInt8(3));
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    let mut iterations = 0;
    while !dec.decode_row(&mut listener) {
        iterations += 1;
        assert!(iterations <= 10, "decode_row never reported done");
    }
    assert_eq!(listener.rows.len(), 3);
}

#[test]
fn set_mode_skip_values_suppresses_field_callbacks() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(7));
    enc.put(FieldKey::by_name("b".into()), ValueType::String, &Value::String("hi".into()));
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    dec.set_mode(true);
    let mut listener = RowRecorder::default();
    dec.decode(&mut listener).unwrap();
    assert!(listener.rows.is_empty());
    assert_eq!(dec.fields().len(), 2);
}

#[test]
fn type_mask_accumulates_a_bit_per_distinct_value_type() {
    let mut enc = Encoder::new();
    enc.put(FieldKey::by_name("a".into()), ValueType::Int32, &Value::Int32(1));
    enc.put(FieldKey::by_name("b".into()), ValueType::Bytes, &Value::Bytes(vec![9]));
    let bytes = enc.flush();

    let mut dec = Decoder::new(&bytes);
    let mut listener = RowRecorder::default();
    dec.decode(&mut listener).unwrap();

    let mask = dec.type_mask();
    assert_eq!(mask, ValueType::Int32.mask_bit() | ValueType::Bytes.mask_bit());
    assert_eq!(mask & ValueType::String.mask_bit(), 0);
}
