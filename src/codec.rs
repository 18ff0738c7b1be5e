//! The self-describing value codec. One encoded buffer is the 4-byte
//! version tag followed by a single tag-prefixed value; aggregates carry
//! explicit entry counts and refer back to previously emitted aggregates
//! by ordinal, so shared and cyclic graphs survive a round-trip.

use crate::buffer::Buffer;
use crate::error::{CodecError, CodecResult};
use crate::value::{Table, TableRef, Value};
use byteorder::{BigEndian, ByteOrder, ReadBytesExt};
use hashbrown::HashMap;
use std::cell::RefCell;
use std::io::Cursor;
use std::rc::Rc;

/// Format version 2: "LM" followed by `F6 02`.
pub const VERSION_TAG: [u8; 4] = [0x4C, 0x4D, 0xF6, 0x02];

// Tag bytes. Bit 6 selects the variant of a base type: true over false,
// integer over float, short string over long, back-reference over table.
// For tables, bits 4-5 hold the size class (8/16/32/64-bit counts).
const VARIANT: u8 = 0x40;
const CLASS_SHIFT: u8 = 4;

const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = TAG_FALSE | VARIANT;
const TAG_FLOAT: u8 = 3;
const TAG_INT: u8 = TAG_FLOAT | VARIANT;
const TAG_STR_LONG: u8 = 4;
const TAG_STR_SHORT: u8 = TAG_STR_LONG | VARIANT;
const TAG_TABLE_8: u8 = 5;
const TAG_TABLE_16: u8 = TAG_TABLE_8 | 1 << CLASS_SHIFT;
const TAG_TABLE_32: u8 = TAG_TABLE_8 | 2 << CLASS_SHIFT;
const TAG_TABLE_64: u8 = TAG_TABLE_8 | 3 << CLASS_SHIFT;
const TAG_BACKREF: u8 = TAG_TABLE_8 | VARIANT;

/// Recursion bound on aggregate nesting, both directions.
const MAX_DEPTH: usize = 512;

/// Encodes one value into an owned, version-tagged buffer.
pub fn encode(value: &Value) -> CodecResult<Buffer> {
    let mut buf = Buffer::new();
    buf.put(&VERSION_TAG)?;

    let mut refs = EncodeRefs::default();
    encode_value(&mut buf, value, &mut refs, 0)?;

    Ok(buf)
}

/// Decodes one value from a version-tagged byte string. The input is
/// treated as read-only; the entire input must be consumed.
pub fn decode(input: &[u8]) -> CodecResult<Value> {
    if input.len() < VERSION_TAG.len() || input[..VERSION_TAG.len()] != VERSION_TAG {
        return Err(CodecError::BadVersion);
    }

    let mut cursor = Cursor::new(&input[VERSION_TAG.len()..]);
    let mut refs: Vec<TableRef> = Vec::new();

    let value = decode_value(&mut cursor, &mut refs, 0)?;

    match remaining(&cursor) {
        0 => Ok(value),
        extra => Err(CodecError::TrailingData(extra)),
    }
}

/// Decodes from an owned buffer.
#[inline]
pub fn decode_buffer(buffer: &Buffer) -> CodecResult<Value> {
    decode(buffer.as_slice())
}

/// Aggregates already emitted, keyed by identity, with the next ordinal.
#[derive(Default)]
struct EncodeRefs {
    seen: HashMap<*const RefCell<Table>, i64>,
    count: i64,
}

fn encode_value(
    buf: &mut Buffer,
    value: &Value,
    refs: &mut EncodeRefs,
    depth: usize,
) -> CodecResult<()> {
    if depth > MAX_DEPTH {
        return Err(CodecError::NestingTooDeep);
    }

    match value {
        Value::Nil => Err(CodecError::UnsupportedType),
        Value::Bool(false) => buf.put_u8(TAG_FALSE),
        Value::Bool(true) => buf.put_u8(TAG_TRUE),
        Value::Float(v) => {
            buf.put_u8(TAG_FLOAT)?;
            buf.put_u64(v.to_bits())
        }
        Value::Int(v) => {
            buf.put_u8(TAG_INT)?;
            buf.put_i64(*v)
        }
        Value::Str(bytes) => encode_str(buf, bytes),
        Value::Table(handle) => encode_table(buf, handle, refs, depth),
    }
}

fn encode_str(buf: &mut Buffer, bytes: &[u8]) -> CodecResult<()> {
    if bytes.len() <= u8::max_value() as usize {
        buf.put_u8(TAG_STR_SHORT)?;
        buf.put_u8(bytes.len() as u8)?;
    } else {
        buf.put_u8(TAG_STR_LONG)?;
        buf.put_u64(bytes.len() as u64)?;
    }

    buf.put(bytes)
}

fn encode_table(
    buf: &mut Buffer,
    handle: &TableRef,
    refs: &mut EncodeRefs,
    depth: usize,
) -> CodecResult<()> {
    let identity = Rc::as_ptr(handle);

    if let Some(&ordinal) = refs.seen.get(&identity) {
        buf.put_u8(TAG_BACKREF)?;
        return buf.put_i64(ordinal);
    }

    // Assign the ordinal before recursing so a cycle back into this table
    // resolves to it.
    let ordinal = refs
        .count
        .checked_add(1)
        .ok_or(CodecError::TooManyTables)?;
    refs.count = ordinal;
    refs.seen.insert(identity, ordinal);

    // Reserve a tag and two count bytes for the common 8-bit case; the
    // header is widened in place afterwards if the counts demand it.
    let header = buf.pos();
    buf.put(&[TAG_TABLE_8, 0, 0])?;

    let table = handle.borrow();
    let mut narr: u64 = 0;
    let mut nrec: u64 = 0;

    for (key, value) in table.entries() {
        if key.is_nil() || value.is_nil() {
            continue;
        }

        let contiguous = match &key {
            Value::Int(i) => *i >= 1 && *i as u64 == narr + 1,
            _ => false,
        };

        if nrec == 0 && contiguous {
            narr = narr
                .checked_add(1)
                .ok_or(CodecError::TooManyArrayElements)?;
        } else {
            nrec = nrec
                .checked_add(1)
                .ok_or(CodecError::TooManyRecordElements)?;
        }

        encode_value(buf, &key, refs, depth + 1)?;
        encode_value(buf, value, refs, depth + 1)?;
    }

    drop(table);

    patch_table_header(buf, header, narr, nrec)
}

/// Rewrites the reserved table header once the counts are known. For the
/// wider size classes the pair payload is shifted towards the tail to make
/// room for the larger count fields.
fn patch_table_header(buf: &mut Buffer, header: usize, narr: u64, nrec: u64) -> CodecResult<()> {
    let class = size_class(narr).max(size_class(nrec));
    let width = 1usize << class;

    if class > 0 {
        buf.shift_tail(header + 3, 2 * width - 2)?;
    }

    let raw = buf.as_mut_slice();
    raw[header] = TAG_TABLE_8 | (class << CLASS_SHIFT);
    BigEndian::write_uint(&mut raw[header + 1..], narr, width);
    BigEndian::write_uint(&mut raw[header + 1 + width..], nrec, width);

    Ok(())
}

#[inline]
fn size_class(n: u64) -> u8 {
    if n <= u8::max_value() as u64 {
        0
    } else if n <= u16::max_value() as u64 {
        1
    } else if n <= u32::max_value() as u64 {
        2
    } else {
        3
    }
}

type Input<'a> = Cursor<&'a [u8]>;

#[inline]
fn remaining(input: &Input) -> usize {
    input.get_ref().len().saturating_sub(input.position() as usize)
}

// Reads off a memory cursor only ever fail at end of input.
#[inline]
fn underflow(_: std::io::Error) -> CodecError {
    CodecError::Underflow
}

fn decode_value(input: &mut Input, refs: &mut Vec<TableRef>, depth: usize) -> CodecResult<Value> {
    if depth > MAX_DEPTH {
        return Err(CodecError::NestingTooDeep);
    }

    let tag = input.read_u8().map_err(underflow)?;

    match tag {
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_FLOAT => {
            let bits = input.read_u64::<BigEndian>().map_err(underflow)?;
            Ok(Value::Float(f64::from_bits(bits)))
        }
        TAG_INT => {
            let v = input.read_i64::<BigEndian>().map_err(underflow)?;
            Ok(Value::Int(v))
        }
        TAG_STR_SHORT => {
            let len = input.read_u8().map_err(underflow)? as u64;
            decode_str(input, len)
        }
        TAG_STR_LONG => {
            let len = input.read_u64::<BigEndian>().map_err(underflow)?;
            decode_str(input, len)
        }
        TAG_TABLE_8 | TAG_TABLE_16 | TAG_TABLE_32 | TAG_TABLE_64 => {
            let width = 1usize << ((tag >> CLASS_SHIFT) & 3);
            decode_table(input, width, refs, depth)
        }
        TAG_BACKREF => {
            let ordinal = input.read_i64::<BigEndian>().map_err(underflow)?;

            if ordinal < 1 || ordinal as u64 > refs.len() as u64 {
                return Err(CodecError::BadBackref(ordinal));
            }

            Ok(Value::Table(refs[(ordinal - 1) as usize].clone()))
        }
        _ => Err(CodecError::UnsupportedType),
    }
}

fn decode_str(input: &mut Input, len: u64) -> CodecResult<Value> {
    if len > usize::max_value() as u64 {
        return Err(CodecError::StringTooLong(len));
    }

    let len = len as usize;

    if len > remaining(input) {
        return Err(CodecError::Underflow);
    }

    let start = input.position() as usize;
    let bytes = input.get_ref()[start..start + len].to_vec();
    input.set_position((start + len) as u64);

    Ok(Value::Str(bytes))
}

fn decode_table(
    input: &mut Input,
    width: usize,
    refs: &mut Vec<TableRef>,
    depth: usize,
) -> CodecResult<Value> {
    let narr = input.read_uint::<BigEndian>(width).map_err(underflow)?;
    let nrec = input.read_uint::<BigEndian>(width).map_err(underflow)?;

    if width == 8 && (narr > i64::max_value() as u64 || nrec > i64::max_value() as u64) {
        return Err(CodecError::BadTableSize);
    }

    // Every entry costs at least a tag byte for its key and its value, so
    // an impossible count is rejected before any pairs are materialized.
    let total = narr.checked_add(nrec).ok_or(CodecError::BadTableSize)?;
    if total > (remaining(input) / 2) as u64 {
        return Err(CodecError::Underflow);
    }

    // The handle is registered before its entries are decoded so that a
    // back-reference from inside the subtree resolves to it.
    let handle = Table::new().share();
    refs.push(handle.clone());

    for _ in 0..total {
        let key = decode_value(input, refs, depth + 1)?;
        let value = decode_value(input, refs, depth + 1)?;
        handle.borrow_mut().insert(key, value);
    }

    Ok(Value::Table(handle))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: &Value) -> Value {
        let encoded = encode(value).unwrap();
        decode(&encoded).unwrap()
    }

    #[test]
    fn test_encode_true_exact() {
        let encoded = encode(&Value::Bool(true)).unwrap();

        assert_eq!(&encoded[..], &[0x4C, 0x4D, 0xF6, 0x02, 0x41]);
        assert!(roundtrip(&Value::Bool(true)).deep_eq(&Value::Bool(true)));
    }

    #[test]
    fn test_encode_one_exact() {
        let encoded = encode(&Value::Int(1)).unwrap();

        assert_eq!(
            &encoded[..],
            &[0x4C, 0x4D, 0xF6, 0x02, 0x43, 0, 0, 0, 0, 0, 0, 0, 1]
        );
        assert!(roundtrip(&Value::Int(1)).deep_eq(&Value::Int(1)));
    }

    #[test]
    fn test_encode_str_exact() {
        let encoded = encode(&Value::from("test")).unwrap();

        assert_eq!(
            &encoded[..],
            &[0x4C, 0x4D, 0xF6, 0x02, 0x44, 0x04, 0x74, 0x65, 0x73, 0x74]
        );
    }

    #[test]
    fn test_scalar_roundtrips() {
        let values = [
            Value::Bool(false),
            Value::Int(i64::min_value()),
            Value::Int(i64::max_value()),
            Value::Float(0.5),
            Value::Float(-1.75e300),
            Value::Str(Vec::new()),
            Value::str(vec![0u8; 300]),
        ];

        for value in &values {
            assert!(roundtrip(value).deep_eq(value), "{:?}", value);
        }
    }

    #[test]
    fn test_float_roundtrip_bitwise() {
        for bits in &[
            std::f64::NAN.to_bits(),
            0x7ff8_0000_dead_beefu64,
            0x8000_0000_0000_0000u64,
        ] {
            let value = Value::Float(f64::from_bits(*bits));

            match roundtrip(&value) {
                Value::Float(back) => assert_eq!(back.to_bits(), *bits),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_long_string_tag() {
        let value = Value::str(vec![7u8; 256]);
        let encoded = encode(&value).unwrap();

        assert_eq!(encoded[4], TAG_STR_LONG);
        assert!(roundtrip(&value).deep_eq(&value));
    }

    #[test]
    fn test_empty_table() {
        let value = Value::table(Table::new());
        let encoded = encode(&value).unwrap();

        assert_eq!(&encoded[4..], &[TAG_TABLE_8, 0, 0]);
        assert!(roundtrip(&value).deep_eq(&value));
    }

    #[test]
    fn test_mixed_table_roundtrip() {
        let mut table = Table::new();
        table.push(true);
        table.push(2i64);
        table.insert(Value::str("pi"), 3.5f64);
        table.insert(4i64, "late");

        let value = Value::table(table);
        let back = roundtrip(&value);

        assert!(back.deep_eq(&value));

        if let Value::Table(handle) = back {
            let table = handle.borrow();
            assert_eq!(table.array_len(), 2);
            assert_eq!(table.record_len(), 2);
        }
    }

    #[test]
    fn test_out_of_order_integer_keys_stay_records() {
        let mut table = Table::new();
        table.push(10i64);
        table.insert(3i64, 30i64);
        table.insert(2i64, 20i64);

        let value = Value::table(table);
        let encoded = encode(&value).unwrap();

        // One contiguous array entry, two record entries.
        assert_eq!(&encoded[4..7], &[TAG_TABLE_8, 1, 2]);
        assert!(decode(&encoded).unwrap().deep_eq(&value));
    }

    #[test]
    fn test_nil_hole_shifts_later_array_entries() {
        let mut table = Table::new();
        table.push(10i64);
        table.push(Value::Nil);
        table.push(30i64);

        let encoded = encode(&Value::table(table)).unwrap();

        // The dropped hole breaks contiguity: key 3 becomes a record entry.
        assert_eq!(&encoded[4..7], &[TAG_TABLE_8, 1, 1]);

        if let Value::Table(handle) = decode(&encoded).unwrap() {
            let table = handle.borrow();
            assert_eq!(table.array_len(), 1);
            assert_eq!(table.get(&Value::Int(3)), Some(&Value::Int(30)));
        }
    }

    #[test]
    fn test_drop_unsupported_entries() {
        let mut table = Table::new();
        table.push(1i64);
        table.insert(Value::str("keep"), 2i64);
        table.insert(Value::str("dropped"), Value::Nil);
        table.insert(Value::Nil, 3i64);

        let back = roundtrip(&Value::table(table));

        if let Value::Table(handle) = back {
            let table = handle.borrow();
            assert_eq!(table.array_len(), 1);
            assert_eq!(table.record_len(), 1);
            assert_eq!(table.get(&Value::str("keep")), Some(&Value::Int(2)));
            assert_eq!(table.get(&Value::str("dropped")), None);
        } else {
            panic!("expected table");
        }
    }

    #[test]
    fn test_nil_unsupported_at_top_level() {
        assert_eq!(encode(&Value::Nil), Err(CodecError::UnsupportedType));
    }

    #[test]
    fn test_shared_table_identity() {
        let shared = Table::new().share();
        shared.borrow_mut().push(42i64);

        let mut outer = Table::new();
        outer.push(shared.clone());
        outer.push(shared);

        let back = roundtrip(&Value::table(outer));

        if let Value::Table(handle) = back {
            let table = handle.borrow();
            match (table.get(&Value::Int(1)), table.get(&Value::Int(2))) {
                (Some(Value::Table(a)), Some(Value::Table(b))) => {
                    assert!(Rc::ptr_eq(a, b));
                }
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_cyclic_pair() {
        let a = Table::new().share();
        let b = Table::new().share();

        a.borrow_mut().insert(Value::str("x"), 1i64);
        a.borrow_mut().insert(Value::str("other"), b.clone());
        b.borrow_mut().insert(Value::str("y"), 2i64);
        b.borrow_mut().insert(Value::str("other"), a.clone());

        let back = roundtrip(&Value::Table(a.clone()));

        let handle = match &back {
            Value::Table(handle) => handle.clone(),
            other => panic!("unexpected {:?}", other),
        };

        let inner = handle.borrow();
        assert_eq!(inner.get(&Value::str("x")), Some(&Value::Int(1)));

        let other = match inner.get(&Value::str("other")) {
            Some(Value::Table(other)) => other.clone(),
            other => panic!("unexpected {:?}", other),
        };

        assert_eq!(other.borrow().get(&Value::str("y")), Some(&Value::Int(2)));

        match other.borrow().get(&Value::str("other")) {
            // The cycle closes onto the decoded root, not a copy.
            Some(Value::Table(root)) => assert!(Rc::ptr_eq(root, &handle)),
            other => panic!("unexpected {:?}", other),
        };
    }

    #[test]
    fn test_self_reference() {
        let table = Table::new().share();
        table.borrow_mut().insert(Value::str("me"), table.clone());

        let back = roundtrip(&Value::Table(table));

        if let Value::Table(handle) = back {
            match handle.borrow().get(&Value::str("me")) {
                Some(Value::Table(me)) => assert!(Rc::ptr_eq(me, &handle)),
                other => panic!("unexpected {:?}", other),
            }
        }
    }

    #[test]
    fn test_reencode_is_bit_exact() {
        let shared = Table::new().share();
        shared.borrow_mut().insert(Value::str("n"), 1i64);

        let mut outer = Table::new();
        outer.push(shared.clone());
        outer.push(shared);
        outer.insert(Value::str("tag"), 7.25f64);

        let value = Value::table(outer);
        let first = encode(&value).unwrap();
        let second = encode(&decode(&first).unwrap()).unwrap();

        assert_eq!(&first[..], &second[..]);
    }

    #[test]
    fn test_size_class_8bit_boundary() {
        let mut table = Table::new();
        for _ in 0..255 {
            table.push(true);
        }

        let encoded = encode(&Value::table(table)).unwrap();

        assert_eq!(encoded[4], TAG_TABLE_8);
        assert_eq!(&encoded[5..7], &[255, 0]);
    }

    #[test]
    fn test_size_class_16bit() {
        let mut table = Table::new();
        for _ in 0..256 {
            table.push(true);
        }

        let value = Value::table(table);
        let encoded = encode(&value).unwrap();

        assert_eq!(encoded[4], TAG_TABLE_16);
        assert_eq!(&encoded[5..9], &[1, 0, 0, 0]);

        if let Value::Table(handle) = decode(&encoded).unwrap() {
            assert_eq!(handle.borrow().array_len(), 256);
        }
    }

    #[test]
    fn test_size_class_32bit() {
        let mut table = Table::new();
        for _ in 0..65536 {
            table.push(false);
        }

        let value = Value::table(table);
        let encoded = encode(&value).unwrap();

        assert_eq!(encoded[4], TAG_TABLE_32);
        assert_eq!(&encoded[5..13], &[0, 1, 0, 0, 0, 0, 0, 0]);

        if let Value::Table(handle) = decode(&encoded).unwrap() {
            assert_eq!(handle.borrow().array_len(), 65536);
        }
    }

    #[test]
    fn test_size_class_record_side() {
        let mut table = Table::new();
        for i in 0..256i64 {
            // Zero is never an array key, so everything is a record entry.
            table.insert(-i, i);
        }

        let encoded = encode(&Value::table(table)).unwrap();

        assert_eq!(encoded[4], TAG_TABLE_16);
        assert_eq!(&encoded[5..9], &[0, 0, 1, 0]);
    }

    #[test]
    fn test_bad_version() {
        assert_eq!(decode(&[]), Err(CodecError::BadVersion));
        assert_eq!(decode(&[0x4C, 0x4D]), Err(CodecError::BadVersion));
        assert_eq!(
            decode(&[0x4C, 0x4D, 0xF6, 0x01, 0x41]),
            Err(CodecError::BadVersion)
        );
    }

    #[test]
    fn test_trailing_data() {
        let mut raw = encode(&Value::Bool(true)).unwrap().as_slice().to_vec();
        raw.push(0);

        assert_eq!(decode(&raw), Err(CodecError::TrailingData(1)));
    }

    #[test]
    fn test_unknown_tag() {
        let raw = [0x4C, 0x4D, 0xF6, 0x02, 0xFF];

        assert_eq!(decode(&raw), Err(CodecError::UnsupportedType));
    }

    #[test]
    fn test_truncated_scalar() {
        let raw = [0x4C, 0x4D, 0xF6, 0x02, TAG_INT, 0, 0, 0];

        assert_eq!(decode(&raw), Err(CodecError::Underflow));
    }

    #[test]
    fn test_truncated_string() {
        let raw = [0x4C, 0x4D, 0xF6, 0x02, TAG_STR_SHORT, 10, b'a'];

        assert_eq!(decode(&raw), Err(CodecError::Underflow));
    }

    #[test]
    fn test_backref_out_of_range() {
        let mut raw = vec![0x4C, 0x4D, 0xF6, 0x02, TAG_BACKREF];
        raw.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 1]);

        assert_eq!(decode(&raw), Err(CodecError::BadBackref(1)));
    }

    #[test]
    fn test_backref_negative() {
        let mut raw = vec![0x4C, 0x4D, 0xF6, 0x02, TAG_BACKREF];
        raw.extend_from_slice(&(-1i64).to_be_bytes());

        assert_eq!(decode(&raw), Err(CodecError::BadBackref(-1)));
    }

    #[test]
    fn test_negative_table_size() {
        let mut raw = vec![0x4C, 0x4D, 0xF6, 0x02, TAG_TABLE_64];
        raw.extend_from_slice(&[0x80, 0, 0, 0, 0, 0, 0, 0]);
        raw.extend_from_slice(&[0u8; 8]);

        assert_eq!(decode(&raw), Err(CodecError::BadTableSize));
    }

    #[test]
    fn test_impossible_entry_count() {
        // Claims 200 record entries with two bytes of payload behind it.
        let raw = [0x4C, 0x4D, 0xF6, 0x02, TAG_TABLE_8, 0, 200, 0x41, 0x41];

        assert_eq!(decode(&raw), Err(CodecError::Underflow));
    }

    #[test]
    fn test_encode_nesting_bound() {
        let mut value = Value::Bool(true);

        for _ in 0..MAX_DEPTH + 8 {
            let mut outer = Table::new();
            outer.push(value);
            value = Value::table(outer);
        }

        assert_eq!(encode(&value), Err(CodecError::NestingTooDeep));
    }

    #[test]
    fn test_decode_nesting_bound() {
        let mut raw = VERSION_TAG.to_vec();

        for _ in 0..MAX_DEPTH + 8 {
            raw.extend_from_slice(&[TAG_TABLE_8, 1, 0, TAG_INT, 0, 0, 0, 0, 0, 0, 0, 1]);
        }
        raw.push(TAG_TRUE);

        assert_eq!(decode(&raw), Err(CodecError::NestingTooDeep));
    }
}
