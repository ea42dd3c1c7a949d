//! ChainPack, the self-delimiting binary encoding of [`RpcValue`].
//!
//! Wire format (control bytes):
//! ```text
//! 0x00-0x3f  UInt 0-63 packed          0x8b  MetaMap begin
//! 0x40-0x7f  Int 0-63 packed           0x8c  Decimal (Int mantissa + Int exponent)
//! 0x80  Null                           0x8d  DateTime
//! 0x81  UInt data follows              0x8e  CString (NUL terminated)
//! 0x82  Int data follows               0xfd  False
//! 0x83  Double (little-endian 8B)      0xfe  True
//! 0x85  Blob (UInt length prefix)      0xff  Term (ends List/Map/IMap/MetaMap)
//! 0x86  String (UInt length prefix)
//! 0x88  List begin   0x89  Map begin   0x8a  IMap begin
//! ```
//!
//! Variable-length integers pack the value big-endian; the number of leading
//! one bits in the head byte selects the total length for values up to
//! 28 bits, and `0xF0 | (n - 5)` heads an `n`-byte encoding above that.
//! Signed integers carry a sign bit at the most significant payload position.
//!
//! DateTime is milliseconds since 2018-02-02T00:00:00Z with two low flag bits
//! (has-TZ-offset, no-msec) and an optional 7-bit quarter-hour UTC offset.
//! The 7-bit offset is sign extended on read so that negative offsets and
//! instants before the epoch round-trip exactly.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::value::{DateTime, Decimal, Meta, MetaKey, RpcValue, Value};

/// Milliseconds between the Unix epoch and 2018-02-02T00:00:00Z.
pub const SHV_EPOCH_MSEC: i64 = 1_517_529_600_000;

/// Nesting depth guard shared by both codecs.
pub(crate) const MAX_NESTING_DEPTH: usize = 256;

mod cp {
    pub const NULL: u8 = 0x80;
    pub const UINT: u8 = 0x81;
    pub const INT: u8 = 0x82;
    pub const DOUBLE: u8 = 0x83;
    pub const BLOB: u8 = 0x85;
    pub const STRING: u8 = 0x86;
    pub const LIST: u8 = 0x88;
    pub const MAP: u8 = 0x89;
    pub const IMAP: u8 = 0x8a;
    pub const META_MAP: u8 = 0x8b;
    pub const DECIMAL: u8 = 0x8c;
    pub const DATETIME: u8 = 0x8d;
    pub const CSTRING: u8 = 0x8e;
    pub const FALSE: u8 = 0xfd;
    pub const TRUE: u8 = 0xfe;
    pub const TERM: u8 = 0xff;
}

/// Errors raised while decoding ChainPack data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UnpackError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A control byte that is not assigned in the schema.
    #[error("invalid control byte: 0x{0:02X}")]
    InvalidType(u8),

    /// A Map/IMap/MetaMap key of the wrong variant.
    #[error("invalid {kind} key of type {got}")]
    InvalidKey { kind: &'static str, got: &'static str },

    /// String data that is not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Integer data wider than this implementation supports.
    #[error("integer of {0} bytes is too large")]
    IntTooLarge(usize),

    /// A DateTime whose offset field is out of range.
    #[error("invalid date-time encoding")]
    InvalidDateTime,

    /// Containers nested deeper than the implementation limit.
    #[error("nesting too deep")]
    NestingTooDeep,

    /// Extra bytes after a complete value where exactly one was expected.
    #[error("trailing bytes after value")]
    TrailingData,
}

// ── Integer helpers ───────────────────────────────────────────────────────────

fn significant_bits(num: u128) -> u32 {
    128 - num.leading_zeros()
}

/// Bytes needed to encode `bit_len` significant bits, head byte included.
fn bytes_needed(bit_len: u32) -> usize {
    let cnt = if bit_len == 0 {
        1
    } else if bit_len <= 28 {
        ((bit_len - 1) / 7 + 1) as usize
    } else {
        ((bit_len - 1) / 8 + 2) as usize
    };
    cnt.max(1)
}

/// Position of the sign bit for a payload of `bit_len` bits: the highest bit
/// the chosen encoding length can still carry.
fn expand_bit_len(bit_len: u32) -> u32 {
    let cnt = bytes_needed(bit_len) as u32;
    if bit_len <= 28 {
        cnt * 7 - 1
    } else {
        (cnt - 1) * 8 - 1
    }
}

fn write_uint_data_raw(out: &mut Vec<u8>, mut num: u128, bit_len: u32) {
    let byte_cnt = bytes_needed(bit_len);
    let mut data = vec![0u8; byte_cnt];
    for slot in data.iter_mut().rev() {
        *slot = (num & 0xff) as u8;
        num >>= 8;
    }
    if bit_len <= 28 {
        match byte_cnt {
            1 => data[0] &= 0x7f,
            2 => data[0] = (data[0] & 0x3f) | 0x80,
            3 => data[0] = (data[0] & 0x1f) | 0xc0,
            _ => data[0] = (data[0] & 0x0f) | 0xe0,
        }
    } else {
        data[0] = 0xf0 | (byte_cnt as u8 - 5);
    }
    out.extend_from_slice(&data);
}

/// Writes unsigned integer data (without any control byte).
pub fn write_uint_data(out: &mut Vec<u8>, num: u64) {
    write_uint_data_raw(out, num as u128, significant_bits(num as u128));
}

/// Writes signed integer data (without any control byte).
pub fn write_int_data(out: &mut Vec<u8>, num: i64) {
    let abs = num.unsigned_abs() as u128;
    let bit_len = significant_bits(abs) + 1; // sign bit
    let mut raw = abs;
    if num < 0 {
        raw |= 1u128 << expand_bit_len(bit_len);
    }
    write_uint_data_raw(out, raw, bit_len);
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Serializes one value, meta included, and returns the bytes.
pub fn pack(value: &RpcValue) -> Vec<u8> {
    let mut out = Vec::new();
    write(&mut out, value);
    out
}

/// Serializes one value into `out`.
pub fn write(out: &mut Vec<u8>, value: &RpcValue) {
    if let Some(meta) = value.meta() {
        write_meta(out, meta);
    }
    write_value(out, value.value());
}

fn write_meta(out: &mut Vec<u8>, meta: &Meta) {
    out.push(cp::META_MAP);
    for (key, val) in meta.iter() {
        match key {
            MetaKey::Int(k) => write_value(out, &Value::Int(*k)),
            MetaKey::Str(k) => write_value(out, &Value::String(k.clone())),
        }
        write(out, val);
    }
    out.push(cp::TERM);
}

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(cp::NULL),
        Value::Bool(v) => out.push(if *v { cp::TRUE } else { cp::FALSE }),
        Value::Int(v) => {
            if (0..64).contains(v) {
                out.push(*v as u8 + 64);
            } else {
                out.push(cp::INT);
                write_int_data(out, *v);
            }
        }
        Value::UInt(v) => {
            if *v < 64 {
                out.push(*v as u8);
            } else {
                out.push(cp::UINT);
                write_uint_data(out, *v);
            }
        }
        Value::Double(v) => {
            out.push(cp::DOUBLE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Decimal(v) => {
            out.push(cp::DECIMAL);
            write_int_data(out, v.mantissa);
            write_int_data(out, v.exponent as i64);
        }
        Value::Bytes(v) => {
            out.push(cp::BLOB);
            write_uint_data(out, v.len() as u64);
            out.extend_from_slice(v);
        }
        Value::String(v) => {
            out.push(cp::STRING);
            write_uint_data(out, v.len() as u64);
            out.extend_from_slice(v.as_bytes());
        }
        Value::DateTime(v) => {
            out.push(cp::DATETIME);
            write_int_data(out, encode_datetime(v));
        }
        Value::List(items) => {
            out.push(cp::LIST);
            for item in items {
                write(out, item);
            }
            out.push(cp::TERM);
        }
        Value::Map(map) => {
            out.push(cp::MAP);
            for (k, v) in map {
                write_value(out, &Value::String(k.clone()));
                write(out, v);
            }
            out.push(cp::TERM);
        }
        Value::IMap(map) => {
            out.push(cp::IMAP);
            for (k, v) in map {
                write_value(out, &Value::Int(*k));
                write(out, v);
            }
            out.push(cp::TERM);
        }
    }
}

fn encode_datetime(dt: &DateTime) -> i64 {
    let msec = dt.epoch_msec() - SHV_EPOCH_MSEC;
    let quarters = dt.utc_offset_min() / 15;
    let no_msec = msec.rem_euclid(1000) == 0;
    let mut res = if no_msec { msec / 1000 } else { msec };
    if quarters != 0 {
        res = (res << 7) | (quarters as i64 & 0x7f);
    }
    res <<= 2;
    if quarters != 0 {
        res |= 1;
    }
    if no_msec {
        res |= 2;
    }
    res
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Cursor over a byte slice that decodes one ChainPack value at a time.
pub struct ChainPackReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// Deserializes a single value from the start of `data`. Trailing bytes are
/// an error at this level; use [`ChainPackReader`] to decode a stream.
pub fn unpack(data: &[u8]) -> Result<RpcValue, UnpackError> {
    let mut reader = ChainPackReader::new(data);
    let value = reader.read()?;
    if reader.pos != data.len() {
        return Err(UnpackError::TrailingData);
    }
    Ok(value)
}

/// Decodes a bare unsigned integer from the start of `data`, returning the
/// value and the number of bytes consumed. This is the length prefix the
/// Block framing uses.
pub fn unpack_uint_data(data: &[u8]) -> Result<(u64, usize), UnpackError> {
    let mut reader = ChainPackReader::new(data);
    let num = reader.read_uint_data()?;
    Ok((num, reader.pos))
}

impl<'a> ChainPackReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn get_byte(&mut self) -> Result<u8, UnpackError> {
        let b = *self.buf.get(self.pos).ok_or(UnpackError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn peek_byte(&self) -> Result<u8, UnpackError> {
        self.buf.get(self.pos).copied().ok_or(UnpackError::UnexpectedEof)
    }

    fn get_slice(&mut self, len: usize) -> Result<&'a [u8], UnpackError> {
        let end = self.pos.checked_add(len).ok_or(UnpackError::UnexpectedEof)?;
        let slice = self.buf.get(self.pos..end).ok_or(UnpackError::UnexpectedEof)?;
        self.pos = end;
        Ok(slice)
    }

    /// Decodes one complete value, meta included.
    pub fn read(&mut self) -> Result<RpcValue, UnpackError> {
        self.read_depth(0)
    }

    fn read_depth(&mut self, depth: usize) -> Result<RpcValue, UnpackError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(UnpackError::NestingTooDeep);
        }
        let mut meta = None;
        if self.peek_byte()? == cp::META_MAP {
            self.get_byte()?;
            meta = Some(self.read_meta(depth)?);
        }
        let value = self.read_value(depth)?;
        Ok(RpcValue::new(value, meta))
    }

    fn read_meta(&mut self, depth: usize) -> Result<Meta, UnpackError> {
        let mut meta = Meta::new();
        while self.peek_byte()? != cp::TERM {
            let key = match self.read_value(depth + 1)? {
                Value::Int(k) => MetaKey::Int(k),
                Value::UInt(k) => MetaKey::Int(k as i64),
                Value::String(k) => MetaKey::Str(k),
                other => {
                    return Err(UnpackError::InvalidKey { kind: "MetaMap", got: other.type_name() })
                }
            };
            let val = self.read_depth(depth + 1)?;
            meta.0.insert(key, val);
        }
        self.get_byte()?; // TERM
        Ok(meta)
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, UnpackError> {
        let schema = self.get_byte()?;
        Ok(match schema {
            0x00..=0x3f => Value::UInt(u64::from(schema)),
            0x40..=0x7f => Value::Int(i64::from(schema & 0x3f)),
            cp::NULL => Value::Null,
            cp::TRUE => Value::Bool(true),
            cp::FALSE => Value::Bool(false),
            cp::UINT => Value::UInt(self.read_uint_data()?),
            cp::INT => Value::Int(self.read_int_data()?),
            cp::DOUBLE => {
                let raw = self.get_slice(8)?;
                Value::Double(f64::from_le_bytes(raw.try_into().expect("8 byte slice")))
            }
            cp::DECIMAL => {
                let mantissa = self.read_int_data()?;
                let exponent = self.read_int_data()?;
                let exponent =
                    i32::try_from(exponent).map_err(|_| UnpackError::IntTooLarge(8))?;
                Value::Decimal(Decimal::new(mantissa, exponent))
            }
            cp::DATETIME => self.read_datetime()?,
            cp::BLOB => {
                let len = self.read_uint_data()? as usize;
                Value::Bytes(self.get_slice(len)?.to_vec())
            }
            cp::STRING => {
                let len = self.read_uint_data()? as usize;
                let raw = self.get_slice(len)?;
                Value::String(
                    std::str::from_utf8(raw).map_err(|_| UnpackError::InvalidUtf8)?.to_string(),
                )
            }
            cp::CSTRING => self.read_cstring()?,
            cp::LIST => {
                let mut items = Vec::new();
                while self.peek_byte()? != cp::TERM {
                    items.push(self.read_depth(depth + 1)?);
                }
                self.get_byte()?;
                Value::List(items)
            }
            cp::MAP => {
                let mut map = BTreeMap::new();
                while self.peek_byte()? != cp::TERM {
                    let key = match self.read_value(depth + 1)? {
                        Value::String(k) => k,
                        other => {
                            return Err(UnpackError::InvalidKey { kind: "Map", got: other.type_name() })
                        }
                    };
                    map.insert(key, self.read_depth(depth + 1)?);
                }
                self.get_byte()?;
                Value::Map(map)
            }
            cp::IMAP => {
                let mut map = BTreeMap::new();
                while self.peek_byte()? != cp::TERM {
                    let key = match self.read_value(depth + 1)? {
                        Value::Int(k) => k,
                        Value::UInt(k) => k as i64,
                        other => {
                            return Err(UnpackError::InvalidKey { kind: "IMap", got: other.type_name() })
                        }
                    };
                    map.insert(key, self.read_depth(depth + 1)?);
                }
                self.get_byte()?;
                Value::IMap(map)
            }
            other => return Err(UnpackError::InvalidType(other)),
        })
    }

    fn read_uint_data_raw(&mut self) -> Result<(u128, u32), UnpackError> {
        let head = self.get_byte()?;
        let (extra, mut num, bit_len) = if head & 0x80 == 0 {
            (0usize, u128::from(head & 0x7f), 7)
        } else if head & 0x40 == 0 {
            (1, u128::from(head & 0x3f), 6 + 8)
        } else if head & 0x20 == 0 {
            (2, u128::from(head & 0x1f), 5 + 16)
        } else if head & 0x10 == 0 {
            (3, u128::from(head & 0x0f), 4 + 24)
        } else {
            let cnt = usize::from(head & 0x0f) + 4;
            if cnt > 15 {
                return Err(UnpackError::IntTooLarge(cnt));
            }
            (cnt, 0, cnt as u32 * 8)
        };
        for _ in 0..extra {
            num = (num << 8) | u128::from(self.get_byte()?);
        }
        Ok((num, bit_len))
    }

    /// Decodes bare unsigned integer data.
    pub fn read_uint_data(&mut self) -> Result<u64, UnpackError> {
        let (num, _) = self.read_uint_data_raw()?;
        u64::try_from(num).map_err(|_| UnpackError::IntTooLarge(16))
    }

    fn read_int_data(&mut self) -> Result<i64, UnpackError> {
        let (num, bit_len) = self.read_uint_data_raw()?;
        let sign_mask = 1u128 << (bit_len - 1);
        let (magnitude, neg) = if num & sign_mask != 0 {
            (num & !sign_mask, true)
        } else {
            (num, false)
        };
        if neg {
            // -2^63 is representable even though its magnitude is not.
            if magnitude > 1u128 << 63 {
                return Err(UnpackError::IntTooLarge(16));
            }
            Ok((-(magnitude as i128)) as i64)
        } else {
            i64::try_from(magnitude).map_err(|_| UnpackError::IntTooLarge(16))
        }
    }

    fn read_datetime(&mut self) -> Result<Value, UnpackError> {
        let mut d = self.read_int_data()?;
        let has_tz = d & 1 != 0;
        let no_msec = d & 2 != 0;
        d >>= 2;
        let mut offset_min = 0i32;
        if has_tz {
            let mut offset = (d & 0x7f) as i32;
            if offset & 0x40 != 0 {
                offset -= 128; // sign extend the 7-bit field
            }
            offset_min = offset * 15;
            d >>= 7;
        }
        let msec = if no_msec { d.checked_mul(1000).ok_or(UnpackError::InvalidDateTime)? } else { d };
        let epoch_msec = msec.checked_add(SHV_EPOCH_MSEC).ok_or(UnpackError::InvalidDateTime)?;
        DateTime::from_epoch_msec_tz(epoch_msec, offset_min)
            .map(Value::DateTime)
            .map_err(|_| UnpackError::InvalidDateTime)
    }

    fn read_cstring(&mut self) -> Result<Value, UnpackError> {
        let mut raw = Vec::new();
        loop {
            let b = self.get_byte()?;
            match b {
                0 => break,
                b'\\' => match self.get_byte()? {
                    b'\\' => raw.push(b'\\'),
                    b'0' => raw.push(0),
                    other => raw.push(other),
                },
                other => raw.push(other),
            }
        }
        Ok(Value::String(
            String::from_utf8(raw).map_err(|_| UnpackError::InvalidUtf8)?,
        ))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(value: RpcValue) -> RpcValue {
        let bytes = pack(&value);
        let mut reader = ChainPackReader::new(&bytes);
        let decoded = reader.read().expect("decode failed");
        assert_eq!(reader.position(), bytes.len(), "whole buffer must be consumed");
        decoded
    }

    fn assert_round_trip(value: RpcValue) {
        assert_eq!(round_trip(value.clone()), value);
    }

    // ── Byte-level vectors ────────────────────────────────────────────────────

    #[test]
    fn test_packed_small_uint_is_single_byte() {
        assert_eq!(pack(&RpcValue::from(0u64)), vec![0x00]);
        assert_eq!(pack(&RpcValue::from(63u64)), vec![0x3f]);
    }

    #[test]
    fn test_packed_small_int_is_single_byte() {
        assert_eq!(pack(&RpcValue::from(0i64)), vec![0x40]);
        assert_eq!(pack(&RpcValue::from(63i64)), vec![0x7f]);
    }

    #[test]
    fn test_uint_64_uses_long_form() {
        assert_eq!(pack(&RpcValue::from(64u64)), vec![0x81, 0x40]);
    }

    #[test]
    fn test_uint_128_uses_two_byte_data() {
        assert_eq!(pack(&RpcValue::from(128u64)), vec![0x81, 0x80, 0x80]);
    }

    #[test]
    fn test_negative_one_encoding() {
        assert_eq!(pack(&RpcValue::from(-1i64)), vec![0x82, 0x41]);
    }

    #[test]
    fn test_true_false_null_control_bytes() {
        assert_eq!(pack(&RpcValue::from(true)), vec![0xfe]);
        assert_eq!(pack(&RpcValue::from(false)), vec![0xfd]);
        assert_eq!(pack(&RpcValue::null()), vec![0x80]);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        assert_eq!(pack(&RpcValue::from("ab")), vec![0x86, 0x02, b'a', b'b']);
    }

    #[test]
    fn test_meta_map_precedes_value() {
        let mut v = RpcValue::from(Vec::<RpcValue>::new());
        v.meta_mut().insert(1i64, 2i64);
        // 0x8b <int 1> <int 2> 0xff 0x88 0xff
        assert_eq!(pack(&v), vec![0x8b, 0x41, 0x42, 0xff, 0x88, 0xff]);
    }

    // ── Round trips ───────────────────────────────────────────────────────────

    #[test]
    fn test_int_boundaries_round_trip() {
        for v in [
            0i64, 1, -1, 63, 64, -64, 127, 128, -128, 1 << 13, (1 << 21) - 1,
            1 << 21, 1 << 28, -(1 << 28), i64::MAX, i64::MIN + 1, i64::MIN,
        ] {
            assert_round_trip(RpcValue::from(v));
        }
    }

    #[test]
    fn test_uint_boundaries_round_trip() {
        for v in [0u64, 63, 64, 127, 128, 1 << 14, 1 << 28, 1 << 29, u64::MAX] {
            assert_round_trip(RpcValue::from(v));
        }
    }

    #[test]
    fn test_double_round_trip() {
        for v in [0.0f64, -0.0, 1.5, -1e300, f64::INFINITY, f64::NAN] {
            assert_round_trip(RpcValue::from(v));
        }
    }

    #[test]
    fn test_decimal_round_trip() {
        for v in [Decimal::new(0, 0), Decimal::new(230, -2), Decimal::new(-5, 30)] {
            assert_round_trip(RpcValue::from(v));
        }
    }

    #[test]
    fn test_blob_and_string_round_trip() {
        assert_round_trip(RpcValue::from(vec![0u8, 1, 2, 0xff, 0xaa]));
        assert_round_trip(RpcValue::from("kočka — 🐈"));
        assert_round_trip(RpcValue::from(""));
    }

    #[test]
    fn test_containers_round_trip() {
        let list = RpcValue::from(vec![
            RpcValue::from(1i64),
            RpcValue::from("two"),
            RpcValue::from(vec![RpcValue::null()]),
        ]);
        assert_round_trip(list);

        let mut map = BTreeMap::new();
        map.insert("a".to_string(), RpcValue::from(false));
        map.insert("b".to_string(), RpcValue::from(12u64));
        assert_round_trip(RpcValue::from(map));

        let mut imap = BTreeMap::new();
        imap.insert(1i64, RpcValue::from("x"));
        imap.insert(-3i64, RpcValue::from("y"));
        assert_round_trip(RpcValue::from(imap));
    }

    #[test]
    fn test_empty_containers_round_trip() {
        assert_round_trip(RpcValue::from(Vec::<RpcValue>::new()));
        assert_round_trip(RpcValue::from(BTreeMap::<String, RpcValue>::new()));
        assert_round_trip(RpcValue::from(BTreeMap::<i64, RpcValue>::new()));
    }

    #[test]
    fn test_meta_round_trip_including_string_keys() {
        let mut v = RpcValue::from(42i64);
        v.meta_mut().insert(8i64, 15i64);
        v.meta_mut().insert("name", "answer");
        assert_round_trip(v);
    }

    #[test]
    fn test_nested_element_meta_round_trips() {
        let mut inner = RpcValue::from("leaf");
        inner.meta_mut().insert(1i64, 7i64);
        assert_round_trip(RpcValue::from(vec![inner]));
    }

    // ── DateTime ──────────────────────────────────────────────────────────────

    #[test]
    fn test_datetime_round_trip_utc() {
        let dt = DateTime::parse_iso("2022-05-01T10:00:00Z").unwrap();
        assert_round_trip(RpcValue::from(dt));
    }

    #[test]
    fn test_datetime_round_trip_with_msec_and_offset() {
        let dt = DateTime::parse_iso("2021-12-24T18:30:00.123+01:00").unwrap();
        assert_round_trip(RpcValue::from(dt));
    }

    #[test]
    fn test_datetime_negative_offset_round_trips() {
        let dt = DateTime::parse_iso("2022-05-01T10:00:00-04:00").unwrap();
        assert_round_trip(RpcValue::from(dt));
    }

    #[test]
    fn test_datetime_before_chainpack_epoch_round_trips() {
        // Instants before 2018-02-02 encode as negative offsets; earlier
        // readers broke on these.
        for iso in [
            "2017-05-03T11:30:00Z",
            "1970-01-01T00:00:00Z",
            "2018-02-01T23:59:59.999Z",
            "2017-05-03T11:30:00-04:00",
        ] {
            let dt = DateTime::parse_iso(iso).unwrap();
            assert_round_trip(RpcValue::from(dt));
        }
    }

    #[test]
    fn test_datetime_epoch_boundary_encodes_as_zero() {
        let dt = DateTime::from_epoch_msec(SHV_EPOCH_MSEC);
        // flags only: no TZ, whole seconds
        assert_eq!(pack(&RpcValue::from(dt)), vec![0x8d, 0x02]);
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    #[test]
    fn test_truncated_input_reports_eof() {
        let bytes = pack(&RpcValue::from("hello"));
        let mut reader = ChainPackReader::new(&bytes[..3]);
        assert_eq!(reader.read(), Err(UnpackError::UnexpectedEof));
    }

    #[test]
    fn test_unassigned_control_byte_is_invalid_type() {
        let mut reader = ChainPackReader::new(&[0x84]);
        assert_eq!(reader.read(), Err(UnpackError::InvalidType(0x84)));
    }

    #[test]
    fn test_map_with_int_key_is_rejected() {
        // 0x89 <int 1> <int 2> 0xff
        let mut reader = ChainPackReader::new(&[0x89, 0x41, 0x42, 0xff]);
        assert!(matches!(reader.read(), Err(UnpackError::InvalidKey { kind: "Map", .. })));
    }

    #[test]
    fn test_invalid_utf8_string_is_rejected() {
        let mut reader = ChainPackReader::new(&[0x86, 0x01, 0xff]);
        assert_eq!(reader.read(), Err(UnpackError::InvalidUtf8));
    }

    #[test]
    fn test_cstring_decodes_escapes() {
        // 0x8e 'a' '\' '0' 'b' NUL
        let mut reader = ChainPackReader::new(&[0x8e, b'a', b'\\', b'0', b'b', 0]);
        assert_eq!(reader.read().unwrap(), RpcValue::from("a\0b"));
    }

    // ── Bare uint data (Block framing prefix) ─────────────────────────────────

    #[test]
    fn test_uint_data_round_trip() {
        for v in [0u64, 1, 127, 128, 16_383, 16_384, 1 << 27, 1 << 28, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            write_uint_data(&mut out, v);
            let (back, used) = unpack_uint_data(&out).unwrap();
            assert_eq!(back, v);
            assert_eq!(used, out.len());
        }
    }

    #[test]
    fn test_uint_data_partial_reports_eof() {
        let mut out = Vec::new();
        write_uint_data(&mut out, 1 << 20);
        assert_eq!(unpack_uint_data(&out[..1]), Err(UnpackError::UnexpectedEof));
    }
}
