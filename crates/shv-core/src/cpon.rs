//! CPON, the textual encoding of [`RpcValue`].
//!
//! A JSON-like grammar extended with the SHV types:
//! `123` Int, `123u` UInt, `0x1.8p+1` Double (hex mantissa, power-of-two
//! exponent), `12.5` / `12e-1` Decimal, `b"…"` Blob with `\HH` escapes,
//! `x"…"` hex Blob, `d"2018-02-02T00:00:00Z"` DateTime, `[…]` List,
//! `{"k":v}` Map, `i{1:v}` IMap and `<…>value` meta. `,` and `:` are
//! insignificant, as are `//` and `/* */` comments outside string literals.
//!
//! The writer emits doubles in the hex-mantissa scientific form so no
//! precision is lost to decimal conversion, and map keys in deterministic
//! order (integer keys sorted first, then string keys).

use std::collections::BTreeMap;

use thiserror::Error;

use crate::chainpack::MAX_NESTING_DEPTH;
use crate::value::{DateTime, Decimal, Meta, MetaKey, RpcValue, Value};

/// Errors raised while parsing CPON text.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    /// The input ended in the middle of a value.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// A byte that cannot start or continue the expected token.
    #[error("unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),

    /// A number literal that does not parse.
    #[error("malformed number at offset {0}")]
    MalformedNumber(usize),

    /// A `/*` or `//` comment that is never closed.
    #[error("malformed comment")]
    MalformedComment,

    /// String content that is not valid UTF-8 after unescaping.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    /// Map/IMap/meta key of an unsupported type.
    #[error("invalid {kind} key of type {got}")]
    InvalidKey { kind: &'static str, got: &'static str },

    /// A `d"…"` literal with a malformed date.
    #[error("malformed date-time: {0}")]
    MalformedDateTime(String),

    /// Containers nested deeper than the implementation limit.
    #[error("nesting too deep")]
    NestingTooDeep,

    /// Extra bytes after a complete value where exactly one was expected.
    #[error("trailing characters after value")]
    TrailingData,
}

// ── Writer ────────────────────────────────────────────────────────────────────

/// Serializes one value, meta included, into compact CPON.
pub fn pack(value: &RpcValue) -> String {
    let mut out = String::new();
    Writer { out: &mut out, indent: None, level: 0 }.write(value);
    out
}

/// Serializes with one container item per line, indented by `indent`.
pub fn pack_pretty(value: &RpcValue, indent: &str) -> String {
    let mut out = String::new();
    Writer { out: &mut out, indent: Some(indent.to_string()), level: 0 }.write(value);
    out
}

struct Writer<'a> {
    out: &'a mut String,
    indent: Option<String>,
    level: usize,
}

impl Writer<'_> {
    fn write(&mut self, value: &RpcValue) {
        if let Some(meta) = value.meta() {
            self.out.push('<');
            self.write_entries(meta.iter().map(|(k, v)| (k.clone(), v)));
            self.out.push('>');
        }
        self.write_value(value.value());
    }

    fn write_value(&mut self, value: &Value) {
        match value {
            Value::Null => self.out.push_str("null"),
            Value::Bool(true) => self.out.push_str("true"),
            Value::Bool(false) => self.out.push_str("false"),
            Value::Int(v) => self.out.push_str(&v.to_string()),
            Value::UInt(v) => {
                self.out.push_str(&v.to_string());
                self.out.push('u');
            }
            Value::Double(v) => self.out.push_str(&double_to_hex(*v)),
            Value::Decimal(v) => self.out.push_str(&v.to_string()),
            Value::DateTime(v) => {
                self.out.push_str("d\"");
                self.out.push_str(&v.to_iso_string());
                self.out.push('"');
            }
            Value::String(v) => self.write_string(v),
            Value::Bytes(v) => self.write_blob(v),
            Value::List(items) => {
                self.out.push('[');
                self.level += 1;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.newline_indent();
                    self.write(item);
                }
                self.level -= 1;
                if !items.is_empty() {
                    self.newline_indent();
                }
                self.out.push(']');
            }
            Value::Map(map) => {
                self.out.push('{');
                self.write_entries(map.iter().map(|(k, v)| (MetaKey::Str(k.clone()), v)));
                self.out.push('}');
            }
            Value::IMap(map) => {
                self.out.push_str("i{");
                self.write_entries(map.iter().map(|(k, v)| (MetaKey::Int(*k), v)));
                self.out.push('}');
            }
        }
    }

    fn write_entries<'v>(&mut self, entries: impl Iterator<Item = (MetaKey, &'v RpcValue)>) {
        self.level += 1;
        let mut any = false;
        for (i, (key, val)) in entries.enumerate() {
            any = true;
            if i > 0 {
                self.out.push(',');
            }
            self.newline_indent();
            match key {
                MetaKey::Int(k) => self.out.push_str(&k.to_string()),
                MetaKey::Str(k) => self.write_string(&k),
            }
            self.out.push(':');
            self.write(val);
        }
        self.level -= 1;
        if any {
            self.newline_indent();
        }
    }

    fn newline_indent(&mut self) {
        if let Some(indent) = &self.indent {
            self.out.push('\n');
            for _ in 0..self.level {
                self.out.push_str(indent);
            }
        }
    }

    fn write_string(&mut self, s: &str) {
        self.out.push('"');
        for c in s.chars() {
            match c {
                '\0' => self.out.push_str("\\0"),
                '\\' => self.out.push_str("\\\\"),
                '\t' => self.out.push_str("\\t"),
                '\u{8}' => self.out.push_str("\\b"),
                '\r' => self.out.push_str("\\r"),
                '\n' => self.out.push_str("\\n"),
                '"' => self.out.push_str("\\\""),
                c => self.out.push(c),
            }
        }
        self.out.push('"');
    }

    fn write_blob(&mut self, data: &[u8]) {
        self.out.push_str("b\"");
        for &b in data {
            match b {
                b'\\' => self.out.push_str("\\\\"),
                b'"' => self.out.push_str("\\\""),
                b'\t' => self.out.push_str("\\t"),
                b'\r' => self.out.push_str("\\r"),
                b'\n' => self.out.push_str("\\n"),
                0x20..=0x7e => self.out.push(b as char),
                other => {
                    self.out.push('\\');
                    self.out.push(hex_digit(other >> 4));
                    self.out.push(hex_digit(other & 0xf));
                }
            }
        }
        self.out.push('"');
    }
}

fn hex_digit(nibble: u8) -> char {
    char::from_digit(u32::from(nibble), 16).expect("nibble in range")
}

/// Formats a double the way `float.hex` does: `-0x1.8p+1`. The fraction is
/// trimmed of trailing zeros; the form parses back to the identical bits.
fn double_to_hex(v: f64) -> String {
    if v.is_nan() {
        return "NaN".to_string();
    }
    if v.is_infinite() {
        return if v < 0.0 { "-Inf" } else { "Inf" }.to_string();
    }
    let bits = v.to_bits();
    let sign = if bits >> 63 != 0 { "-" } else { "" };
    let exp_raw = ((bits >> 52) & 0x7ff) as i32;
    let frac = bits & ((1u64 << 52) - 1);
    let (int_part, exponent) = if exp_raw == 0 {
        // zero or subnormal
        (0, if frac == 0 { 0 } else { -1022 })
    } else {
        (1, exp_raw - 1023)
    };
    let mut frac_str = format!("{frac:013x}");
    while frac_str.ends_with('0') {
        frac_str.pop();
    }
    format!("{sign}0x{int_part}.{frac_str}p{}{}", if exponent < 0 { "-" } else { "+" }, exponent.abs())
}

/// Exact power of two as `f64`, valid down to the smallest subnormal.
fn pow2(exp: i32) -> f64 {
    if exp > 1023 {
        f64::INFINITY
    } else if exp >= -1022 {
        f64::from_bits(((exp + 1023) as u64) << 52)
    } else if exp >= -1074 {
        f64::from_bits(1u64 << (exp + 1074))
    } else {
        0.0
    }
}

// ── Reader ────────────────────────────────────────────────────────────────────

/// Cursor over CPON text that decodes one value at a time.
pub struct CponReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// Parses a single value from `data`; trailing non-whitespace is an error.
pub fn unpack(data: &str) -> Result<RpcValue, ParseError> {
    let mut reader = CponReader::new(data);
    let value = reader.read()?;
    reader.skip_insignificant()?;
    if reader.pos != reader.buf.len() {
        return Err(ParseError::TrailingData);
    }
    Ok(value)
}

impl<'a> CponReader<'a> {
    pub fn new(data: &'a str) -> Self {
        Self { buf: data.as_bytes(), pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.buf.get(self.pos).copied()
    }

    fn next_byte(&mut self) -> Result<u8, ParseError> {
        let b = self.peek().ok_or(ParseError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    fn expect(&mut self, token: &str) -> Result<(), ParseError> {
        for &want in token.as_bytes() {
            let got = self.next_byte()?;
            if got != want {
                return Err(ParseError::UnexpectedChar(got as char, self.pos - 1));
            }
        }
        Ok(())
    }

    /// Skips whitespace, the insignificant `,` and `:` separators and both
    /// comment styles. EOF while skipping is fine; the caller notices it on
    /// the next token.
    fn skip_insignificant(&mut self) -> Result<(), ParseError> {
        loop {
            match self.peek() {
                None => return Ok(()),
                Some(b) if b <= b' ' || b == b',' || b == b':' => {
                    self.pos += 1;
                }
                Some(b'/') => {
                    self.pos += 1;
                    match self.next_byte().map_err(|_| ParseError::MalformedComment)? {
                        b'*' => loop {
                            let b = self.next_byte().map_err(|_| ParseError::MalformedComment)?;
                            if b == b'*' && self.peek() == Some(b'/') {
                                self.pos += 1;
                                break;
                            }
                        },
                        b'/' => {
                            while let Some(b) = self.peek() {
                                self.pos += 1;
                                if b == b'\n' {
                                    break;
                                }
                            }
                        }
                        _ => return Err(ParseError::MalformedComment),
                    }
                }
                Some(_) => return Ok(()),
            }
        }
    }

    /// Decodes one complete value, meta included.
    pub fn read(&mut self) -> Result<RpcValue, ParseError> {
        self.read_depth(0)
    }

    fn read_depth(&mut self, depth: usize) -> Result<RpcValue, ParseError> {
        if depth > MAX_NESTING_DEPTH {
            return Err(ParseError::NestingTooDeep);
        }
        self.skip_insignificant()?;
        let mut meta = None;
        if self.peek() == Some(b'<') {
            self.pos += 1;
            meta = Some(self.read_meta(depth)?);
            self.skip_insignificant()?;
        }
        let value = self.read_value(depth)?;
        Ok(RpcValue::new(value, meta))
    }

    fn read_value(&mut self, depth: usize) -> Result<Value, ParseError> {
        let b = self.peek().ok_or(ParseError::UnexpectedEof)?;
        match b {
            b'0'..=b'9' | b'+' | b'-' => self.read_number(),
            b'"' => Ok(Value::String(self.read_quoted_string()?)),
            b'[' => {
                self.pos += 1;
                let mut items = Vec::new();
                loop {
                    self.skip_insignificant()?;
                    if self.peek() == Some(b']') {
                        self.pos += 1;
                        break;
                    }
                    items.push(self.read_depth(depth + 1)?);
                }
                Ok(Value::List(items))
            }
            b'{' => {
                let entries = self.read_map_entries(b'}', "Map", depth)?;
                let mut map = BTreeMap::new();
                for (key, val) in entries {
                    match key {
                        MetaKey::Str(k) => {
                            map.insert(k, val);
                        }
                        MetaKey::Int(_) => {
                            return Err(ParseError::InvalidKey { kind: "Map", got: "Int" })
                        }
                    }
                }
                Ok(Value::Map(map))
            }
            b'i' => {
                self.pos += 1;
                if self.peek() != Some(b'{') {
                    return Err(ParseError::UnexpectedChar('i', self.pos - 1));
                }
                let entries = self.read_map_entries(b'}', "IMap", depth)?;
                let mut map = BTreeMap::new();
                for (key, val) in entries {
                    match key {
                        MetaKey::Int(k) => {
                            map.insert(k, val);
                        }
                        MetaKey::Str(_) => {
                            return Err(ParseError::InvalidKey { kind: "IMap", got: "String" })
                        }
                    }
                }
                Ok(Value::IMap(map))
            }
            b'd' => {
                self.pos += 1;
                let raw = self.read_quoted_string()?;
                DateTime::parse_iso(&raw)
                    .map(Value::DateTime)
                    .map_err(|_| ParseError::MalformedDateTime(raw))
            }
            b'b' => {
                self.pos += 1;
                self.read_blob()
            }
            b'x' => {
                self.pos += 1;
                self.read_hex_blob()
            }
            b't' => {
                self.expect("true")?;
                Ok(Value::Bool(true))
            }
            b'f' => {
                self.expect("false")?;
                Ok(Value::Bool(false))
            }
            b'n' => {
                self.expect("null")?;
                Ok(Value::Null)
            }
            b'N' => {
                self.expect("NaN")?;
                Ok(Value::Double(f64::NAN))
            }
            b'I' => {
                self.expect("Inf")?;
                Ok(Value::Double(f64::INFINITY))
            }
            other => Err(ParseError::UnexpectedChar(other as char, self.pos)),
        }
    }

    fn read_meta(&mut self, depth: usize) -> Result<Meta, ParseError> {
        let mut meta = Meta::new();
        for (key, val) in self.read_map_entries_inner(b'>', "MetaMap", depth)? {
            meta.0.insert(key, val);
        }
        Ok(meta)
    }

    fn read_map_entries(
        &mut self,
        terminator: u8,
        kind: &'static str,
        depth: usize,
    ) -> Result<Vec<(MetaKey, RpcValue)>, ParseError> {
        self.pos += 1; // opening brace
        self.read_map_entries_inner(terminator, kind, depth)
    }

    fn read_map_entries_inner(
        &mut self,
        terminator: u8,
        kind: &'static str,
        depth: usize,
    ) -> Result<Vec<(MetaKey, RpcValue)>, ParseError> {
        let mut entries = Vec::new();
        loop {
            self.skip_insignificant()?;
            if self.peek() == Some(terminator) {
                self.pos += 1;
                return Ok(entries);
            }
            let key = match self.read_depth(depth + 1)?.into_value() {
                Value::Int(k) => MetaKey::Int(k),
                Value::UInt(k) => MetaKey::Int(k as i64),
                Value::String(k) => MetaKey::Str(k),
                other => return Err(ParseError::InvalidKey { kind, got: other.type_name() }),
            };
            let val = self.read_depth(depth + 1)?;
            entries.push((key, val));
        }
    }

    fn read_quoted_string(&mut self) -> Result<String, ParseError> {
        if self.next_byte()? != b'"' {
            return Err(ParseError::UnexpectedChar(self.buf[self.pos - 1] as char, self.pos - 1));
        }
        let mut raw = Vec::new();
        loop {
            match self.next_byte()? {
                b'"' => break,
                b'\\' => match self.next_byte()? {
                    b'\\' => raw.push(b'\\'),
                    b'b' => raw.push(8),
                    b'"' => raw.push(b'"'),
                    b'f' => raw.push(12),
                    b'n' => raw.push(b'\n'),
                    b'r' => raw.push(b'\r'),
                    b't' => raw.push(b'\t'),
                    b'0' => raw.push(0),
                    other => raw.push(other),
                },
                other => raw.push(other),
            }
        }
        String::from_utf8(raw).map_err(|_| ParseError::InvalidUtf8)
    }

    fn read_blob(&mut self) -> Result<Value, ParseError> {
        if self.next_byte()? != b'"' {
            return Err(ParseError::UnexpectedChar(self.buf[self.pos - 1] as char, self.pos - 1));
        }
        let mut res = Vec::new();
        loop {
            match self.next_byte()? {
                b'"' => break,
                b'\\' => match self.next_byte()? {
                    b'\\' => res.push(b'\\'),
                    b'"' => res.push(b'"'),
                    b'n' => res.push(b'\n'),
                    b'r' => res.push(b'\r'),
                    b't' => res.push(b'\t'),
                    hi => {
                        let lo = self.next_byte()?;
                        res.push(hex_pair(hi, lo).ok_or(ParseError::MalformedNumber(self.pos - 1))?);
                    }
                },
                other => res.push(other),
            }
        }
        Ok(Value::Bytes(res))
    }

    fn read_hex_blob(&mut self) -> Result<Value, ParseError> {
        if self.next_byte()? != b'"' {
            return Err(ParseError::UnexpectedChar(self.buf[self.pos - 1] as char, self.pos - 1));
        }
        let mut res = Vec::new();
        loop {
            let hi = self.next_byte()?;
            if hi == b'"' {
                break;
            }
            let lo = self.next_byte()?;
            res.push(hex_pair(hi, lo).ok_or(ParseError::MalformedNumber(self.pos - 1))?);
        }
        Ok(Value::Bytes(res))
    }

    fn read_number(&mut self) -> Result<Value, ParseError> {
        let start = self.pos;
        let err = || ParseError::MalformedNumber(start);

        let negative = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };

        // `Inf` may follow an explicit sign.
        if self.peek() == Some(b'I') {
            self.expect("Inf")?;
            return Ok(Value::Double(if negative { f64::NEG_INFINITY } else { f64::INFINITY }));
        }

        let mut radix = 10u32;
        let digits_start;
        if self.peek() == Some(b'0') {
            self.pos += 1;
            match self.peek() {
                Some(b'x') => {
                    self.pos += 1;
                    radix = 16;
                    digits_start = self.pos;
                }
                Some(b'b') => {
                    self.pos += 1;
                    radix = 2;
                    digits_start = self.pos;
                }
                _ => digits_start = self.pos - 1,
            }
        } else {
            digits_start = self.pos;
        }

        let digit_set: fn(u8) -> bool = match radix {
            16 => |b| b.is_ascii_hexdigit(),
            2 => |b| b == b'0' || b == b'1',
            _ => |b| b.is_ascii_digit(),
        };

        while self.peek().map(digit_set).unwrap_or(false) {
            self.pos += 1;
        }
        let int_end = self.pos;
        let mut frac_range = None;
        if self.peek() == Some(b'.') {
            self.pos += 1;
            let frac_start = self.pos;
            while self.peek().map(digit_set).unwrap_or(false) {
                self.pos += 1;
            }
            frac_range = Some((frac_start, self.pos));
        }
        if int_end == digits_start && frac_range.map(|(s, e)| s == e).unwrap_or(true) {
            return Err(err());
        }

        // `p` selects Double (power-of-two exponent), `e` selects Decimal.
        if radix != 2 && matches!(self.peek(), Some(b'p') | Some(b'P')) {
            self.pos += 1;
            let exp = self.read_exponent().ok_or_else(err)?;
            let int_str = std::str::from_utf8(&self.buf[digits_start..int_end]).expect("ascii");
            let frac_str = frac_range
                .map(|(s, e)| std::str::from_utf8(&self.buf[s..e]).expect("ascii"))
                .unwrap_or("");
            let value = if radix == 16 {
                let int_part = if int_str.is_empty() {
                    0
                } else {
                    u64::from_str_radix(int_str, 16).map_err(|_| err())?
                };
                let frac_part = if frac_str.is_empty() {
                    0
                } else {
                    u64::from_str_radix(frac_str, 16).map_err(|_| err())?
                };
                let frac_bits = 4 * frac_str.len() as i32;
                let mantissa = (u128::from(int_part) << frac_bits) | u128::from(frac_part);
                mantissa as f64 * pow2(exp - frac_bits)
            } else {
                let mantissa: f64 = format!("{int_str}.{frac_str}")
                    .trim_end_matches('.')
                    .parse()
                    .map_err(|_| err())?;
                mantissa * pow2(exp)
            };
            return Ok(Value::Double(if negative { -value } else { value }));
        }

        if radix == 10 && matches!(self.peek(), Some(b'e') | Some(b'E')) {
            self.pos += 1;
            let exp = self.read_exponent().ok_or_else(err)?;
            let dec = self.decimal_from_parts(digits_start, int_end, frac_range, negative, exp)?;
            return Ok(Value::Decimal(dec));
        }

        if let Some(frac) = frac_range {
            if radix != 10 {
                return Err(err());
            }
            let dec = self.decimal_from_parts(digits_start, int_end, Some(frac), negative, 0)?;
            return Ok(Value::Decimal(dec));
        }

        let digits = std::str::from_utf8(&self.buf[digits_start..int_end]).expect("ascii");
        if self.peek() == Some(b'u') {
            self.pos += 1;
            let v = u64::from_str_radix(digits, radix).map_err(|_| err())?;
            return Ok(Value::UInt(v));
        }
        let magnitude = u64::from_str_radix(digits, radix).map_err(|_| err())?;
        let v = if negative {
            if magnitude > i64::MAX as u64 + 1 {
                return Err(err());
            }
            (magnitude as i128).checked_neg().map(|m| m as i64).ok_or_else(err)?
        } else {
            i64::try_from(magnitude).map_err(|_| err())?
        };
        Ok(Value::Int(v))
    }

    fn read_exponent(&mut self) -> Option<i32> {
        let neg = match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                true
            }
            Some(b'+') => {
                self.pos += 1;
                false
            }
            _ => false,
        };
        let start = self.pos;
        while self.peek().map(|b| b.is_ascii_digit()).unwrap_or(false) {
            self.pos += 1;
        }
        if start == self.pos {
            return None;
        }
        let v: i32 = std::str::from_utf8(&self.buf[start..self.pos]).ok()?.parse().ok()?;
        Some(if neg { -v } else { v })
    }

    fn decimal_from_parts(
        &self,
        int_start: usize,
        int_end: usize,
        frac_range: Option<(usize, usize)>,
        negative: bool,
        extra_exp: i32,
    ) -> Result<Decimal, ParseError> {
        let mut mantissa: i64 = 0;
        let mut frac_len = 0i32;
        let int_digits = &self.buf[int_start..int_end];
        let frac_digits = frac_range.map(|(s, e)| &self.buf[s..e]).unwrap_or(&[]);
        for &d in int_digits.iter().chain(frac_digits) {
            let digit = (d - b'0') as i64;
            mantissa = mantissa
                .checked_mul(10)
                .and_then(|m| m.checked_add(digit))
                .ok_or(ParseError::MalformedNumber(int_start))?;
        }
        frac_len += frac_digits.len() as i32;
        if negative {
            mantissa = -mantissa;
        }
        Ok(Decimal::new(mantissa, extra_exp - frac_len))
    }
}

fn hex_pair(hi: u8, lo: u8) -> Option<u8> {
    let h = (hi as char).to_digit(16)?;
    let l = (lo as char).to_digit(16)?;
    Some((h * 16 + l) as u8)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chainpack;

    fn round_trip(value: RpcValue) -> RpcValue {
        let text = pack(&value);
        unpack(&text).unwrap_or_else(|e| panic!("decode of {text:?} failed: {e}"))
    }

    fn assert_round_trip(value: RpcValue) {
        assert_eq!(round_trip(value.clone()), value);
    }

    // ── Literals ──────────────────────────────────────────────────────────────

    #[test]
    fn test_scalar_literals() {
        assert_eq!(pack(&RpcValue::null()), "null");
        assert_eq!(pack(&RpcValue::from(true)), "true");
        assert_eq!(pack(&RpcValue::from(false)), "false");
        assert_eq!(pack(&RpcValue::from(-12i64)), "-12");
        assert_eq!(pack(&RpcValue::from(12u64)), "12u");
    }

    #[test]
    fn test_double_writes_hex_mantissa() {
        assert_eq!(pack(&RpcValue::from(3.0f64)), "0x1.8p+1");
        assert_eq!(pack(&RpcValue::from(0.0f64)), "0x0.p+0");
        assert_eq!(pack(&RpcValue::from(-2.0f64)), "-0x1.p+1");
    }

    #[test]
    fn test_decimal_literal_forms() {
        assert_eq!(pack(&RpcValue::from(Decimal::new(230, -2))), "2.30");
        assert_eq!(pack(&RpcValue::from(Decimal::new(123, 0))), "123.");
        assert_eq!(unpack("12e-1").unwrap(), RpcValue::from(Decimal::new(12, -1)));
        assert_eq!(unpack("-0.5").unwrap(), RpcValue::from(Decimal::new(-5, -1)));
    }

    #[test]
    fn test_hex_and_binary_int_literals() {
        assert_eq!(unpack("0x1f").unwrap(), RpcValue::from(31i64));
        assert_eq!(unpack("0b101").unwrap(), RpcValue::from(5i64));
        assert_eq!(unpack("0xffu").unwrap(), RpcValue::from(255u64));
        assert_eq!(unpack("-0x10").unwrap(), RpcValue::from(-16i64));
    }

    #[test]
    fn test_string_escapes() {
        let v = RpcValue::from("a\"b\\c\n\t\0");
        let text = pack(&v);
        assert_eq!(text, r#""a\"b\\c\n\t\0""#);
        assert_eq!(unpack(&text).unwrap(), v);
    }

    #[test]
    fn test_utf8_passthrough() {
        assert_round_trip(RpcValue::from("kočka 🐈"));
    }

    #[test]
    fn test_blob_escapes_and_hex_form() {
        let v = RpcValue::from(vec![b'a', 0x00, 0xff, b'"']);
        let text = pack(&v);
        assert_eq!(text, r#"b"a\00\ff\"""#);
        assert_eq!(unpack(&text).unwrap(), v);
        // The x"…" form decodes to the same bytes.
        assert_eq!(unpack(r#"x"6100ff22""#).unwrap(), v);
    }

    #[test]
    fn test_datetime_literal() {
        let v = unpack(r#"d"2018-02-02T00:00:00Z""#).unwrap();
        assert_eq!(v.as_datetime().unwrap().epoch_msec(), chainpack::SHV_EPOCH_MSEC);
        assert_round_trip(v);
    }

    // ── Containers and meta ───────────────────────────────────────────────────

    #[test]
    fn test_list_and_map_forms() {
        assert_eq!(pack(&unpack("[1,2,3]").unwrap()), "[1,2,3]");
        assert_eq!(pack(&unpack(r#"{"a":1,"b":2}"#).unwrap()), r#"{"a":1,"b":2}"#);
        assert_eq!(pack(&unpack("i{1:2}").unwrap()), "i{1:2}");
    }

    #[test]
    fn test_empty_braces_decode_as_map() {
        assert_eq!(unpack("{}").unwrap(), RpcValue::from(BTreeMap::<String, RpcValue>::new()));
        assert_eq!(unpack("i{}").unwrap(), RpcValue::from(BTreeMap::<i64, RpcValue>::new()));
    }

    #[test]
    fn test_meta_prefix() {
        let v = unpack("<1:2>[3,{\"a\":false}]").unwrap();
        let meta = v.meta().expect("meta present");
        assert_eq!(meta.get_int(1).and_then(RpcValue::as_int), Some(2));
        let items = v.as_list().unwrap();
        assert_eq!(items[0], RpcValue::from(3i64));
        assert_eq!(
            items[1].as_map().unwrap().get("a").and_then(RpcValue::as_bool),
            Some(false)
        );
        assert_round_trip(v);
    }

    #[test]
    fn test_meta_mixed_keys_write_ints_first() {
        let mut v = RpcValue::from(1i64);
        v.meta_mut().insert("tag", "x");
        v.meta_mut().insert(1i64, 2i64);
        assert_eq!(pack(&v), r#"<1:2,"tag":"x">1"#);
    }

    #[test]
    fn test_whitespace_and_separators_are_insignificant() {
        let v = unpack(" [ 1 , 2\n\t3 ] ").unwrap();
        assert_eq!(v, unpack("[1,2,3]").unwrap());
    }

    #[test]
    fn test_comments_are_skipped() {
        let v = unpack("[1, /* two */ 2, // trailing\n 3]").unwrap();
        assert_eq!(v, unpack("[1,2,3]").unwrap());
    }

    #[test]
    fn test_pretty_printing_indents_containers() {
        let v = unpack(r#"{"a":[1]}"#).unwrap();
        assert_eq!(pack_pretty(&v, "  "), "{\n  \"a\":[\n    1\n  ]\n}");
    }

    // ── Round trips with the binary codec ─────────────────────────────────────

    #[test]
    fn test_cross_codec_agreement() {
        for text in [
            "null",
            "[1,-2,3u]",
            r#"{"a":false,"b":[null]}"#,
            "i{1:2,3:\"x\"}",
            "<1:2>[3,{\"a\":false}]",
            "2.30",
            r#"d"2017-05-03T11:30:00Z""#,
        ] {
            let from_cpon = unpack(text).unwrap();
            let bin = chainpack::pack(&from_cpon);
            let from_cp = chainpack::unpack(&bin).unwrap();
            assert_eq!(from_cpon, from_cp, "codecs disagree for {text}");
        }
    }

    #[test]
    fn test_double_round_trip_is_bit_exact() {
        for v in [0.1f64, 1.0 / 3.0, -1e300, 5e-324, f64::MIN_POSITIVE, 0.0, -0.0] {
            let text = pack(&RpcValue::from(v));
            let back = unpack(&text).unwrap();
            match back.value() {
                Value::Double(b) => assert_eq!(b.to_bits(), v.to_bits(), "bits differ for {text}"),
                other => panic!("expected double, got {}", other.type_name()),
            }
        }
    }

    #[test]
    fn test_nonfinite_doubles() {
        assert_round_trip(RpcValue::from(f64::NAN));
        assert_round_trip(RpcValue::from(f64::INFINITY));
        assert_round_trip(RpcValue::from(f64::NEG_INFINITY));
    }

    // ── Errors ────────────────────────────────────────────────────────────────

    #[test]
    fn test_unterminated_string_reports_eof() {
        assert_eq!(unpack(r#""abc"#), Err(ParseError::UnexpectedEof));
    }

    #[test]
    fn test_trailing_garbage_is_rejected() {
        assert_eq!(unpack("1 2"), Err(ParseError::TrailingData));
    }

    #[test]
    fn test_unclosed_comment_is_malformed() {
        assert_eq!(unpack("/* forever 1"), Err(ParseError::MalformedComment));
    }

    #[test]
    fn test_imap_with_string_key_is_rejected() {
        assert!(matches!(
            unpack(r#"i{"a":1}"#),
            Err(ParseError::InvalidKey { kind: "IMap", .. })
        ));
    }

    #[test]
    fn test_bad_datetime_is_rejected() {
        assert!(matches!(unpack(r#"d"not-a-date""#), Err(ParseError::MalformedDateTime(_))));
    }
}
