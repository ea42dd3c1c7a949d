//! The SHV value model.
//!
//! Every value exchanged over SHV RPC is one of the variants of [`Value`].
//! A value can additionally carry a [`Meta`] side-car with integer and string
//! keyed attributes; [`RpcValue`] pairs the two. Meta is optional storage and
//! an empty meta is indistinguishable from an absent one (it is normalized
//! away on attach).
//!
//! Equality is structural and includes meta. Doubles are compared through
//! their bit patterns so that codec round-trips are exact and `NaN` values
//! stay equal to themselves. There are no implicit numeric coercions:
//! a [`Decimal`] never equals a [`Value::Double`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{FixedOffset, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Errors produced when constructing values from external data.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValueError {
    /// UTC offset that is out of range or not on a quarter-hour boundary.
    #[error("invalid UTC offset: {0} minutes")]
    InvalidUtcOffset(i32),

    /// A date-time string that does not follow the ISO-8601 subset SHV uses.
    #[error("malformed date-time: {0}")]
    MalformedDateTime(String),

    /// A decimal literal that cannot be represented as mantissa + exponent.
    #[error("malformed decimal: {0}")]
    MalformedDecimal(String),
}

// ── Decimal ───────────────────────────────────────────────────────────────────

/// Decimal number represented exactly as `mantissa * 10^exponent`.
///
/// The representation is not normalized: `(230, -2)` and `(23, -1)` are
/// different values even though they denote the same quantity. This mirrors
/// the wire format, where both encodings are distinct and must round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Decimal {
    pub mantissa: i64,
    pub exponent: i32,
}

impl Decimal {
    pub fn new(mantissa: i64, exponent: i32) -> Self {
        Self { mantissa, exponent }
    }

    /// Parses the CPON textual form: `123.`, `1.23`, `-0.005`, `12e-1`.
    pub fn parse(s: &str) -> Result<Self, ValueError> {
        let err = || ValueError::MalformedDecimal(s.to_string());
        let (sign, rest) = match s.as_bytes().first() {
            Some(b'-') => (-1i64, &s[1..]),
            Some(b'+') => (1, &s[1..]),
            _ => (1, s),
        };
        let (mant_str, exp_str) = match rest.find(['e', 'E']) {
            Some(pos) => (&rest[..pos], Some(&rest[pos + 1..])),
            None => (rest, None),
        };
        let (int_part, frac_part) = match mant_str.find('.') {
            Some(pos) => (&mant_str[..pos], &mant_str[pos + 1..]),
            None => (mant_str, ""),
        };
        if int_part.is_empty() && frac_part.is_empty() {
            return Err(err());
        }
        let mut mantissa: i64 = 0;
        for c in int_part.chars().chain(frac_part.chars()) {
            let d = c.to_digit(10).ok_or_else(err)? as i64;
            mantissa = mantissa.checked_mul(10).and_then(|m| m.checked_add(d)).ok_or_else(err)?;
        }
        let mut exponent = -(frac_part.len() as i32);
        if let Some(e) = exp_str {
            exponent += e.parse::<i32>().map_err(|_| err())?;
        }
        Ok(Self { mantissa: sign * mantissa, exponent })
    }
}

impl fmt::Display for Decimal {
    /// Formats in the canonical CPON form, chosen so that parsing the output
    /// reproduces the exact mantissa and exponent.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let neg = self.mantissa < 0;
        let digits = self.mantissa.unsigned_abs().to_string();
        let sign = if neg { "-" } else { "" };
        if self.exponent == 0 {
            write!(f, "{sign}{digits}.")
        } else if self.exponent > 0 {
            write!(f, "{sign}{digits}e{}", self.exponent)
        } else {
            let frac_len = self.exponent.unsigned_abs() as usize;
            if frac_len < digits.len() {
                let split = digits.len() - frac_len;
                write!(f, "{sign}{}.{}", &digits[..split], &digits[split..])
            } else {
                write!(f, "{sign}0.{}{}", "0".repeat(frac_len - digits.len()), digits)
            }
        }
    }
}

// ── DateTime ──────────────────────────────────────────────────────────────────

/// Absolute instant with millisecond precision and an attached UTC offset.
///
/// The offset is informational (the instant is absolute) and restricted to
/// quarter-hour steps in the range the wire format can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DateTime {
    epoch_msec: i64,
    utc_offset_min: i16,
}

/// Largest UTC offset representable on the wire: 63 quarter-hours.
const MAX_UTC_OFFSET_MIN: i32 = 63 * 15;

/// Instants are kept within a range every calendar backend can format,
/// roughly ±250 000 years around the Unix epoch.
const MAX_EPOCH_MSEC: i64 = 8_000_000_000_000_000;

impl DateTime {
    /// Creates a date-time from milliseconds since the Unix epoch and a UTC
    /// offset in minutes.
    pub fn from_epoch_msec_tz(epoch_msec: i64, utc_offset_min: i32) -> Result<Self, ValueError> {
        if utc_offset_min % 15 != 0 || !(-MAX_UTC_OFFSET_MIN..=MAX_UTC_OFFSET_MIN).contains(&utc_offset_min) {
            return Err(ValueError::InvalidUtcOffset(utc_offset_min));
        }
        if epoch_msec.unsigned_abs() > MAX_EPOCH_MSEC as u64 {
            return Err(ValueError::MalformedDateTime(format!("{epoch_msec} msec")));
        }
        Ok(Self { epoch_msec, utc_offset_min: utc_offset_min as i16 })
    }

    pub fn from_epoch_msec(epoch_msec: i64) -> Self {
        Self { epoch_msec: epoch_msec.clamp(-MAX_EPOCH_MSEC, MAX_EPOCH_MSEC), utc_offset_min: 0 }
    }

    /// The current instant in UTC.
    pub fn now() -> Self {
        Self::from_epoch_msec(Utc::now().timestamp_millis())
    }

    pub fn epoch_msec(&self) -> i64 {
        self.epoch_msec
    }

    pub fn utc_offset_min(&self) -> i32 {
        self.utc_offset_min as i32
    }

    /// Parses the ISO-8601 subset used by CPON:
    /// `YYYY-MM-DDThh:mm:ss[.fff][Z|±hh|±hh:mm|±hhmm]`.
    pub fn parse_iso(s: &str) -> Result<Self, ValueError> {
        let err = || ValueError::MalformedDateTime(s.to_string());
        // Split the trailing offset designator, if any. The date part always
        // occupies at least 19 characters, so '+'/'-' before that belongs to
        // the date itself.
        let (dt_part, offset_min) = if let Some(rest) = s.strip_suffix('Z') {
            (rest, 0i32)
        } else if s.len() > 19 {
            match s[19..].find(['+', '-']) {
                Some(pos) => {
                    let (dt, off) = s.split_at(19 + pos);
                    (dt, parse_utc_offset(off).ok_or_else(err)?)
                }
                None => (s, 0),
            }
        } else {
            (s, 0)
        };
        let naive = NaiveDateTime::parse_from_str(dt_part, "%Y-%m-%dT%H:%M:%S%.f")
            .map_err(|_| err())?;
        let epoch_msec = naive.and_utc().timestamp_millis() - i64::from(offset_min) * 60_000;
        Self::from_epoch_msec_tz(epoch_msec, offset_min)
    }

    /// Formats in the compact CPON form. Milliseconds are written only when
    /// non-zero; a zero offset is written as `Z` and offset minutes are left
    /// out when they are zero.
    pub fn to_iso_string(&self) -> String {
        let offset = FixedOffset::east_opt(self.utc_offset_min() * 60)
            .expect("offset range checked at construction");
        let local = offset
            .timestamp_millis_opt(self.epoch_msec)
            .single()
            .expect("instant range checked at construction");
        let mut res = if self.epoch_msec % 1000 == 0 {
            local.format("%Y-%m-%dT%H:%M:%S").to_string()
        } else {
            local.format("%Y-%m-%dT%H:%M:%S%.3f").to_string()
        };
        if self.utc_offset_min == 0 {
            res.push('Z');
        } else {
            let (sign, abs) = if self.utc_offset_min < 0 { ('-', -self.utc_offset_min) } else { ('+', self.utc_offset_min) };
            res.push(sign);
            res.push_str(&format!("{:02}", abs / 60));
            if abs % 60 != 0 {
                res.push_str(&format!("{:02}", abs % 60));
            }
        }
        res
    }
}

fn parse_utc_offset(s: &str) -> Option<i32> {
    let (sign, digits) = match s.as_bytes().first()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    let digits = digits.replace(':', "");
    let min = match digits.len() {
        2 => digits.parse::<i32>().ok()? * 60,
        4 => digits[..2].parse::<i32>().ok()? * 60 + digits[2..].parse::<i32>().ok()?,
        _ => return None,
    };
    Some(sign * min)
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso_string())
    }
}

// ── Meta ──────────────────────────────────────────────────────────────────────

/// Key of a [`Meta`] entry. Meta maps mix integer and string keys; integer
/// keys order before string keys, each group sorted.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MetaKey {
    Int(i64),
    Str(String),
}

impl From<i64> for MetaKey {
    fn from(v: i64) -> Self {
        MetaKey::Int(v)
    }
}

impl From<&str> for MetaKey {
    fn from(v: &str) -> Self {
        MetaKey::Str(v.to_string())
    }
}

/// Attribute map attached to a value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Meta(pub BTreeMap<MetaKey, RpcValue>);

impl Meta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get_int(&self, key: i64) -> Option<&RpcValue> {
        self.0.get(&MetaKey::Int(key))
    }

    pub fn get_str(&self, key: &str) -> Option<&RpcValue> {
        self.0.get(&MetaKey::Str(key.to_string()))
    }

    pub fn insert(&mut self, key: impl Into<MetaKey>, value: impl Into<RpcValue>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &MetaKey) -> Option<RpcValue> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetaKey, &RpcValue)> {
        self.0.iter()
    }
}

// ── Value ─────────────────────────────────────────────────────────────────────

/// One SHV value without its meta. Containers hold [`RpcValue`] so that every
/// element can carry meta of its own.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Double(f64),
    Decimal(Decimal),
    Bytes(Vec<u8>),
    String(String),
    DateTime(DateTime),
    List(Vec<RpcValue>),
    Map(BTreeMap<String, RpcValue>),
    IMap(BTreeMap<i64, RpcValue>),
}

impl Value {
    /// Human-readable variant name, used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "Null",
            Value::Bool(_) => "Bool",
            Value::Int(_) => "Int",
            Value::UInt(_) => "UInt",
            Value::Double(_) => "Double",
            Value::Decimal(_) => "Decimal",
            Value::Bytes(_) => "Bytes",
            Value::String(_) => "String",
            Value::DateTime(_) => "DateTime",
            Value::List(_) => "List",
            Value::Map(_) => "Map",
            Value::IMap(_) => "IMap",
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        use Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int(a), Int(b)) => a == b,
            (UInt(a), UInt(b)) => a == b,
            // Bitwise so NaN == NaN and -0.0 != 0.0; round-trips stay exact.
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Decimal(a), Decimal(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (String(a), String(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            (List(a), List(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            (IMap(a), IMap(b)) => a == b,
            _ => false,
        }
    }
}

// ── RpcValue ──────────────────────────────────────────────────────────────────

/// A [`Value`] together with its optional [`Meta`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcValue {
    meta: Option<Box<Meta>>,
    value: Value,
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}

impl RpcValue {
    pub fn new(value: Value, meta: Option<Meta>) -> Self {
        Self {
            meta: meta.filter(|m| !m.is_empty()).map(Box::new),
            value,
        }
    }

    pub fn null() -> Self {
        Value::Null.into()
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }

    pub fn meta(&self) -> Option<&Meta> {
        self.meta.as_deref()
    }

    pub fn meta_mut(&mut self) -> &mut Meta {
        self.meta.get_or_insert_with(Default::default).as_mut()
    }

    /// Attaches meta; an empty meta clears the side-car entirely.
    pub fn set_meta(&mut self, meta: Meta) {
        self.meta = if meta.is_empty() { None } else { Some(Box::new(meta)) };
    }

    /// Removes and returns the meta side-car.
    pub fn take_meta(&mut self) -> Option<Meta> {
        self.meta.take().map(|m| *m)
    }

    pub fn with_meta(mut self, meta: Meta) -> Self {
        self.set_meta(meta);
        self
    }

    // Accessors are cheap and total, returning Option instead of panicking.

    pub fn is_null(&self) -> bool {
        matches!(self.value, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self.value {
            Value::Bool(v) => Some(v),
            _ => None,
        }
    }

    /// Signed view of an integer value; UInt converts when it fits.
    pub fn as_int(&self) -> Option<i64> {
        match self.value {
            Value::Int(v) => Some(v),
            Value::UInt(v) => i64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self.value {
            Value::UInt(v) => Some(v),
            Value::Int(v) => u64::try_from(v).ok(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match &self.value {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[RpcValue]> {
        match &self.value {
            Value::List(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, RpcValue>> {
        match &self.value {
            Value::Map(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_imap(&self) -> Option<&BTreeMap<i64, RpcValue>> {
        match &self.value {
            Value::IMap(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<DateTime> {
        match self.value {
            Value::DateTime(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_decimal(&self) -> Option<Decimal> {
        match self.value {
            Value::Decimal(v) => Some(v),
            _ => None,
        }
    }
}

impl From<Value> for RpcValue {
    fn from(value: Value) -> Self {
        Self { meta: None, value }
    }
}

macro_rules! impl_from {
    ($($ty:ty => $variant:expr),+ $(,)?) => {
        $(impl From<$ty> for RpcValue {
            fn from(v: $ty) -> Self {
                RpcValue::from($variant(v))
            }
        })+
    };
}

impl_from! {
    bool => Value::Bool,
    i64 => Value::Int,
    u64 => Value::UInt,
    f64 => Value::Double,
    Decimal => Value::Decimal,
    Vec<u8> => Value::Bytes,
    String => Value::String,
    DateTime => Value::DateTime,
    Vec<RpcValue> => Value::List,
    BTreeMap<String, RpcValue> => Value::Map,
    BTreeMap<i64, RpcValue> => Value::IMap,
}

impl From<i32> for RpcValue {
    fn from(v: i32) -> Self {
        Value::Int(v as i64).into()
    }
}

impl From<u32> for RpcValue {
    fn from(v: u32) -> Self {
        Value::UInt(v as u64).into()
    }
}

impl From<&str> for RpcValue {
    fn from(v: &str) -> Self {
        Value::String(v.to_string()).into()
    }
}

impl From<()> for RpcValue {
    fn from(_: ()) -> Self {
        Value::Null.into()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Decimal formatting / parsing ──────────────────────────────────────────

    #[test]
    fn test_decimal_zero_exponent_formats_with_trailing_dot() {
        assert_eq!(Decimal::new(123, 0).to_string(), "123.");
    }

    #[test]
    fn test_decimal_negative_exponent_inserts_point() {
        assert_eq!(Decimal::new(230, -2).to_string(), "2.30");
    }

    #[test]
    fn test_decimal_small_magnitude_pads_with_zeros() {
        assert_eq!(Decimal::new(5, -3).to_string(), "0.005");
        assert_eq!(Decimal::new(-5, -3).to_string(), "-0.005");
    }

    #[test]
    fn test_decimal_positive_exponent_uses_e_notation() {
        assert_eq!(Decimal::new(42, 3).to_string(), "42e3");
    }

    #[test]
    fn test_decimal_parse_round_trip_preserves_representation() {
        for d in [
            Decimal::new(123, 0),
            Decimal::new(230, -2),
            Decimal::new(5, -3),
            Decimal::new(-5, -3),
            Decimal::new(42, 3),
            Decimal::new(0, 0),
        ] {
            let parsed = Decimal::parse(&d.to_string()).unwrap();
            assert_eq!(parsed, d, "round trip of {d}");
        }
    }

    #[test]
    fn test_decimal_parse_rejects_garbage() {
        assert!(Decimal::parse("abc").is_err());
        assert!(Decimal::parse(".").is_err());
        assert!(Decimal::parse("").is_err());
    }

    // ── DateTime ──────────────────────────────────────────────────────────────

    #[test]
    fn test_datetime_iso_round_trip_utc() {
        let dt = DateTime::parse_iso("2022-01-02T12:30:00Z").unwrap();
        assert_eq!(dt.utc_offset_min(), 0);
        assert_eq!(dt.to_iso_string(), "2022-01-02T12:30:00Z");
    }

    #[test]
    fn test_datetime_iso_round_trip_with_millis_and_offset() {
        let dt = DateTime::parse_iso("2022-01-02T12:30:00.250+01:00").unwrap();
        assert_eq!(dt.utc_offset_min(), 60);
        assert_eq!(dt.to_iso_string(), "2022-01-02T12:30:00.250+01");
    }

    #[test]
    fn test_datetime_offset_with_minutes_keeps_minutes() {
        let dt = DateTime::parse_iso("2022-01-02T12:30:00+05:45").unwrap();
        assert_eq!(dt.utc_offset_min(), 5 * 60 + 45);
        assert_eq!(dt.to_iso_string(), "2022-01-02T12:30:00+0545");
    }

    #[test]
    fn test_datetime_pre_shv_epoch_parses() {
        // Predates 2018-02-02, the ChainPack epoch.
        let dt = DateTime::parse_iso("2017-05-03T11:30:00Z").unwrap();
        assert!(dt.epoch_msec() < 1_517_529_600_000);
        assert_eq!(dt.to_iso_string(), "2017-05-03T11:30:00Z");
    }

    #[test]
    fn test_datetime_offset_applied_to_instant() {
        let utc = DateTime::parse_iso("2022-01-02T11:30:00Z").unwrap();
        let local = DateTime::parse_iso("2022-01-02T12:30:00+01:00").unwrap();
        assert_eq!(utc.epoch_msec(), local.epoch_msec());
    }

    #[test]
    fn test_datetime_rejects_non_quarter_hour_offset() {
        assert_eq!(
            DateTime::from_epoch_msec_tz(0, 7),
            Err(ValueError::InvalidUtcOffset(7))
        );
    }

    // ── Meta and equality ─────────────────────────────────────────────────────

    #[test]
    fn test_empty_meta_is_normalized_to_absent() {
        let mut v = RpcValue::from(1i64);
        v.set_meta(Meta::new());
        assert!(v.meta().is_none());
        assert_eq!(v, RpcValue::from(1i64));
    }

    #[test]
    fn test_meta_participates_in_equality() {
        let plain = RpcValue::from(1i64);
        let mut tagged = RpcValue::from(1i64);
        tagged.meta_mut().insert(1i64, 2i64);
        assert_ne!(plain, tagged);
    }

    #[test]
    fn test_meta_int_keys_order_before_string_keys() {
        let mut meta = Meta::new();
        meta.insert("zzz", 1i64);
        meta.insert(8i64, 2i64);
        meta.insert("aaa", 3i64);
        meta.insert(1i64, 4i64);
        let keys: Vec<_> = meta.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(
            keys,
            vec![
                MetaKey::Int(1),
                MetaKey::Int(8),
                MetaKey::Str("aaa".into()),
                MetaKey::Str("zzz".into()),
            ]
        );
    }

    #[test]
    fn test_decimal_never_equals_double() {
        let dec = RpcValue::from(Decimal::new(10, -1));
        let dbl = RpcValue::from(1.0f64);
        assert_ne!(dec, dbl);
    }

    #[test]
    fn test_double_nan_equals_itself() {
        assert_eq!(RpcValue::from(f64::NAN), RpcValue::from(f64::NAN));
    }

    #[test]
    fn test_take_meta_clears_sidecar() {
        let mut v = RpcValue::from("x");
        v.meta_mut().insert(1i64, 1i64);
        let meta = v.take_meta().unwrap();
        assert!(meta.get_int(1).is_some());
        assert!(v.meta().is_none());
    }
}
