//! The RPC message layer: interprets a decoded [`RpcValue`] as a request,
//! response or signal.
//!
//! An RPC message is an IMap whose meta carries the identity fields:
//!
//! | tag | meaning                                    |
//! |-----|--------------------------------------------|
//! | 1   | meta type id, always 1                     |
//! | 8   | request id (requests and responses)        |
//! | 9   | SHV path                                   |
//! | 10  | method name (requests and signals)         |
//! | 11  | signal name (signals only, default `chng`) |
//! | 14  | caller ids, stacked by brokers             |
//! | 17  | granted access level                       |
//! | 18  | user id                                    |
//! | 19  | access string (legacy compatibility)       |
//!
//! The body carries `1: param`, `2: result` or `3: error`, at most one of
//! them; an error is an IMap `{1: code, 2: message}`.

use std::fmt;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::access::AccessLevel;
use crate::chainpack;
use crate::value::{MetaKey, RpcValue, Value};

/// Meta tags of an RPC message.
pub mod tag {
    pub const META_TYPE_ID: i64 = 1;
    pub const REQUEST_ID: i64 = 8;
    pub const SHV_PATH: i64 = 9;
    pub const METHOD: i64 = 10;
    pub const SIGNAL: i64 = 11;
    pub const CALLER_IDS: i64 = 14;
    pub const ACCESS_LEVEL: i64 = 17;
    pub const USER_ID: i64 = 18;
    pub const ACCESS: i64 = 19;
}

/// Body keys of an RPC message.
pub mod key {
    pub const PARAM: i64 = 1;
    pub const RESULT: i64 = 2;
    pub const ERROR: i64 = 3;
}

/// Default signal name when tag 11 is absent.
pub const DEFAULT_SIGNAL: &str = "chng";

// ── Errors ────────────────────────────────────────────────────────────────────

/// SHV RPC error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum RpcErrorCode {
    InvalidRequest = 1,
    MethodNotFound = 2,
    InvalidParam = 3,
    MethodCallException = 5,
    LoginRequired = 6,
    UserIdRequired = 7,
    NotImplemented = 8,
    TryAgainLater = 9,
    RequestInvalid = 10,
}

/// Method-level error carried in an error response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("rpc error {code}: {message}")]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

impl RpcError {
    pub fn new(code: RpcErrorCode, message: impl Into<String>) -> Self {
        Self { code: code as i64, message: message.into() }
    }

    pub fn method_not_found(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MethodNotFound, message)
    }

    pub fn invalid_param(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::InvalidParam, message)
    }

    pub fn method_call_exception(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::MethodCallException, message)
    }

    pub fn login_required(message: impl Into<String>) -> Self {
        Self::new(RpcErrorCode::LoginRequired, message)
    }

    pub fn to_value(&self) -> RpcValue {
        let mut imap = std::collections::BTreeMap::new();
        imap.insert(1i64, RpcValue::from(self.code));
        if !self.message.is_empty() {
            imap.insert(2i64, RpcValue::from(self.message.as_str()));
        }
        RpcValue::from(imap)
    }

    pub fn from_value(value: &RpcValue) -> Option<Self> {
        let imap = value.as_imap()?;
        let code = imap.get(&1)?.as_int()?;
        let message = imap
            .get(&2)
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string();
        Some(Self { code, message })
    }
}

/// Violations of the message invariants; such messages are dropped with a
/// log event by the broker, never surfaced to the other peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    #[error("message does not decode as ChainPack")]
    Undecodable,

    #[error("message body is {0}, not an IMap")]
    BodyNotImap(&'static str),

    #[error("unsupported meta type id")]
    UnsupportedMetaType,

    #[error("message carries more than one body key")]
    AmbiguousBody,

    #[error("message carries unknown body key {0}")]
    UnknownBodyKey(i64),

    #[error("response without request id")]
    MissingRequestId,

    #[error("signal without method name")]
    MissingMethod,

    #[error("malformed {0} field")]
    MalformedField(&'static str),
}

// ── Request id generation ─────────────────────────────────────────────────────

/// Request id source: a counter that restarts every fifteen minutes, so ids
/// stay small on the wire while never repeating within the lifetime of an
/// in-flight call.
#[derive(Debug)]
pub struct RequestIdGenerator {
    last: i64,
    window_start: Instant,
    window: Duration,
}

impl RequestIdGenerator {
    pub const WINDOW: Duration = Duration::from_secs(15 * 60);

    pub fn new() -> Self {
        Self::with_window(Self::WINDOW)
    }

    pub fn with_window(window: Duration) -> Self {
        Self { last: 0, window_start: Instant::now(), window }
    }

    pub fn next(&mut self) -> i64 {
        if self.window_start.elapsed() > self.window {
            self.last = 0;
            self.window_start = Instant::now();
        }
        self.last += 1;
        self.last
    }
}

impl Default for RequestIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide request id, used when a message is created without one.
pub fn next_request_id() -> i64 {
    static GENERATOR: OnceLock<Mutex<RequestIdGenerator>> = OnceLock::new();
    let mut lock = GENERATOR
        .get_or_init(|| Mutex::new(RequestIdGenerator::new()))
        .lock()
        .expect("request id generator poisoned");
    lock.next()
}

// ── Message ───────────────────────────────────────────────────────────────────

/// Message kind derived from the identity fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcMessageType {
    Request,
    Response,
    Signal,
}

/// A typed view over an [`RpcValue`] holding one SHV RPC message.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcMessage(RpcValue);

impl RpcMessage {
    /// Creates an empty message shell with the ChainPack meta type stamp.
    fn empty() -> Self {
        let mut value = RpcValue::from(std::collections::BTreeMap::<i64, RpcValue>::new());
        value.meta_mut().insert(tag::META_TYPE_ID, 1i64);
        Self(value)
    }

    /// New request with a process-wide unique request id.
    pub fn request(path: &str, method: &str, param: Option<RpcValue>) -> Self {
        Self::request_with_id(next_request_id(), path, method, param)
    }

    pub fn request_with_id(rqid: i64, path: &str, method: &str, param: Option<RpcValue>) -> Self {
        let mut msg = Self::empty();
        msg.set_request_id(Some(rqid));
        msg.set_path(path);
        msg.set_method(Some(method));
        msg.set_param(param);
        msg
    }

    /// New signal; `method` is the source method the signal belongs to.
    pub fn signal(path: &str, method: &str, signal: &str, param: Option<RpcValue>, access: AccessLevel) -> Self {
        let mut msg = Self::empty();
        msg.set_path(path);
        msg.set_method(Some(method));
        if signal != DEFAULT_SIGNAL {
            msg.set_meta_str(tag::SIGNAL, Some(signal));
        }
        msg.set_param(param);
        msg.set_access_level(Some(access));
        msg
    }

    /// Validates the invariants and wraps the raw value.
    pub fn from_value(value: RpcValue) -> Result<Self, MessageError> {
        let msg = Self(value);
        msg.classify()?;
        Ok(msg)
    }

    pub fn from_chainpack(data: &[u8]) -> Result<Self, MessageError> {
        let value = chainpack::unpack(data).map_err(|_| MessageError::Undecodable)?;
        Self::from_value(value)
    }

    pub fn to_chainpack(&self) -> Vec<u8> {
        chainpack::pack(&self.0)
    }

    pub fn as_value(&self) -> &RpcValue {
        &self.0
    }

    pub fn into_value(self) -> RpcValue {
        self.0
    }

    /// Derives the message type, checking every §3 invariant on the way.
    pub fn classify(&self) -> Result<RpcMessageType, MessageError> {
        let body = match self.0.value() {
            Value::IMap(m) => m,
            other => return Err(MessageError::BodyNotImap(other.type_name())),
        };
        if let Some(mt) = self.meta_int(tag::META_TYPE_ID) {
            if mt != 1 {
                return Err(MessageError::UnsupportedMetaType);
            }
        }
        if body.len() > 1 {
            return Err(MessageError::AmbiguousBody);
        }
        if let Some(k) = body.keys().find(|k| ![key::PARAM, key::RESULT, key::ERROR].contains(*k)) {
            return Err(MessageError::UnknownBodyKey(*k));
        }
        let has_rqid = self.request_id().is_some();
        let has_method = self.method().is_some();
        match (has_rqid, has_method) {
            (true, true) => {
                if body.contains_key(&key::RESULT) || body.contains_key(&key::ERROR) {
                    return Err(MessageError::AmbiguousBody);
                }
                Ok(RpcMessageType::Request)
            }
            (true, false) => {
                if body.contains_key(&key::PARAM) {
                    return Err(MessageError::AmbiguousBody);
                }
                Ok(RpcMessageType::Response)
            }
            (false, true) => {
                if body.contains_key(&key::RESULT) || body.contains_key(&key::ERROR) {
                    return Err(MessageError::AmbiguousBody);
                }
                Ok(RpcMessageType::Signal)
            }
            (false, false) => Err(MessageError::MissingMethod),
        }
    }

    // ── Meta field access ─────────────────────────────────────────────────────

    fn meta_int(&self, tag: i64) -> Option<i64> {
        self.0.meta()?.get_int(tag)?.as_int()
    }

    fn meta_str(&self, tag: i64) -> Option<&str> {
        self.0.meta()?.get_int(tag)?.as_str()
    }

    fn set_meta_int(&mut self, tag: i64, value: Option<i64>) {
        match value {
            Some(v) => self.0.meta_mut().insert(tag, v),
            None => {
                self.0.meta_mut().remove(&MetaKey::Int(tag));
            }
        }
    }

    fn set_meta_str(&mut self, tag: i64, value: Option<&str>) {
        match value {
            Some(v) => self.0.meta_mut().insert(tag, v),
            None => {
                self.0.meta_mut().remove(&MetaKey::Int(tag));
            }
        }
    }

    pub fn request_id(&self) -> Option<i64> {
        self.meta_int(tag::REQUEST_ID)
    }

    pub fn set_request_id(&mut self, rqid: Option<i64>) {
        self.set_meta_int(tag::REQUEST_ID, rqid);
    }

    /// SHV path; absent tag reads as the root path.
    pub fn path(&self) -> &str {
        self.meta_str(tag::SHV_PATH).unwrap_or("")
    }

    pub fn set_path(&mut self, path: &str) {
        self.set_meta_str(tag::SHV_PATH, if path.is_empty() { None } else { Some(path) });
    }

    pub fn method(&self) -> Option<&str> {
        self.meta_str(tag::METHOD)
    }

    pub fn set_method(&mut self, method: Option<&str>) {
        self.set_meta_str(tag::METHOD, method);
    }

    /// Signal name; defaults to `chng` when the tag is missing.
    pub fn signal_name(&self) -> &str {
        self.meta_str(tag::SIGNAL).unwrap_or(DEFAULT_SIGNAL)
    }

    pub fn user_id(&self) -> Option<&str> {
        self.meta_str(tag::USER_ID)
    }

    pub fn set_user_id(&mut self, user_id: Option<&str>) {
        self.set_meta_str(tag::USER_ID, user_id);
    }

    /// Caller id stack. A single integer is accepted as a one-element stack.
    pub fn caller_ids(&self) -> Result<Vec<i64>, MessageError> {
        let Some(meta) = self.0.meta() else {
            return Ok(Vec::new());
        };
        let Some(raw) = meta.get_int(tag::CALLER_IDS) else {
            return Ok(Vec::new());
        };
        match raw.value() {
            Value::Int(v) => Ok(vec![*v]),
            Value::UInt(v) => Ok(vec![*v as i64]),
            Value::List(items) => items
                .iter()
                .map(|i| i.as_int().ok_or(MessageError::MalformedField("caller ids")))
                .collect(),
            _ => Err(MessageError::MalformedField("caller ids")),
        }
    }

    pub fn set_caller_ids(&mut self, cids: &[i64]) {
        match cids {
            [] => self.set_meta_int(tag::CALLER_IDS, None),
            [single] => self.set_meta_int(tag::CALLER_IDS, Some(*single)),
            many => {
                let list: Vec<RpcValue> = many.iter().map(|v| RpcValue::from(*v)).collect();
                self.0.meta_mut().insert(tag::CALLER_IDS, RpcValue::from(list));
            }
        }
    }

    pub fn push_caller_id(&mut self, cid: i64) -> Result<(), MessageError> {
        let mut cids = self.caller_ids()?;
        cids.push(cid);
        self.set_caller_ids(&cids);
        Ok(())
    }

    pub fn pop_caller_id(&mut self) -> Result<Option<i64>, MessageError> {
        let mut cids = self.caller_ids()?;
        let top = cids.pop();
        self.set_caller_ids(&cids);
        Ok(top)
    }

    /// Granted access; tag 17 wins, the legacy tag 19 string is the fallback.
    pub fn access_level(&self) -> Option<AccessLevel> {
        if let Some(v) = self.meta_int(tag::ACCESS_LEVEL) {
            return AccessLevel::from_value(v);
        }
        self.meta_str(tag::ACCESS)?
            .split(',')
            .find_map(AccessLevel::from_str_name)
    }

    pub fn set_access_level(&mut self, level: Option<AccessLevel>) {
        match level {
            Some(l) => {
                self.set_meta_int(tag::ACCESS_LEVEL, Some(l as i64));
                self.set_meta_str(tag::ACCESS, Some(l.as_str()));
            }
            None => {
                self.set_meta_int(tag::ACCESS_LEVEL, None);
                self.set_meta_str(tag::ACCESS, None);
            }
        }
    }

    // ── Body access ───────────────────────────────────────────────────────────

    fn body_get(&self, key: i64) -> Option<&RpcValue> {
        match self.0.value() {
            Value::IMap(m) => m.get(&key),
            _ => None,
        }
    }

    fn body_set(&mut self, key: i64, value: Option<RpcValue>) {
        if let Value::IMap(m) = self.0.value_mut() {
            match value {
                Some(v) => {
                    m.insert(key, v);
                }
                None => {
                    m.remove(&key);
                }
            }
        }
    }

    pub fn param(&self) -> Option<&RpcValue> {
        self.body_get(key::PARAM)
    }

    pub fn set_param(&mut self, param: Option<RpcValue>) {
        self.body_set(key::PARAM, param.filter(|p| !p.is_null()));
    }

    pub fn result(&self) -> Option<&RpcValue> {
        self.body_get(key::RESULT)
    }

    pub fn error(&self) -> Option<RpcError> {
        RpcError::from_value(self.body_get(key::ERROR)?)
    }

    /// Builds the success response for this request, keeping the request id
    /// and the caller id stack so brokers can route it back.
    pub fn make_response(&self, result: RpcValue) -> Self {
        let mut resp = Self::empty();
        resp.set_request_id(self.request_id());
        if let Ok(cids) = self.caller_ids() {
            resp.set_caller_ids(&cids);
        }
        if !result.is_null() {
            resp.body_set(key::RESULT, Some(result));
        }
        resp
    }

    /// Builds an error response towards a known request id, for cases where
    /// the original request is no longer at hand (timeouts, dead peers).
    pub fn error_response(rqid: i64, caller_ids: &[i64], error: RpcError) -> Self {
        let mut resp = Self::empty();
        resp.set_request_id(Some(rqid));
        resp.set_caller_ids(caller_ids);
        resp.body_set(key::ERROR, Some(error.to_value()));
        resp
    }

    /// Builds the error response for this request.
    pub fn make_error_response(&self, error: RpcError) -> Self {
        let mut resp = Self::empty();
        resp.set_request_id(self.request_id());
        if let Ok(cids) = self.caller_ids() {
            resp.set_caller_ids(&cids);
        }
        resp.body_set(key::ERROR, Some(error.to_value()));
        resp
    }
}

impl fmt::Display for RpcMessage {
    /// CPON rendering, the debug-friendly form.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::cpon::pack(&self.0))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_has_id_method_and_path() {
        let msg = RpcMessage::request_with_id(7, "test/device", "get", None);
        assert_eq!(msg.classify(), Ok(RpcMessageType::Request));
        assert_eq!(msg.request_id(), Some(7));
        assert_eq!(msg.method(), Some("get"));
        assert_eq!(msg.path(), "test/device");
    }

    #[test]
    fn test_request_round_trips_through_chainpack() {
        let msg = RpcMessage::request_with_id(3, "a/b", "set", Some(RpcValue::from(42i64)));
        let back = RpcMessage::from_chainpack(&msg.to_chainpack()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_response_carries_result() {
        let req = RpcMessage::request_with_id(9, "x", "get", None);
        let resp = req.make_response(RpcValue::from("value"));
        assert_eq!(resp.classify(), Ok(RpcMessageType::Response));
        assert_eq!(resp.request_id(), Some(9));
        assert_eq!(resp.result().and_then(|r| r.as_str().map(String::from)), Some("value".into()));
        assert!(resp.method().is_none());
    }

    #[test]
    fn test_error_response_encodes_code_and_message() {
        let req = RpcMessage::request_with_id(9, "x", "get", None);
        let resp = req.make_error_response(RpcError::method_not_found("no such method"));
        assert_eq!(resp.classify(), Ok(RpcMessageType::Response));
        let err = resp.error().unwrap();
        assert_eq!(err.code, RpcErrorCode::MethodNotFound as i64);
        assert_eq!(err.message, "no such method");
    }

    #[test]
    fn test_method_call_exception_is_code_five() {
        assert_eq!(RpcErrorCode::MethodCallException as i64, 5);
        assert_eq!(RpcErrorCode::LoginRequired as i64, 6);
        assert_eq!(RpcErrorCode::RequestInvalid as i64, 10);
    }

    #[test]
    fn test_signal_defaults_to_chng() {
        let sig = RpcMessage::signal("dev/track", "get", "chng", Some(RpcValue::from(1i64)), AccessLevel::Read);
        assert_eq!(sig.classify(), Ok(RpcMessageType::Signal));
        assert_eq!(sig.signal_name(), "chng");
        // The default name is left off the wire entirely.
        assert!(sig.as_value().meta().unwrap().get_int(tag::SIGNAL).is_none());
    }

    #[test]
    fn test_named_signal_keeps_tag() {
        let sig = RpcMessage::signal("dev", "ls", "lsmod", None, AccessLevel::Browse);
        assert_eq!(sig.signal_name(), "lsmod");
    }

    #[test]
    fn test_message_without_id_or_method_is_invalid() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        msg.set_request_id(None);
        msg.set_method(None);
        assert_eq!(msg.classify(), Err(MessageError::MissingMethod));
    }

    #[test]
    fn test_request_with_result_body_is_invalid() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        msg.body_set(key::RESULT, Some(RpcValue::from(1i64)));
        assert_eq!(msg.classify(), Err(MessageError::AmbiguousBody));
    }

    #[test]
    fn test_non_imap_body_is_invalid() {
        let msg = RpcMessage(RpcValue::from("not a message"));
        assert_eq!(msg.classify(), Err(MessageError::BodyNotImap("String")));
    }

    #[test]
    fn test_caller_id_stacking() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        assert_eq!(msg.caller_ids().unwrap(), Vec::<i64>::new());
        msg.push_caller_id(11).unwrap();
        // One entry travels as a plain integer.
        assert!(msg.as_value().meta().unwrap().get_int(tag::CALLER_IDS).unwrap().as_int().is_some());
        msg.push_caller_id(12).unwrap();
        assert_eq!(msg.caller_ids().unwrap(), vec![11, 12]);
        assert_eq!(msg.pop_caller_id().unwrap(), Some(12));
        assert_eq!(msg.caller_ids().unwrap(), vec![11]);
    }

    #[test]
    fn test_malformed_caller_ids_reported() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        msg.0.meta_mut().insert(tag::CALLER_IDS, "bogus");
        assert_eq!(msg.caller_ids(), Err(MessageError::MalformedField("caller ids")));
    }

    #[test]
    fn test_access_level_prefers_new_tag() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        msg.set_access_level(Some(AccessLevel::Write));
        assert_eq!(msg.access_level(), Some(AccessLevel::Write));
        // Legacy string tag is stamped alongside.
        assert_eq!(msg.as_value().meta().unwrap().get_int(tag::ACCESS).unwrap().as_str(), Some("wr"));
    }

    #[test]
    fn test_access_level_falls_back_to_legacy_string() {
        let mut msg = RpcMessage::request_with_id(1, "p", "m", None);
        msg.set_meta_str(tag::ACCESS, Some("bogus,rd"));
        assert_eq!(msg.access_level(), Some(AccessLevel::Read));
    }

    // ── Request id generator ──────────────────────────────────────────────────

    #[test]
    fn test_ids_strictly_increase_within_window() {
        let mut generator = RequestIdGenerator::new();
        let ids: Vec<i64> = (0..100).map(|_| generator.next()).collect();
        assert!(ids.windows(2).all(|w| w[1] > w[0]));
    }

    #[test]
    fn test_ids_restart_after_window_elapses() {
        let mut generator = RequestIdGenerator::with_window(Duration::from_millis(10));
        let before: Vec<i64> = (0..5).map(|_| generator.next()).collect();
        assert_eq!(before, vec![1, 2, 3, 4, 5]);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(generator.next(), 1);
    }

    #[test]
    fn test_global_ids_are_unique() {
        let a = next_request_id();
        let b = next_request_id();
        assert!(b > a);
    }
}
