//! Login handshake parameters and password validation.
//!
//! A freshly connected peer calls `hello` and receives `{"nonce": "…"}`,
//! then calls `login` with a Map parameter:
//!
//! ```text
//! {
//!   "login": {"user": "u", "password": "…", "type": "PLAIN" | "SHA1" | "TOKEN"},
//!   "options": {
//!     "device": {"deviceId": "…", "mountPoint": "…"},
//!     "idleWatchDogTimeOut": 180
//!   }
//! }
//! ```
//!
//! For `SHA1` the password field carries `sha1_hex(nonce + sha1_hex(password))`,
//! which lets the server store only the SHA1 of the real password.

use sha1::{Digest, Sha1};

use crate::value::{RpcValue, Value};

/// Password format announced with the login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoginType {
    Plain,
    #[default]
    Sha1,
    Token,
}

impl LoginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoginType::Plain => "PLAIN",
            LoginType::Sha1 => "SHA1",
            LoginType::Token => "TOKEN",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        match name {
            "PLAIN" => Some(LoginType::Plain),
            "SHA1" => Some(LoginType::Sha1),
            "TOKEN" => Some(LoginType::Token),
            _ => None,
        }
    }
}

/// Hex digest of SHA1 over the input.
pub fn sha1_hex(data: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// The digest a SHA1 login sends: `sha1(nonce + sha1_hex_of_password)`.
pub fn sha1_login_digest(nonce: &str, sha1_password: &str) -> String {
    sha1_hex(&format!("{nonce}{sha1_password}"))
}

/// Parsed login request.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LoginParams {
    pub user: String,
    pub password: String,
    pub login_type: LoginType,
    pub device_id: Option<String>,
    pub mount_point: Option<String>,
    pub idle_timeout: Option<u64>,
}

impl LoginParams {
    pub fn new(user: impl Into<String>, password: impl Into<String>, login_type: LoginType) -> Self {
        Self { user: user.into(), password: password.into(), login_type, ..Default::default() }
    }

    /// Builds the `login` method parameter. A plain password is hashed with
    /// the nonce unless `trusted` marks the transport as safe for cleartext.
    pub fn to_value(&self, nonce: &str, trusted: bool) -> RpcValue {
        let (password, login_type) = match self.login_type {
            LoginType::Plain if !trusted => {
                (sha1_login_digest(nonce, &sha1_hex(&self.password)), LoginType::Sha1)
            }
            LoginType::Sha1 => (sha1_login_digest(nonce, &self.password), LoginType::Sha1),
            other => (self.password.clone(), other),
        };

        let mut login = std::collections::BTreeMap::new();
        login.insert("user".to_string(), RpcValue::from(self.user.as_str()));
        login.insert("password".to_string(), RpcValue::from(password));
        login.insert("type".to_string(), RpcValue::from(login_type.as_str()));

        let mut options = std::collections::BTreeMap::new();
        let mut device = std::collections::BTreeMap::new();
        if let Some(devid) = &self.device_id {
            device.insert("deviceId".to_string(), RpcValue::from(devid.as_str()));
        }
        if let Some(mount) = &self.mount_point {
            device.insert("mountPoint".to_string(), RpcValue::from(mount.as_str()));
        }
        if !device.is_empty() {
            options.insert("device".to_string(), RpcValue::from(device));
        }
        if let Some(timeout) = self.idle_timeout {
            options.insert("idleWatchDogTimeOut".to_string(), RpcValue::from(timeout));
        }

        let mut root = std::collections::BTreeMap::new();
        root.insert("login".to_string(), RpcValue::from(login));
        if !options.is_empty() {
            root.insert("options".to_string(), RpcValue::from(options));
        }
        RpcValue::from(root)
    }

    /// Parses the `login` method parameter. Unknown keys are ignored; a
    /// missing type is deduced from the password shape (40 hex characters
    /// reads as SHA1).
    pub fn from_value(value: &RpcValue) -> Option<Self> {
        value.as_map()?;
        let password = map_get_str(value, &["login", "password"]).unwrap_or_default();
        let login_type = match map_get_str(value, &["login", "type"]) {
            Some(name) => LoginType::from_str_name(&name)?,
            None if password.len() == 40 => LoginType::Sha1,
            None => LoginType::Plain,
        };
        Some(Self {
            user: map_get_str(value, &["login", "user"]).unwrap_or_default(),
            password,
            login_type,
            device_id: map_get_str(value, &["options", "device", "deviceId"]),
            mount_point: map_get_str(value, &["options", "device", "mountPoint"]),
            idle_timeout: map_get(value, &["options", "idleWatchDogTimeOut"])
                .and_then(|v| v.as_uint()),
        })
    }

    /// Validates this login against the reference credential.
    ///
    /// `reference` is the stored password; `reference_is_sha1` says whether
    /// it is already the SHA1 hex of the real one. Every combination of
    /// stored format and announced format interoperates, per the protocol.
    pub fn validate_password(&self, reference: &str, reference_is_sha1: bool, nonce: &str) -> bool {
        match self.login_type {
            LoginType::Plain => {
                if reference_is_sha1 {
                    sha1_hex(&self.password) == reference
                } else {
                    self.password == reference
                }
            }
            LoginType::Sha1 => {
                let shapass =
                    if reference_is_sha1 { reference.to_string() } else { sha1_hex(reference) };
                self.password == sha1_login_digest(nonce, &shapass)
            }
            LoginType::Token => false,
        }
    }
}

/// Walks nested Maps by string keys.
pub fn map_get<'a>(value: &'a RpcValue, path: &[&str]) -> Option<&'a RpcValue> {
    let mut cur = value;
    for key in path {
        match cur.value() {
            Value::Map(m) => cur = m.get(*key)?,
            _ => return None,
        }
    }
    Some(cur)
}

fn map_get_str(value: &RpcValue, path: &[&str]) -> Option<String> {
    map_get(value, path)?.as_str().map(str::to_string)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha1_hex_known_vector() {
        // sha1("admin!123")
        assert_eq!(sha1_hex("admin!123"), "57a261a7bcb9e6cf1db80df501cdd89cee82957e");
    }

    #[test]
    fn test_plain_login_against_plain_reference() {
        let login = LoginParams::new("admin", "admin!123", LoginType::Plain);
        assert!(login.validate_password("admin!123", false, "nonce"));
        assert!(!login.validate_password("other", false, "nonce"));
    }

    #[test]
    fn test_plain_login_against_sha1_reference() {
        let login = LoginParams::new("admin", "admin!123", LoginType::Plain);
        assert!(login.validate_password(&sha1_hex("admin!123"), true, "nonce"));
    }

    #[test]
    fn test_sha1_login_against_both_reference_formats() {
        let nonce = "abc123";
        let digest = sha1_login_digest(nonce, &sha1_hex("admin!123"));
        let login = LoginParams::new("admin", digest, LoginType::Sha1);
        assert!(login.validate_password("admin!123", false, nonce));
        assert!(login.validate_password(&sha1_hex("admin!123"), true, nonce));
        assert!(!login.validate_password("admin!123", false, "wrong-nonce"));
    }

    #[test]
    fn test_token_login_never_validates() {
        let login = LoginParams::new("admin", "whatever", LoginType::Token);
        assert!(!login.validate_password("whatever", false, "n"));
    }

    #[test]
    fn test_param_round_trip_trusted_plain() {
        let mut params = LoginParams::new("dev", "secret", LoginType::Plain);
        params.device_id = Some("widget".into());
        params.mount_point = Some("test/widget".into());
        params.idle_timeout = Some(60);
        let value = params.to_value("nonce", true);
        let back = LoginParams::from_value(&value).unwrap();
        assert_eq!(back, params);
    }

    #[test]
    fn test_untrusted_plain_is_upgraded_to_sha1() {
        let params = LoginParams::new("dev", "secret", LoginType::Plain);
        let value = params.to_value("nonce", false);
        let back = LoginParams::from_value(&value).unwrap();
        assert_eq!(back.login_type, LoginType::Sha1);
        assert!(back.validate_password("secret", false, "nonce"));
    }

    #[test]
    fn test_missing_type_is_deduced_from_password_shape() {
        let mut login = std::collections::BTreeMap::new();
        login.insert("user".to_string(), RpcValue::from("u"));
        login.insert("password".to_string(), RpcValue::from("a".repeat(40)));
        let mut root = std::collections::BTreeMap::new();
        root.insert("login".to_string(), RpcValue::from(login));
        let parsed = LoginParams::from_value(&RpcValue::from(root)).unwrap();
        assert_eq!(parsed.login_type, LoginType::Sha1);
    }

    #[test]
    fn test_non_map_param_is_rejected() {
        assert!(LoginParams::from_value(&RpcValue::from(1i64)).is_none());
    }
}
