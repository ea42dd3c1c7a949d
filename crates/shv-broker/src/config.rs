//! Broker configuration: TOML schema, validation and access resolution.
//!
//! ```toml
//! name = "site"
//! listen = ["tcp://[::]:3755", "unix:/run/shvbroker.sock"]
//!
//! [user.admin]
//! password = "admin!123"
//! role = "admin"
//!
//! [role.admin]
//! access.su = ["**"]
//!
//! [role.device]
//! access.wr = ["test/**"]
//! mountPoints = ["test/*"]
//!
//! [[autosetup]]
//! deviceId = ["widget*"]
//! roles = ["device"]
//! mountPoint = "test/%d%i"
//! subscriptions = []
//!
//! [[connect]]
//! url = "tcp://other-broker?user=site&password=secret"
//! role = "default"
//! mountPoint = "remote"
//! ```
//!
//! The raw serde layer mirrors the file; [`BrokerConfig::from_toml`]
//! validates it into the runtime form with parsed URLs, levels and RIs.
//! All policy is config driven; nothing is persisted across restarts.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use shv_core::login::LoginParams;
use shv_core::ri::{wildcard_match, RpcRi};
use shv_core::url::{RpcUrl, UrlError};
use shv_core::AccessLevel;

/// Configuration errors are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid URL {url}: {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: UrlError,
    },

    #[error("user.{0}: both password and sha1pass given")]
    AmbiguousPassword(String),

    #[error("user.{0}: sha1pass must be 40 hex characters")]
    InvalidSha1Pass(String),

    #[error("{context}: unknown role {role}")]
    UnknownRole { context: String, role: String },

    #[error("role.{role}: unknown access level {level}")]
    UnknownAccessLevel { role: String, level: String },

    #[error("connect[{0}]: user option missing in URL")]
    ConnectWithoutUser(usize),
}

// ── Raw serde layer ───────────────────────────────────────────────────────────

/// A value that may be written as a single string or an array of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum StrOrList {
    One(String),
    Many(Vec<String>),
}

impl StrOrList {
    fn into_vec(self) -> Vec<String> {
        match self {
            StrOrList::One(s) => vec![s],
            StrOrList::Many(v) => v,
        }
    }
}

impl Default for StrOrList {
    fn default() -> Self {
        StrOrList::Many(Vec::new())
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    name: String,
    #[serde(default)]
    listen: Vec<String>,
    #[serde(default)]
    connect: Vec<RawConnect>,
    #[serde(default)]
    user: BTreeMap<String, RawUser>,
    #[serde(default)]
    role: BTreeMap<String, RawRole>,
    #[serde(default)]
    autosetup: Vec<RawAutosetup>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConnect {
    url: String,
    #[serde(default)]
    role: Option<StrOrList>,
    #[serde(default, rename = "mountPoint")]
    mount_point: Option<String>,
    #[serde(default)]
    subscriptions: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUser {
    #[serde(default)]
    password: Option<String>,
    #[serde(default)]
    sha1pass: Option<String>,
    #[serde(default)]
    role: Option<StrOrList>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRole {
    #[serde(default)]
    access: BTreeMap<String, StrOrList>,
    #[serde(default, rename = "mountPoints")]
    mount_points: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAutosetup {
    #[serde(default, rename = "deviceId")]
    device_id: StrOrList,
    #[serde(default)]
    roles: StrOrList,
    #[serde(default, rename = "mountPoint")]
    mount_point: Option<String>,
    #[serde(default)]
    subscriptions: Vec<String>,
}

// ── Runtime layer ─────────────────────────────────────────────────────────────

/// Stored credential of a configured user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Password {
    Plain(String),
    Sha1(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    /// `None` marks a connect-only user that cannot log in over a listener.
    pub password: Option<Password>,
    pub roles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Role {
    /// Highest level whose RI list matches wins.
    pub access: Vec<(AccessLevel, Vec<RpcRi>)>,
    /// Globs over mount points a login with this role may claim.
    pub mount_points: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub url: RpcUrl,
    pub roles: Vec<String>,
    pub mount_point: Option<String>,
    pub subscriptions: Vec<RpcRi>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Autosetup {
    pub device_id: Vec<String>,
    pub roles: Vec<String>,
    pub mount_point: Option<String>,
    pub subscriptions: Vec<RpcRi>,
}

impl Autosetup {
    /// First-match rule: a device id glob must match and, when the rule
    /// names roles, at least one must be among the login's roles.
    pub fn applies(&self, device_id: &str, roles: &[String]) -> bool {
        self.device_id.iter().any(|glob| wildcard_match(device_id, glob))
            && (self.roles.is_empty() || self.roles.iter().any(|r| roles.contains(r)))
    }
}

/// Validated broker configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BrokerConfig {
    pub name: String,
    pub listen: Vec<RpcUrl>,
    pub connect: Vec<Connect>,
    pub users: BTreeMap<String, User>,
    pub roles: BTreeMap<String, Role>,
    pub autosetup: Vec<Autosetup>,
}

impl BrokerConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(text)?;
        let mut res = Self { name: raw.name, ..Default::default() };

        for url in raw.listen {
            res.listen.push(parse_url(&url)?);
        }

        for (name, role) in raw.role {
            let mut access = Vec::new();
            for (level_name, ris) in role.access {
                let level = AccessLevel::from_str_name(&level_name).ok_or_else(|| {
                    ConfigError::UnknownAccessLevel { role: name.clone(), level: level_name }
                })?;
                access.push((level, ris.into_vec().iter().map(|s| RpcRi::parse(s)).collect()));
            }
            // Highest level first so resolution can take the first match.
            access.sort_by(|a, b| b.0.cmp(&a.0));
            res.roles.insert(name, Role { access, mount_points: role.mount_points });
        }

        for (name, user) in raw.user {
            let password = match (user.password, user.sha1pass) {
                (Some(_), Some(_)) => return Err(ConfigError::AmbiguousPassword(name)),
                (Some(p), None) => Some(Password::Plain(p)),
                (None, Some(s)) => {
                    if s.len() != 40 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
                        return Err(ConfigError::InvalidSha1Pass(name));
                    }
                    Some(Password::Sha1(s))
                }
                (None, None) => None,
            };
            let roles = roles_or_default(user.role);
            check_roles(&res.roles, &roles, || format!("user.{name}"))?;
            res.users.insert(name.clone(), User { name, password, roles });
        }

        for (i, connect) in raw.connect.into_iter().enumerate() {
            let url = parse_url(&connect.url)?;
            if url.login.user.is_empty() {
                return Err(ConfigError::ConnectWithoutUser(i));
            }
            let roles = roles_or_default(connect.role);
            check_roles(&res.roles, &roles, || format!("connect[{i}]"))?;
            res.connect.push(Connect {
                url,
                roles,
                mount_point: connect.mount_point,
                subscriptions: connect.subscriptions.iter().map(|s| RpcRi::parse(s)).collect(),
            });
        }

        for (i, autosetup) in raw.autosetup.into_iter().enumerate() {
            let roles = autosetup.roles.into_vec();
            check_roles(&res.roles, &roles, || format!("autosetup[{i}]"))?;
            res.autosetup.push(Autosetup {
                device_id: autosetup.device_id.into_vec(),
                roles,
                mount_point: autosetup.mount_point,
                subscriptions: autosetup.subscriptions.iter().map(|s| RpcRi::parse(s)).collect(),
            });
        }

        Ok(res)
    }

    /// Validates a login against the user table; returns the user on success.
    pub fn login(&self, login: &LoginParams, nonce: &str) -> Option<&User> {
        let user = self.users.get(&login.user)?;
        let (reference, is_sha1) = match user.password.as_ref()? {
            Password::Plain(p) => (p.as_str(), false),
            Password::Sha1(s) => (s.as_str(), true),
        };
        login.validate_password(reference, is_sha1, nonce).then_some(user)
    }

    /// Highest access level any of `roles` grants for the method resource.
    pub fn access_level(&self, roles: &[String], path: &str, method: &str) -> Option<AccessLevel> {
        roles
            .iter()
            .filter_map(|name| self.roles.get(name))
            .filter_map(|role| {
                role.access
                    .iter()
                    .find(|(_, ris)| ris.iter().any(|ri| ri.match_method(path, method)))
                    .map(|(level, _)| *level)
            })
            .max()
    }

    /// Whether a login with `roles` may claim `mount_point`.
    pub fn mount_point_allowed(&self, roles: &[String], mount_point: &str) -> bool {
        roles
            .iter()
            .filter_map(|name| self.roles.get(name))
            .flat_map(|role| role.mount_points.iter())
            .any(|glob| wildcard_match(mount_point, glob))
    }

    /// First auto-setup rule applying to this device and role set.
    pub fn autosetup_for(&self, device_id: &str, roles: &[String]) -> Option<&Autosetup> {
        self.autosetup.iter().find(|a| a.applies(device_id, roles))
    }
}

fn parse_url(url: &str) -> Result<RpcUrl, ConfigError> {
    RpcUrl::parse(url).map_err(|source| ConfigError::InvalidUrl { url: url.to_string(), source })
}

fn roles_or_default(roles: Option<StrOrList>) -> Vec<String> {
    let roles = roles.map(StrOrList::into_vec).unwrap_or_default();
    if roles.is_empty() {
        vec!["default".to_string()]
    } else {
        roles
    }
}

fn check_roles(
    known: &BTreeMap<String, Role>,
    roles: &[String],
    context: impl Fn() -> String,
) -> Result<(), ConfigError> {
    for role in roles {
        if !known.contains_key(role) && role != "default" {
            return Err(ConfigError::UnknownRole { context: context(), role: role.clone() });
        }
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
