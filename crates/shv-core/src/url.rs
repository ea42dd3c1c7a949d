//! RPC URLs: one string that selects transport, framing and login.
//!
//! ```text
//! scheme://[user@]authority[/path][?options]
//! ```
//!
//! | scheme                      | transport            | framing    |
//! |-----------------------------|----------------------|------------|
//! | `tcp`                       | TCP stream           | Block      |
//! | `tcps`                      | TCP stream           | Serial+CRC |
//! | `ws` / `wss`                | WebSocket            | frame per binary message |
//! | `unix` / `localsocket`      | Unix domain stream   | Block      |
//! | `serial` / `serialport` / `tty` | serial device    | Serial+CRC |
//! | `pipe`                      | OS pipe / FIFO       | Block      |
//!
//! Options: `user`, `password`, `shapass` (40 hex characters), `devid`,
//! `devmount`, `baudrate` (serial only), `ca` (TLS trust anchor; TLS itself
//! sits below this layer). `shapass` wins over `password` when both appear.

use std::fmt;

use thiserror::Error;

use crate::framing::Framing;
use crate::login::{LoginParams, LoginType};

/// Errors from URL parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum UrlError {
    #[error("invalid scheme: {0}")]
    InvalidScheme(String),

    #[error("missing scheme in URL: {0}")]
    MissingScheme(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("a path makes no sense for scheme {0}")]
    UnexpectedPath(&'static str),

    #[error("sha1 password must be 40 hex characters")]
    InvalidShaPass,

    #[error("invalid baudrate: {0}")]
    InvalidBaudrate(String),

    #[error("unsupported URL option: {0}")]
    UnsupportedOption(String),
}

/// Transport protocol selected by the URL scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Tcp,
    TcpSerial,
    Ws,
    Wss,
    Unix,
    Serial,
    Pipe,
}

impl Scheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(Scheme::Tcp),
            "tcps" => Some(Scheme::TcpSerial),
            "ws" => Some(Scheme::Ws),
            "wss" => Some(Scheme::Wss),
            "unix" | "localsocket" => Some(Scheme::Unix),
            "serial" | "serialport" | "tty" => Some(Scheme::Serial),
            "pipe" => Some(Scheme::Pipe),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Tcp => "tcp",
            Scheme::TcpSerial => "tcps",
            Scheme::Ws => "ws",
            Scheme::Wss => "wss",
            Scheme::Unix => "unix",
            Scheme::Serial => "serial",
            Scheme::Pipe => "pipe",
        }
    }

    /// Host-based schemes carry `host:port`; the rest carry a filesystem path.
    pub fn is_host_based(&self) -> bool {
        matches!(self, Scheme::Tcp | Scheme::TcpSerial | Scheme::Ws | Scheme::Wss)
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Tcp => 3755,
            Scheme::TcpSerial => 3765,
            Scheme::Ws => 80,
            Scheme::Wss => 443,
            _ => 0,
        }
    }
}

/// Parsed RPC URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcUrl {
    pub scheme: Scheme,
    /// Host for host-based schemes, otherwise the filesystem path.
    pub location: String,
    pub port: u16,
    /// HTTP path for WebSocket upgrades.
    pub path: String,
    pub login: LoginParams,
    pub baudrate: u32,
    /// TLS trust anchor path, recorded for the layer below.
    pub ca: Option<String>,
}

pub const DEFAULT_BAUDRATE: u32 = 115_200;

impl RpcUrl {
    /// The framing the scheme mandates.
    pub fn framing(&self) -> Framing {
        match self.scheme {
            Scheme::TcpSerial | Scheme::Serial => Framing::SerialCrc,
            _ => Framing::Block,
        }
    }

    pub fn parse(url: &str) -> Result<Self, UrlError> {
        let (scheme_str, rest) = url
            .split_once("://")
            .map(|(s, r)| (s, (r, true)))
            .or_else(|| url.split_once(':').map(|(s, r)| (s, (r, false))))
            .ok_or_else(|| UrlError::MissingScheme(url.to_string()))?;
        let (rest, _had_slashes) = rest;
        let scheme =
            Scheme::parse(scheme_str).ok_or_else(|| UrlError::InvalidScheme(scheme_str.to_string()))?;

        let (body, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let mut res = Self {
            scheme,
            location: String::new(),
            port: scheme.default_port(),
            path: String::new(),
            login: LoginParams::default(),
            baudrate: DEFAULT_BAUDRATE,
            ca: None,
        };

        if scheme.is_host_based() {
            let (userinfo, hostport) = match body.rsplit_once('@') {
                Some((u, h)) => (Some(u), h),
                None => (None, body),
            };
            if let Some(user) = userinfo {
                res.login.user = user.to_string();
            }
            let (hostport, path) = match hostport.find('/') {
                Some(pos) => (&hostport[..pos], &hostport[pos..]),
                None => (hostport, ""),
            };
            if !path.is_empty() {
                match scheme {
                    Scheme::Ws | Scheme::Wss => res.path = path.to_string(),
                    Scheme::Tcp => return Err(UrlError::UnexpectedPath("tcp")),
                    Scheme::TcpSerial => return Err(UrlError::UnexpectedPath("tcps")),
                    _ => unreachable!("host-based schemes only"),
                }
            }
            // IPv6 literals are bracketed: [::1]:3755
            if let Some(closing) = hostport.strip_prefix('[').and_then(|h| h.find(']')) {
                res.location = hostport[1..closing + 1].to_string();
                if let Some(port) = hostport[closing + 2..].strip_prefix(':') {
                    res.port = port.parse().map_err(|_| UrlError::InvalidPort(port.to_string()))?;
                } else if !hostport[closing + 2..].is_empty() {
                    return Err(UrlError::InvalidPort(hostport.to_string()));
                }
            } else if let Some((host, port)) = hostport.rsplit_once(':') {
                res.location = host.to_string();
                res.port = port.parse().map_err(|_| UrlError::InvalidPort(port.to_string()))?;
            } else {
                res.location = hostport.to_string();
            }
        } else {
            // unix:/run/shv.sock, unix:///run/shv.sock, serial:/dev/ttyUSB0
            res.location = if let Some(stripped) = body.strip_prefix("//") {
                format!("/{}", stripped.trim_start_matches('/'))
            } else {
                body.to_string()
            };
        }

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                match key {
                    "user" => res.login.user = value.to_string(),
                    "shapass" => {
                        if value.len() != 40 {
                            return Err(UrlError::InvalidShaPass);
                        }
                        res.login.password = value.to_string();
                        res.login.login_type = LoginType::Sha1;
                    }
                    "password" => {
                        // shapass wins when both are present
                        if res.login.login_type != LoginType::Sha1 {
                            res.login.password = value.to_string();
                            res.login.login_type = LoginType::Plain;
                        }
                    }
                    "devid" => res.login.device_id = Some(value.to_string()),
                    "devmount" => res.login.mount_point = Some(value.to_string()),
                    // Only serial links have a line speed; elsewhere the
                    // option falls through to the unsupported-query error.
                    "baudrate" if scheme == Scheme::Serial => {
                        res.baudrate =
                            value.parse().map_err(|_| UrlError::InvalidBaudrate(value.to_string()))?
                    }
                    "ca" => res.ca = Some(value.to_string()),
                    other => return Err(UrlError::UnsupportedOption(other.to_string())),
                }
            }
        }
        Ok(res)
    }
}

impl fmt::Display for RpcUrl {
    /// Reconstructs the URL; the password is left out on purpose.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme.is_host_based() {
            write!(f, "{}://", self.scheme.as_str())?;
            if !self.login.user.is_empty() {
                write!(f, "{}@", self.login.user)?;
            }
            if self.location.contains(':') {
                write!(f, "[{}]", self.location)?;
            } else {
                f.write_str(&self.location)?;
            }
            write!(f, ":{}", self.port)?;
            f.write_str(&self.path)
        } else {
            write!(f, "{}:{}", self.scheme.as_str(), self.location)
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_defaults() {
        let url = RpcUrl::parse("tcp://localhost").unwrap();
        assert_eq!(url.scheme, Scheme::Tcp);
        assert_eq!(url.location, "localhost");
        assert_eq!(url.port, 3755);
        assert_eq!(url.framing(), Framing::Block);
    }

    #[test]
    fn test_tcp_with_user_and_port() {
        let url = RpcUrl::parse("tcp://admin@example.com:3700").unwrap();
        assert_eq!(url.login.user, "admin");
        assert_eq!(url.location, "example.com");
        assert_eq!(url.port, 3700);
    }

    #[test]
    fn test_ipv6_any_listen_url() {
        let url = RpcUrl::parse("tcp://[::]:3755").unwrap();
        assert_eq!(url.location, "::");
        assert_eq!(url.port, 3755);
    }

    #[test]
    fn test_tcps_uses_serial_crc_framing() {
        let url = RpcUrl::parse("tcps://h").unwrap();
        assert_eq!(url.port, 3765);
        assert_eq!(url.framing(), Framing::SerialCrc);
    }

    #[test]
    fn test_ws_keeps_http_path() {
        let url = RpcUrl::parse("ws://h:8080/shv/ws").unwrap();
        assert_eq!(url.scheme, Scheme::Ws);
        assert_eq!(url.path, "/shv/ws");
        assert_eq!(url.port, 8080);
    }

    #[test]
    fn test_tcp_with_path_is_rejected() {
        assert_eq!(RpcUrl::parse("tcp://h/p"), Err(UrlError::UnexpectedPath("tcp")));
    }

    #[test]
    fn test_unix_socket_paths() {
        assert_eq!(RpcUrl::parse("unix:/run/shv.sock").unwrap().location, "/run/shv.sock");
        assert_eq!(RpcUrl::parse("unix:///run/shv.sock").unwrap().location, "/run/shv.sock");
        assert_eq!(RpcUrl::parse("localsocket:/tmp/b").unwrap().scheme, Scheme::Unix);
    }

    #[test]
    fn test_serial_device_with_baudrate() {
        let url = RpcUrl::parse("serial:/dev/ttyUSB0?baudrate=19200").unwrap();
        assert_eq!(url.scheme, Scheme::Serial);
        assert_eq!(url.location, "/dev/ttyUSB0");
        assert_eq!(url.baudrate, 19200);
        assert_eq!(url.framing(), Framing::SerialCrc);
        assert_eq!(RpcUrl::parse("tty:/dev/ttyS0").unwrap().scheme, Scheme::Serial);
    }

    #[test]
    fn test_baudrate_on_non_serial_scheme_is_rejected() {
        assert_eq!(
            RpcUrl::parse("tcp://h?baudrate=9600"),
            Err(UrlError::UnsupportedOption("baudrate".to_string()))
        );
        assert_eq!(
            RpcUrl::parse("unix:/run/shv.sock?baudrate=9600"),
            Err(UrlError::UnsupportedOption("baudrate".to_string()))
        );
    }

    #[test]
    fn test_password_options() {
        let url = RpcUrl::parse("tcp://h?user=admin&password=admin!123").unwrap();
        assert_eq!(url.login.user, "admin");
        assert_eq!(url.login.password, "admin!123");
        assert_eq!(url.login.login_type, LoginType::Plain);
    }

    #[test]
    fn test_shapass_wins_over_password() {
        let sha = "0123456789abcdef0123456789abcdef01234567";
        let url = RpcUrl::parse(&format!("tcp://h?shapass={sha}&password=x")).unwrap();
        assert_eq!(url.login.password, sha);
        assert_eq!(url.login.login_type, LoginType::Sha1);
    }

    #[test]
    fn test_short_shapass_is_rejected() {
        assert_eq!(RpcUrl::parse("tcp://h?shapass=abc"), Err(UrlError::InvalidShaPass));
    }

    #[test]
    fn test_device_options() {
        let url = RpcUrl::parse("tcp://h?devid=widget&devmount=test/widget").unwrap();
        assert_eq!(url.login.device_id.as_deref(), Some("widget"));
        assert_eq!(url.login.mount_point.as_deref(), Some("test/widget"));
    }

    #[test]
    fn test_unknown_option_is_rejected() {
        assert_eq!(
            RpcUrl::parse("tcp://h?frobnicate=1"),
            Err(UrlError::UnsupportedOption("frobnicate".to_string()))
        );
    }

    #[test]
    fn test_unknown_scheme_is_rejected() {
        assert_eq!(RpcUrl::parse("gopher://h"), Err(UrlError::InvalidScheme("gopher".to_string())));
        assert_eq!(RpcUrl::parse("nocolonatall"), Err(UrlError::MissingScheme("nocolonatall".to_string())));
    }

    #[test]
    fn test_display_round_trip_for_host_urls() {
        for s in ["tcp://admin@h:3755", "ws://h:80/ws", "unix:/run/shv.sock"] {
            let url = RpcUrl::parse(s).unwrap();
            assert_eq!(RpcUrl::parse(&url.to_string()).unwrap(), url, "through {s}");
        }
    }
}
