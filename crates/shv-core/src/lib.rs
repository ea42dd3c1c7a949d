//! Core of the Silicon Heaven (SHV) RPC protocol.
//!
//! The crate is layered bottom up and every layer is pure with respect to
//! its inputs: it never logs and reports failures as typed errors.
//!
//! - [`value`]: the dynamic [`value::RpcValue`] model with meta attributes
//! - [`chainpack`] / [`cpon`]: the binary and textual codecs over it
//! - [`framing`]: message boundaries on byte streams (Block, Serial,
//!   Serial+CRC)
//! - [`rpcmessage`]: requests, responses and signals with their identity
//!   fields and error encoding
//! - [`ri`], [`access`]: resource-identifier globs and access levels
//! - [`login`], [`url`]: handshake parameters and connection URLs

pub mod access;
pub mod chainpack;
pub mod cpon;
pub mod framing;
pub mod login;
pub mod ri;
pub mod rpcmessage;
pub mod url;
pub mod value;

pub use access::AccessLevel;
pub use framing::{FrameError, FrameReader, FrameWriter, Framing, RxFrame};
pub use login::{LoginParams, LoginType};
pub use ri::RpcRi;
pub use rpcmessage::{RpcError, RpcErrorCode, RpcMessage, RpcMessageType};
pub use url::{RpcUrl, Scheme};
pub use value::{DateTime, Decimal, Meta, MetaKey, RpcValue, Value};
