//! The SHV RPC broker.
//!
//! The broker multiplexes many point-to-point peers into one hierarchical
//! namespace. Every peer runs a reader task and a writer task; all routing
//! decisions are serialized on a single router task that owns the peer
//! table, the mount map, the subscription sets and the pending-request
//! table. Per-peer send queues are bounded and a slow consumer is
//! disconnected rather than allowed to stall the router.
//!
//! # Modules
//!
//! - [`config`]: TOML configuration and access resolution
//! - [`autosetup`]: mount point templates for device auto-setup
//! - [`broker`]: the router task and its state
//! - [`methods`]: the `.app` / `.broker` local method surface
//! - [`peer`]: per-connection reader/writer tasks, login and watchdog
//! - [`transport`]: listeners for the supported URL schemes
//! - [`outbound`]: broker-initiated connections with reconnect backoff

pub mod autosetup;
pub mod broker;
pub mod config;
pub mod methods;
pub mod outbound;
pub mod peer;
pub mod transport;

pub use broker::{Broker, BrokerHandle};
pub use config::{BrokerConfig, ConfigError};
