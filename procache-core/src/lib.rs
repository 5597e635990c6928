//! PROCACHE Core - Shared Types and Runtime Primitives
//!
//! Data types and small runtime primitives shared by the storage and client
//! crates: cache entries, key construction, bus and server message types,
//! configuration, errors, observable signals, and the realm bus.

mod entry;
mod error;
mod keys;
mod messages;
mod time;

pub mod config;
pub mod realm;
pub mod signal;

// Re-export entry types
pub use entry::*;

// Re-export error types
pub use error::*;

// Re-export key/path construction
pub use keys::*;

// Re-export bus and server message types
pub use messages::*;

// Re-export time helpers
pub use time::*;

pub use config::{ApiConfig, ClientConfig, DbConfig, StartupConfig, TimestampSource, WsConfig};
pub use realm::{BroadcastBus, BusSubscription, PeerId, Realm};
pub use signal::Signal;
