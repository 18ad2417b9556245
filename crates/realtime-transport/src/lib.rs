//! Realtime document-tree transport.
//!
//! This crate owns everything that touches the backing store directly:
//!
//! - [`Value`] and the write [`sanitize`]r
//! - [`DbPath`] and the [`layout`] of the hotel-ops tree
//! - the [`Transport`] trait, with an in-process [`MemoryBackend`] and a
//!   REST/event-stream [`RestTransport`]
//! - persisted connection-failure [`flags`]

pub mod flags;
mod error;
mod memory;
mod path;
mod push_id;
mod rest;
mod sanitize;
mod transport;
mod value;
pub mod wire;

pub use error::{TransportError, TransportResult};
pub use flags::{FileFlagStorage, FlagStorage, MemoryFlagStorage};
pub use memory::{MemoryBackend, MemoryTransport, TransportStats};
pub use path::{layout, user_key, DbPath};
pub use push_id::PushIdGenerator;
pub use rest::{RestConfig, RestTransport, RestTransportFactory, SseEvent, SseParser};
pub use sanitize::{sanitize, sanitize_batch};
pub use transport::{
    validate_batch, ListenerFn, ListenerId, Transport, TransportFactory, WriteBatch,
};
pub use value::Value;

/// Re-exported so dependents can name listener payloads.
pub use serde_json::Value as JsonValue;
