//! Realtime client context shared by every store.
//!
//! - [`SyncClient`]: the process-wide handle, its generation counter and
//!   the reconnecting gate
//! - [`ConnectionMonitor`]: subscribe to, and wait for, the connected flag
//! - [`ReconnectEscalator`]: soft, hard and nuclear reconnect tiers
//! - [`Feed`]: typed live snapshots of one path
//! - outcome types for calls that degrade instead of failing

mod client;
mod error;
pub mod escalator;
mod feed;
mod monitor;
mod outcome;

pub use client::{ClientLease, ReconnectGuard, SyncClient};
pub use error::{SyncError, SyncResult};
pub use escalator::{
    AppVisibility, ReconnectEscalator, ReconnectState, ReconnectTier, RecoveryOutcome, Watchdog,
};
pub use feed::Feed;
pub use monitor::{ConnectionMonitor, Subscription};
pub use outcome::{BestEffort, PatchOutcome, SendOutcome, SkipReason, WriteOutcome};
