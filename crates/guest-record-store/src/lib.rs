//! Session and guest records synchronised across devices.
//!
//! [`GuestRecordStore`] offers three kinds of access:
//!
//! - atomic per-field patches that resolve a guest by id at write time
//! - one-time whole-session reads, and staleness-guarded whole-session writes
//! - live feeds of a guest list, a session, or the all-sessions index
//!
//! The store never exposes the wire shape of a list: [`decode`] turns both
//! array and keyed-map forms into ordered `Vec`s.

pub mod decode;
pub mod enrichment;
mod model;
mod store;

#[cfg(test)]
mod tests;

pub use enrichment::{
    merge_refinement, reconcile_refinements, CountMismatch, Reconciliation, Refinement,
    AI_OWNED_FIELDS,
};
pub use model::{CourtesyCall, Delivery, Guest, Session, SessionSummary};
pub use store::GuestRecordStore;
