//! Short-lived shared state: who is viewing a session, who is typing, and
//! the session's team chat.
//!
//! Presence and typing writes are best effort. They return
//! [`sync_client::BestEffort`] values and rely on disconnect hooks plus
//! client-side age filters for cleanup.

pub mod chat;
mod entries;
pub mod presence;
pub mod typing;

pub use chat::{ChatLog, ChatMessage, NewMessage};
pub use presence::{active_viewers, viewer_counts, PresenceEntry, PresenceSession, PresenceTracker, Viewer};
pub use typing::{active_typists, TypingEntry, TypingIndicator};
