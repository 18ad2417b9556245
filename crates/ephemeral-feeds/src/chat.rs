//! Per-session team chat at `chat/{session}/{pushKey}`.
//!
//! Messages are append-only. The push key is both the storage key and the
//! message `id`; `timestamp` is assigned by the server. Readers sort by
//! timestamp rather than trusting key order.

use crate::entries::{children, decode_children};
use realtime_transport::{layout, sanitize, user_key, JsonValue, Value};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use sync_client::{Feed, SendOutcome, SyncClient, SyncResult, WriteOutcome};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub department: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub timestamp: i64,
    /// User key to emoji. One reaction per user.
    #[serde(
        default,
        deserialize_with = "reaction_map",
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub reactions: BTreeMap<String, String>,
}

fn reaction_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<JsonValue>::deserialize(deserializer)?;
    Ok(children(raw.as_ref())
        .into_iter()
        .filter_map(|(user, emoji)| emoji.as_str().map(|e| (user, e.to_string())))
        .collect())
}

/// A message to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub author: String,
    pub department: String,
    pub text: String,
}

/// Messages of one session, oldest first. Entries missing an `id` take
/// their storage key.
pub fn order_messages(value: Option<&JsonValue>) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = decode_children(value)
        .into_iter()
        .map(|(key, mut message): (String, ChatMessage)| {
            if message.id.is_empty() {
                message.id = key;
            }
            message
        })
        .collect();
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
    messages
}

#[derive(Clone)]
pub struct ChatLog {
    client: Arc<SyncClient>,
}

impl ChatLog {
    pub fn new(client: Arc<SyncClient>) -> Self {
        Self { client }
    }

    /// Append a message. The outcome carries its id.
    pub async fn send(&self, session_id: &str, message: &NewMessage) -> SyncResult<SendOutcome> {
        let lease = match self.client.acquire_or_skip("chat_send") {
            Ok(lease) => lease,
            Err(reason) => return Ok(SendOutcome::Skipped(reason)),
        };
        let id = lease.push_key();
        let value = Value::map([
            ("id", Value::from(id.as_str())),
            ("author", Value::from(message.author.as_str())),
            ("department", Value::from(message.department.as_str())),
            ("text", Value::from(message.text.as_str())),
            ("timestamp", Value::ServerTimestamp),
        ]);
        lease
            .set(&layout::chat_message(session_id, &id), sanitize(value))
            .await?;
        debug!(session_id, message_id = %id, "Chat message sent");
        Ok(SendOutcome::Sent(id))
    }

    /// One-time read of the whole log.
    pub async fn fetch(&self, session_id: &str) -> SyncResult<Vec<ChatMessage>> {
        let Ok(lease) = self.client.acquire_or_skip("chat_fetch") else {
            return Ok(Vec::new());
        };
        let raw = lease.get_once(&layout::chat(session_id)).await?;
        Ok(order_messages(raw.as_ref()))
    }

    /// The full log, re-delivered in timestamp order on every change.
    pub fn subscribe(&self, session_id: &str) -> Feed<Vec<ChatMessage>> {
        match self.client.acquire_or_skip("chat_subscribe") {
            Ok(lease) => Feed::open(&lease, &layout::chat(session_id), |value| {
                order_messages(value.as_ref())
            }),
            Err(_) => Feed::inert(),
        }
    }

    /// Remove every message of the session in one write.
    pub async fn clear(&self, session_id: &str) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip("chat_clear") {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };
        lease.remove(&layout::chat(session_id)).await?;
        info!(session_id, "Chat cleared");
        Ok(WriteOutcome::Written)
    }

    /// Set `user_name`'s reaction on a message, replacing any previous one.
    /// `None` removes it.
    pub async fn set_reaction(
        &self,
        session_id: &str,
        message_id: &str,
        user_name: &str,
        emoji: Option<&str>,
    ) -> SyncResult<WriteOutcome> {
        let lease = match self.client.acquire_or_skip("chat_reaction") {
            Ok(lease) => lease,
            Err(reason) => return Ok(WriteOutcome::Skipped(reason)),
        };
        let path = layout::chat_reaction(session_id, message_id, &user_key(user_name));
        lease.set(&path, sanitize(Value::from(emoji))).await?;
        Ok(WriteOutcome::Written)
    }
}
