//! Tree paths and the data layout of the hotel-ops database.

use crate::{TransportError, TransportResult};
use std::fmt;

/// Characters the backing store forbids inside a key.
const FORBIDDEN_KEY_CHARS: [char; 6] = ['.', '#', '$', '[', ']', '/'];

/// Root of the backend's read-only metadata subtree.
const INFO_SEGMENT: &str = ".info";

/// A slash-separated location in the document tree.
///
/// Segments are stored verbatim; [`DbPath::validate`] is applied by the
/// transports before any read or write so that builders stay infallible.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DbPath {
    segments: Vec<String>,
}

impl DbPath {
    /// The tree root.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse `a/b/c`. Leading, trailing and doubled slashes are ignored.
    pub fn parse(raw: &str) -> TransportResult<Self> {
        let path = Self {
            segments: raw
                .split('/')
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
        };
        path.validate()?;
        Ok(path)
    }

    /// Append one segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(segment.into());
        Self { segments }
    }

    /// Append every segment of `other`.
    pub fn join(&self, other: &DbPath) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        Self { segments }
    }

    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.segments.split_last()?;
        Some(Self {
            segments: head.to_vec(),
        })
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn last(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True if `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &DbPath) -> bool {
        other.segments.starts_with(&self.segments)
    }

    /// True if `self` is a strict ancestor of `other`.
    pub fn is_ancestor_of(&self, other: &DbPath) -> bool {
        self.segments.len() < other.segments.len() && self.contains(other)
    }

    /// True if one path contains the other.
    pub fn overlaps(&self, other: &DbPath) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// Paths under `.info` are backend metadata and cannot be written.
    pub fn is_metadata(&self) -> bool {
        self.segments.first().is_some_and(|s| s == INFO_SEGMENT)
    }

    /// Check every segment against the store's key rules.
    pub fn validate(&self) -> TransportResult<()> {
        for (index, segment) in self.segments.iter().enumerate() {
            if index == 0 && segment == INFO_SEGMENT {
                continue;
            }
            if segment.is_empty()
                || segment.chars().any(|c| FORBIDDEN_KEY_CHARS.contains(&c) || c.is_control())
            {
                return Err(TransportError::InvalidPath(format!(
                    "segment {segment:?} in {self}"
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Display for DbPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        f.write_str(&self.segments.join("/"))
    }
}

/// Turn a user-supplied name into a usable key by replacing every
/// forbidden character with `_`. Blank names map to `_`.
pub fn user_key(name: &str) -> String {
    let key: String = name
        .trim()
        .chars()
        .map(|c| {
            if FORBIDDEN_KEY_CHARS.contains(&c) || c.is_control() {
                '_'
            } else {
                c
            }
        })
        .collect();
    if key.is_empty() {
        "_".to_string()
    } else {
        key
    }
}

/// Builders for every location the sync layer reads or writes.
pub mod layout {
    use super::DbPath;

    fn root(name: &str) -> DbPath {
        DbPath::root().child(name)
    }

    /// `.info/connected`, the backend's per-client connected flag.
    pub fn info_connected() -> DbPath {
        root(super::INFO_SEGMENT).child("connected")
    }

    pub fn sessions() -> DbPath {
        root("sessions")
    }

    pub fn session(session_id: &str) -> DbPath {
        sessions().child(session_id)
    }

    pub fn session_guests(session_id: &str) -> DbPath {
        session(session_id).child("guests")
    }

    pub fn session_last_modified(session_id: &str) -> DbPath {
        session(session_id).child("lastModified")
    }

    /// `sessions/{id}/guests/{index}/{field}`
    pub fn guest_field(session_id: &str, index: usize, field: &str) -> DbPath {
        session_guests(session_id)
            .child(index.to_string())
            .child(field)
    }

    pub fn presence_root() -> DbPath {
        root("presence")
    }

    pub fn presence_session(session_id: &str) -> DbPath {
        presence_root().child(session_id)
    }

    pub fn presence_entry(session_id: &str, device_id: &str) -> DbPath {
        presence_session(session_id).child(device_id)
    }

    pub fn heartbeat(session_id: &str, device_id: &str) -> DbPath {
        root("heartbeat").child(session_id).child(device_id)
    }

    /// Location streamed by the REST transport to learn whether the
    /// backend is reachable.
    pub fn connection_probe() -> DbPath {
        root("heartbeat").child("_probe")
    }

    pub fn chat(session_id: &str) -> DbPath {
        root("chat").child(session_id)
    }

    pub fn chat_message(session_id: &str, message_id: &str) -> DbPath {
        chat(session_id).child(message_id)
    }

    pub fn chat_reaction(session_id: &str, message_id: &str, user_key: &str) -> DbPath {
        chat_message(session_id, message_id)
            .child("reactions")
            .child(user_key)
    }

    pub fn typing(session_id: &str) -> DbPath {
        root("typing").child(session_id)
    }

    pub fn typing_entry(session_id: &str, user_key: &str) -> DbPath {
        typing(session_id).child(user_key)
    }

    pub fn handovers_for_date(date: &str) -> DbPath {
        root("handovers").child(date)
    }

    pub fn handover(date: &str, department: &str) -> DbPath {
        handovers_for_date(date).child(department)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let path = DbPath::parse("/sessions//s1/guests/").unwrap();
        assert_eq!(path.segments(), ["sessions", "s1", "guests"]);
        assert_eq!(path.to_string(), "sessions/s1/guests");
        assert_eq!(DbPath::root().to_string(), "/");
    }

    #[test]
    fn forbidden_characters_are_rejected() {
        assert!(DbPath::parse("typing/s1/ana.souza").is_err());
        assert!(DbPath::parse("chat/s1/a#b").is_err());
        assert!(DbPath::root().child("").validate().is_err());
        assert!(layout::info_connected().validate().is_ok());
        assert!(DbPath::parse("sessions/.info").is_err());
    }

    #[test]
    fn ancestry() {
        let session = layout::session("s1");
        let field = layout::guest_field("s1", 3, "room");
        assert!(session.is_ancestor_of(&field));
        assert!(!field.is_ancestor_of(&session));
        assert!(!session.is_ancestor_of(&session));
        assert!(session.contains(&session));
        assert!(field.overlaps(&session));
        assert!(!layout::session("s10").overlaps(&session));
    }

    #[test]
    fn ordering_puts_ancestors_first() {
        let mut paths = vec![
            layout::guest_field("s1", 0, "room"),
            layout::session("s1"),
            layout::session_last_modified("s1"),
        ];
        paths.sort();
        assert_eq!(paths[0], layout::session("s1"));
    }

    #[test]
    fn user_key_replaces_forbidden_chars() {
        assert_eq!(user_key("ana.souza"), "ana_souza");
        assert_eq!(user_key(" Front#Desk/2 "), "Front_Desk_2");
        assert_eq!(user_key("[$]"), "___");
        assert_eq!(user_key("   "), "_");
        assert!(DbPath::root().child(user_key("a.b#c")).validate().is_ok());
    }

    #[test]
    fn layout_paths() {
        assert_eq!(
            layout::guest_field("2024-06-01", 2, "roomStatus").to_string(),
            "sessions/2024-06-01/guests/2/roomStatus"
        );
        assert_eq!(
            layout::chat_reaction("s1", "-Nabc", "ana").to_string(),
            "chat/s1/-Nabc/reactions/ana"
        );
        assert_eq!(
            layout::handover("2024-06-01", "frontdesk").to_string(),
            "handovers/2024-06-01/frontdesk"
        );
        assert!(layout::info_connected().is_metadata());
    }
}
