//! Applying AI refinement proposals to parsed guest records.
//!
//! Parser-owned fields keep their existing value unless it is empty.
//! AI-owned fields take any non-empty proposal.

use crate::decode::decode_record;
use crate::model::Guest;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::warn;

/// Fields the refinement step owns outright.
pub const AI_OWNED_FIELDS: [&str; 3] = ["notes", "preferences", "highlights"];

/// One proposed guest, as returned by the refinement service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(flatten)]
    pub fields: Map<String, JsonValue>,
}

impl Refinement {
    pub fn for_guest(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, field: &str, value: JsonValue) -> Self {
        self.fields.insert(field.to_string(), value);
        self
    }
}

/// The refinement returned a different number of guests than it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountMismatch {
    pub expected: usize,
    pub received: usize,
}

impl fmt::Display for CountMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected {} refined guests, received {}",
            self.expected, self.received
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    /// Every input guest, in input order, merged where a proposal paired.
    pub guests: Vec<Guest>,
    /// Number of guests that had a proposal applied.
    pub refined: usize,
    pub mismatch: Option<CountMismatch>,
}

fn is_empty(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        JsonValue::Object(map) => map.is_empty(),
        JsonValue::Bool(_) | JsonValue::Number(_) => false,
    }
}

/// Apply one proposal to one guest.
pub fn merge_refinement(existing: &Guest, proposal: &Refinement) -> Guest {
    let mut record = match serde_json::to_value(existing) {
        Ok(JsonValue::Object(map)) => map,
        _ => return existing.clone(),
    };

    for (key, proposed) in &proposal.fields {
        if key == "id" || is_empty(proposed) {
            continue;
        }
        let adopt = AI_OWNED_FIELDS.contains(&key.as_str())
            || record.get(key).map_or(true, is_empty);
        if adopt {
            record.insert(key.clone(), proposed.clone());
        }
    }

    match decode_record(JsonValue::Object(record)) {
        Ok(merged) => merged,
        Err(e) => {
            warn!(guest_id = %existing.id, error = %e, "Refinement did not fit guest record, keeping original");
            existing.clone()
        }
    }
}

/// Pair proposals with guests and merge them.
///
/// Proposals pair by guest id first. A guest with no id match takes the
/// proposal at its own position, unless that proposal names a different
/// known guest. Guests are never dropped; unpaired ones pass through.
pub fn reconcile_refinements(existing: &[Guest], proposals: &[Refinement]) -> Reconciliation {
    let known: HashSet<&str> = existing.iter().map(|g| g.id.as_str()).collect();
    let mut by_id: HashMap<&str, &Refinement> = HashMap::new();
    for proposal in proposals {
        if let Some(id) = proposal.id.as_deref().filter(|id| known.contains(id)) {
            by_id.entry(id).or_insert(proposal);
        }
    }

    let mut refined = 0;
    let guests = existing
        .iter()
        .enumerate()
        .map(|(position, guest)| {
            let paired = by_id.get(guest.id.as_str()).copied().or_else(|| {
                proposals
                    .get(position)
                    .filter(|p| p.id.as_deref().map_or(true, |id| !known.contains(id)))
            });
            match paired {
                Some(proposal) => {
                    refined += 1;
                    merge_refinement(guest, proposal)
                }
                None => guest.clone(),
            }
        })
        .collect();

    let mismatch = (proposals.len() != existing.len()).then(|| CountMismatch {
        expected: existing.len(),
        received: proposals.len(),
    });
    if let Some(mismatch) = mismatch {
        warn!(%mismatch, "Refinement count mismatch");
    }

    Reconciliation {
        guests,
        refined,
        mismatch,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_existing_field_is_filled() {
        let guest = Guest::new("g1", "Ada");
        let merged = merge_refinement(&guest, &Refinement::for_guest("g1").with("room", json!("12")));
        assert_eq!(merged.room.as_deref(), Some("12"));
    }

    #[test]
    fn empty_proposals_never_erase() {
        let mut guest = Guest::new("g1", "Ada");
        guest.notes = Some("Late arrival".into());
        let proposal = Refinement::for_guest("g1")
            .with("notes", json!("  "))
            .with("name", json!(null));
        let merged = merge_refinement(&guest, &proposal);
        assert_eq!(merged, guest);
    }

    #[test]
    fn zero_counts_as_a_value() {
        let mut guest = Guest::new("g1", "Ada");
        guest.extra.insert("children".into(), json!(0));
        let merged = merge_refinement(&guest, &Refinement::for_guest("g1").with("children", json!(2)));
        assert_eq!(merged.extra["children"], json!(0));
    }

    #[test]
    fn positional_fallback_skips_proposals_for_other_guests() {
        let guests = vec![Guest::new("a", "Ada"), Guest::new("b", "Brian")];
        let proposals = vec![
            Refinement::for_guest("b").with("notes", json!("for b")),
            Refinement::default().with("notes", json!("anonymous")),
        ];
        let result = reconcile_refinements(&guests, &proposals);
        assert_eq!(result.guests[0].notes, None);
        assert_eq!(result.guests[1].notes.as_deref(), Some("for b"));
        assert_eq!(result.refined, 1);
        assert_eq!(result.mismatch, None);
    }
}
