use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::id::ParticipantId;

/// Presence channel membership record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn new(participant_id: ParticipantId, display_name: impl Into<String>) -> Self {
        Self {
            participant_id,
            display_name: display_name.into(),
            joined_at: Utc::now(),
        }
    }
}

/// A connected identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl Participant {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }

    #[must_use]
    pub fn presence_record(&self) -> PresenceRecord {
        PresenceRecord::new(self.id.clone(), self.display_name.clone())
    }
}

/// Who is in the room, keyed by participant id
///
/// Replaced atomically on every presence sync.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSnapshot {
    members: BTreeMap<ParticipantId, PresenceRecord>,
}

/// Membership change between two snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresenceDelta {
    pub joined: Vec<ParticipantId>,
    pub left: Vec<ParticipantId>,
}

impl PresenceDelta {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.joined.is_empty() && self.left.is_empty()
    }
}

impl PresenceSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: impl IntoIterator<Item = PresenceRecord>) -> Self {
        Self {
            members: records
                .into_iter()
                .map(|record| (record.participant_id.clone(), record))
                .collect(),
        }
    }

    pub fn insert(&mut self, record: PresenceRecord) {
        self.members.insert(record.participant_id.clone(), record);
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<PresenceRecord> {
        self.members.remove(id)
    }

    #[must_use]
    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.members.contains_key(id)
    }

    #[must_use]
    pub fn display_name(&self, id: &ParticipantId) -> Option<&str> {
        self.members.get(id).map(|record| record.display_name.as_str())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ParticipantId> {
        self.members.keys()
    }

    /// Everyone except `local`
    pub fn others<'a>(&'a self, local: &'a ParticipantId) -> impl Iterator<Item = &'a ParticipantId> {
        self.members.keys().filter(move |id| *id != local)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.members.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Ids present here but not in `previous` (joined) and the reverse (left)
    #[must_use]
    pub fn diff(&self, previous: &Self) -> PresenceDelta {
        PresenceDelta {
            joined: self
                .members
                .keys()
                .filter(|id| !previous.members.contains_key(*id))
                .cloned()
                .collect(),
            left: previous
                .members
                .keys()
                .filter(|id| !self.members.contains_key(*id))
                .cloned()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(ids: &[&str]) -> PresenceSnapshot {
        PresenceSnapshot::from_records(
            ids.iter()
                .map(|id| PresenceRecord::new(ParticipantId::from(*id), id.to_uppercase())),
        )
    }

    #[test]
    fn test_diff_reports_joins_and_leaves() {
        let before = snapshot(&["a", "b"]);
        let after = snapshot(&["b", "c"]);

        let delta = after.diff(&before);
        assert_eq!(delta.joined, vec![ParticipantId::from("c")]);
        assert_eq!(delta.left, vec![ParticipantId::from("a")]);
        assert!(after.diff(&after).is_empty());
    }

    #[test]
    fn test_empty_snapshot_means_everyone_left() {
        let before = snapshot(&["a", "b"]);
        let delta = PresenceSnapshot::new().diff(&before);
        assert_eq!(delta.left.len(), 2);
        assert!(delta.joined.is_empty());
    }

    #[test]
    fn test_others_excludes_local() {
        let snap = snapshot(&["a", "b", "c"]);
        let local = ParticipantId::from("b");
        let others: Vec<_> = snap.others(&local).cloned().collect();
        assert_eq!(others, vec![ParticipantId::from("a"), ParticipantId::from("c")]);
        assert_eq!(snap.display_name(&local), Some("B"));
    }
}
