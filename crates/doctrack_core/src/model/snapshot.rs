//! Snapshot record: materialized entity state at the start of one bucket.
//!
//! # Invariants
//! - At most one live snapshot exists per `(entity_id, history_date)`.
//! - `document_fields` lists exactly the keys of `values`.

use crate::model::entity::EntityId;
use crate::model::value::FieldState;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type SnapshotId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub kind: String,
    pub entity_id: EntityId,
    /// First day of the bucket this snapshot materializes.
    pub history_date: NaiveDate,
    pub document_fields: BTreeSet<String>,
    pub values: FieldState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Snapshot {
    /// Creates an unsaved snapshot holding `state`.
    ///
    /// Timestamps are placeholders until the repository stamps them on write.
    pub fn new(
        kind: impl Into<String>,
        entity_id: EntityId,
        history_date: NaiveDate,
        state: FieldState,
    ) -> Self {
        let at = history_date.and_time(NaiveTime::MIN).and_utc();
        let mut snapshot = Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            entity_id,
            history_date,
            document_fields: BTreeSet::new(),
            values: FieldState::new(),
            created_at: at,
            updated_at: at,
            deleted_at: None,
        };
        snapshot.replace_state(state);
        snapshot
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }

    /// Field state carried by this snapshot.
    pub fn state(&self) -> &FieldState {
        &self.values
    }

    /// Overwrites payload and `document_fields` with `state`.
    pub fn replace_state(&mut self, state: FieldState) {
        self.document_fields = state.keys().cloned().collect();
        self.values = state;
    }
}

#[cfg(test)]
mod tests {
    use super::Snapshot;
    use crate::model::value::{FieldState, FieldValue};
    use chrono::NaiveDate;
    use uuid::Uuid;

    #[test]
    fn document_fields_track_state_keys() {
        let mut state = FieldState::new();
        state.insert("title".to_string(), FieldValue::from("X"));
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        let mut snapshot = Snapshot::new("book", Uuid::new_v4(), day, state);
        assert_eq!(
            snapshot.document_fields.iter().collect::<Vec<_>>(),
            vec!["title"]
        );

        let mut next = FieldState::new();
        next.insert("author".to_string(), FieldValue::Null);
        snapshot.replace_state(next);
        assert!(snapshot.document_fields.contains("author"));
        assert!(!snapshot.document_fields.contains("title"));
        assert!(snapshot.is_live());
    }
}
