//! Change record: one logged partial update of a documented entity.
//!
//! # Invariants
//! - A change asserts values only for the fields named in `document_fields`.
//! - Drafts and soft-deleted changes never take part in materialization.
//! - Changes are never physically deleted.

use crate::model::entity::EntityId;
use crate::model::schema::{DocumentedSchema, RecordValidationError};
use crate::model::snapshot::SnapshotId;
use crate::model::value::{FieldState, FieldValue};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

pub type ChangeId = Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    /// Schema kind this change belongs to.
    pub kind: String,
    /// Owning entity; `None` until the change is linked or spawns one.
    pub entity_id: Option<EntityId>,
    pub document_name: String,
    /// Logical effective time of the change.
    pub document_date: DateTime<Utc>,
    pub document_link: String,
    pub is_draft: bool,
    /// Field names this change asserts values for.
    pub document_fields: BTreeSet<String>,
    /// Field payload. Entries outside `document_fields` are carried but ignored.
    pub values: FieldState,
    /// Snapshot this change currently contributes to.
    pub snapshot_id: Option<SnapshotId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Change {
    /// Creates a draft change with a fresh id.
    ///
    /// Timestamps are placeholders until the repository stamps them on write.
    pub fn new(
        kind: impl Into<String>,
        document_name: impl Into<String>,
        document_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind: kind.into(),
            entity_id: None,
            document_name: document_name.into(),
            document_date,
            document_link: String::new(),
            is_draft: true,
            document_fields: BTreeSet::new(),
            values: FieldState::new(),
            snapshot_id: None,
            created_at: document_date,
            updated_at: document_date,
            deleted_at: None,
        }
    }

    /// Asserts `value` for `field` and lists the field in `document_fields`.
    pub fn assert_field(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        let field = field.into();
        self.values.insert(field.clone(), value.into());
        self.document_fields.insert(field);
        self
    }

    /// Carries a payload value without asserting it.
    pub fn with_value(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn for_entity(mut self, entity_id: EntityId) -> Self {
        self.entity_id = Some(entity_id);
        self
    }

    pub fn published(mut self) -> Self {
        self.is_draft = false;
        self
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Live, non-draft changes are the only ones materialized into snapshots.
    pub fn is_eligible(&self) -> bool {
        !self.is_draft && !self.is_deleted()
    }

    /// Calendar day (UTC) the change takes effect on.
    pub fn document_day(&self) -> NaiveDate {
        self.document_date.date_naive()
    }

    /// Latest moment this row was touched, counting soft deletion.
    pub fn last_touched_at(&self) -> DateTime<Utc> {
        match self.deleted_at {
            Some(deleted_at) if deleted_at > self.updated_at => deleted_at,
            _ => self.updated_at,
        }
    }

    /// Asserted fields known to `schema`, in name order.
    pub fn asserted_fields<'a>(
        &'a self,
        schema: &'a DocumentedSchema,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.document_fields
            .iter()
            .map(String::as_str)
            .filter(move |field| schema.has_field(field))
    }

    /// Values asserted by this change, restricted to `schema`.
    ///
    /// An asserted field with no payload entry maps to `Null`.
    pub fn asserted_state(&self, schema: &DocumentedSchema) -> FieldState {
        self.asserted_fields(schema)
            .map(|field| {
                let value = self.values.get(field).cloned().unwrap_or_default();
                (field.to_string(), value)
            })
            .collect()
    }

    /// Checks invariants that hold without knowing the schema.
    pub fn validate_record(&self) -> Result<(), RecordValidationError> {
        if self.document_name.trim().is_empty() {
            return Err(RecordValidationError::EmptyDocumentName);
        }
        Ok(())
    }

    /// Validates the change against its schema before persistence.
    pub fn validate(&self, schema: &DocumentedSchema) -> Result<(), RecordValidationError> {
        if self.kind != schema.kind {
            return Err(RecordValidationError::SchemaMismatch {
                expected: schema.kind.clone(),
                actual: self.kind.clone(),
            });
        }
        self.validate_record()?;
        for field in &self.document_fields {
            if !schema.has_field(field) {
                return Err(RecordValidationError::UnknownField {
                    kind: schema.kind.clone(),
                    field: field.clone(),
                });
            }
        }
        schema.check_values(&self.values)
    }
}

#[cfg(test)]
mod tests {
    use super::Change;
    use crate::model::schema::{DocumentedSchema, RecordValidationError};
    use crate::model::value::{FieldKind, FieldValue};
    use chrono::{TimeZone, Utc};

    fn schema() -> DocumentedSchema {
        DocumentedSchema::builder("book")
            .field("title", FieldKind::Text)
            .field("pages", FieldKind::Integer)
            .build()
            .unwrap()
    }

    #[test]
    fn asserted_state_only_covers_document_fields() {
        let change = Change::new("book", "edition", Utc::now())
            .assert_field("title", "X")
            .with_value("pages", 120_i64);
        let state = change.asserted_state(&schema());
        assert_eq!(state.len(), 1);
        assert_eq!(state.get("title"), Some(&FieldValue::from("X")));
    }

    #[test]
    fn asserted_field_without_value_is_null() {
        let mut change = Change::new("book", "edition", Utc::now());
        change.document_fields.insert("pages".to_string());
        let state = change.asserted_state(&schema());
        assert_eq!(state.get("pages"), Some(&FieldValue::Null));
    }

    #[test]
    fn validate_rejects_unknown_and_mistyped_fields() {
        let unknown = Change::new("book", "edition", Utc::now()).assert_field("isbn", "1");
        assert!(matches!(
            unknown.validate(&schema()),
            Err(RecordValidationError::UnknownField { .. })
        ));

        let mistyped = Change::new("book", "edition", Utc::now()).assert_field("pages", "many");
        assert!(matches!(
            mistyped.validate(&schema()),
            Err(RecordValidationError::KindMismatch { .. })
        ));
    }

    #[test]
    fn last_touched_prefers_later_deletion() {
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 8, 0, 0).unwrap();
        let mut change = Change::new("book", "edition", at);
        assert_eq!(change.last_touched_at(), at);
        let later = Utc.with_ymd_and_hms(2024, 1, 2, 8, 0, 0).unwrap();
        change.deleted_at = Some(later);
        assert_eq!(change.last_touched_at(), later);
        assert!(!change.is_eligible());
    }
}
