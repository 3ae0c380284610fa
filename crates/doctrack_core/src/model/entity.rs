//! Live documented entities and the seam the engine mutates them through.
//!
//! # Responsibility
//! - Define [`Documented`], the contract any application entity implements
//!   to receive materialized state.
//! - Provide [`DocumentedObject`], a schema-driven entity persisted by
//!   `repo::entity_repo`.
//!
//! # Invariants
//! - An entity without an id cannot be materialized.
//! - A live entity keeps every required field non-null.

use crate::model::schema::{DocumentedSchema, RecordValidationError};
use crate::model::value::{FieldState, FieldValue};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

pub type EntityId = Uuid;

/// Entity whose documented fields are driven by its change history.
pub trait Documented {
    /// Persistent identity, `None` while the entity is unsaved.
    fn entity_id(&self) -> Option<EntityId>;

    fn schema(&self) -> &DocumentedSchema;

    /// Current value of a documented field; unknown fields read as `Null`.
    fn field_value(&self, field: &str) -> FieldValue;

    fn set_field_value(&mut self, field: &str, value: FieldValue);
}

/// Generic documented entity backed by a registered schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentedObject {
    pub id: Option<EntityId>,
    pub schema: Arc<DocumentedSchema>,
    pub values: FieldState,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl DocumentedObject {
    /// Creates an unsaved entity with no field values.
    pub fn new(schema: Arc<DocumentedSchema>) -> Self {
        Self {
            id: None,
            schema,
            values: FieldState::new(),
            created_at: None,
            updated_at: None,
            deleted_at: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.values.insert(field.into(), value.into());
        self
    }

    pub fn kind(&self) -> &str {
        self.schema.kind.as_str()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Validates field values against the schema.
    ///
    /// Required fields are only enforced while the entity is live.
    pub fn validate(&self) -> Result<(), RecordValidationError> {
        self.schema.check_values(&self.values)?;
        if !self.is_deleted() {
            self.schema.check_required(&self.values)?;
        }
        Ok(())
    }
}

impl Documented for DocumentedObject {
    fn entity_id(&self) -> Option<EntityId> {
        self.id
    }

    fn schema(&self) -> &DocumentedSchema {
        &self.schema
    }

    fn field_value(&self, field: &str) -> FieldValue {
        self.values.get(field).cloned().unwrap_or_default()
    }

    fn set_field_value(&mut self, field: &str, value: FieldValue) {
        self.values.insert(field.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::{Documented, DocumentedObject};
    use crate::model::schema::{DocumentedSchema, RecordValidationError};
    use crate::model::value::{FieldKind, FieldValue};
    use chrono::Utc;
    use std::sync::Arc;

    fn schema() -> Arc<DocumentedSchema> {
        Arc::new(
            DocumentedSchema::builder("book")
                .required("title", FieldKind::Text)
                .field("pages", FieldKind::Integer)
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn missing_field_reads_as_null() {
        let object = DocumentedObject::new(schema());
        assert_eq!(object.field_value("pages"), FieldValue::Null);
    }

    #[test]
    fn required_fields_only_enforced_while_live() {
        let mut object = DocumentedObject::new(schema()).with_field("pages", 10_i64);
        assert_eq!(
            object.validate(),
            Err(RecordValidationError::MissingRequiredField(
                "title".to_string()
            ))
        );
        object.deleted_at = Some(Utc::now());
        assert!(object.validate().is_ok());
    }
}
