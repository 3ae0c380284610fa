//! Documented schema declaration, validation and registry.
//!
//! # Responsibility
//! - Describe which fields of a documented entity are tracked by changes and
//!   materialized into snapshots, and at which bucket width.
//! - Validate declarations once, at registration time, instead of
//!   synthesizing record types at runtime.
//!
//! # Invariants
//! - `1 <= unit_size_in_days <= MAX_UNIT_SIZE_IN_DAYS`.
//! - Field names are unique, lowercase identifiers and never collide with
//!   record bookkeeping columns.
//! - A registry holds at most one schema per `kind`.

use crate::model::value::{FieldKind, FieldState, FieldValue};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

static IDENTIFIER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_]*$").expect("valid identifier regex"));

const RESERVED_FIELD_NAMES: &[&str] = &[
    "id",
    "uuid",
    "kind",
    "entity",
    "snapshot",
    "history_date",
    "created_at",
    "updated_at",
    "deleted_at",
];
const RESERVED_FIELD_PREFIX: &str = "document_";

/// Widest accepted bucket, roughly one century.
pub const MAX_UNIT_SIZE_IN_DAYS: u32 = 36_500;

/// Checks that a bucket width is usable for date arithmetic.
pub fn check_unit_size(value: u32) -> Result<(), SchemaValidationError> {
    if value == 0 {
        return Err(SchemaValidationError::InvalidUnitSize(value));
    }
    if value > MAX_UNIT_SIZE_IN_DAYS {
        return Err(SchemaValidationError::UnitSizeTooLarge(value));
    }
    Ok(())
}

/// One field in a documented schema manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
    /// Required fields must be non-null on the live entity.
    #[serde(default)]
    pub required: bool,
}

/// Declaration of one documented entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentedSchema {
    /// Stable type name, e.g. `book`.
    pub kind: String,
    /// Bucket width used when slicing history into snapshots.
    #[serde(default = "default_unit_size")]
    pub unit_size_in_days: u32,
    pub fields: Vec<FieldSpec>,
}

fn default_unit_size() -> u32 {
    1
}

impl DocumentedSchema {
    /// Starts a builder for schema `kind`.
    pub fn builder(kind: impl Into<String>) -> DocumentedSchemaBuilder {
        DocumentedSchemaBuilder {
            schema: DocumentedSchema {
                kind: kind.into(),
                unit_size_in_days: 1,
                fields: Vec::new(),
            },
        }
    }

    /// Validates declaration-level invariants.
    pub fn validate(&self) -> Result<(), SchemaValidationError> {
        if !IDENTIFIER_RE.is_match(self.kind.as_str()) {
            return Err(SchemaValidationError::InvalidKind(self.kind.clone()));
        }
        check_unit_size(self.unit_size_in_days)?;
        if self.fields.is_empty() {
            return Err(SchemaValidationError::NoFields(self.kind.clone()));
        }

        let mut seen = BTreeSet::new();
        for field in &self.fields {
            let name = field.name.as_str();
            if !IDENTIFIER_RE.is_match(name) {
                return Err(SchemaValidationError::InvalidFieldName(field.name.clone()));
            }
            if RESERVED_FIELD_NAMES.contains(&name) || name.starts_with(RESERVED_FIELD_PREFIX) {
                return Err(SchemaValidationError::ReservedFieldName(field.name.clone()));
            }
            if !seen.insert(name) {
                return Err(SchemaValidationError::DuplicateField(field.name.clone()));
            }
        }
        Ok(())
    }

    /// Looks up one field declaration.
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Iterates declared field names in declaration order.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|field| field.name.as_str())
    }

    /// Checks that every entry of `values` is a declared field holding a value
    /// of the declared kind.
    pub fn check_values(&self, values: &FieldState) -> Result<(), RecordValidationError> {
        for (name, value) in values {
            self.check_value(name, value)?;
        }
        Ok(())
    }

    /// Checks one field/value pair against the declaration.
    pub fn check_value(&self, name: &str, value: &FieldValue) -> Result<(), RecordValidationError> {
        let spec = self
            .field(name)
            .ok_or_else(|| RecordValidationError::UnknownField {
                kind: self.kind.clone(),
                field: name.to_string(),
            })?;
        if !value.fits(spec.kind) {
            return Err(RecordValidationError::KindMismatch {
                field: name.to_string(),
                expected: spec.kind,
            });
        }
        Ok(())
    }

    /// Checks that every required field holds a non-null value.
    pub fn check_required(&self, values: &FieldState) -> Result<(), RecordValidationError> {
        for spec in self.fields.iter().filter(|spec| spec.required) {
            let present = values
                .get(spec.name.as_str())
                .is_some_and(|value| !value.is_null());
            if !present {
                return Err(RecordValidationError::MissingRequiredField(
                    spec.name.clone(),
                ));
            }
        }
        Ok(())
    }
}

/// Fluent builder for [`DocumentedSchema`].
#[derive(Debug, Clone)]
pub struct DocumentedSchemaBuilder {
    schema: DocumentedSchema,
}

impl DocumentedSchemaBuilder {
    pub fn unit_size_in_days(mut self, days: u32) -> Self {
        self.schema.unit_size_in_days = days;
        self
    }

    /// Adds an optional field.
    pub fn field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.schema.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: false,
        });
        self
    }

    /// Adds a required field.
    pub fn required(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.schema.fields.push(FieldSpec {
            name: name.into(),
            kind,
            required: true,
        });
        self
    }

    /// Validates and returns the schema.
    pub fn build(self) -> Result<DocumentedSchema, SchemaValidationError> {
        self.schema.validate()?;
        Ok(self.schema)
    }
}

/// In-process registry of validated schemas, keyed by kind.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    entries: BTreeMap<String, Arc<DocumentedSchema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one schema after validation.
    pub fn register(
        &mut self,
        schema: DocumentedSchema,
    ) -> Result<Arc<DocumentedSchema>, SchemaValidationError> {
        schema.validate()?;
        if self.entries.contains_key(schema.kind.as_str()) {
            return Err(SchemaValidationError::DuplicateKind(schema.kind));
        }
        let kind = schema.kind.clone();
        let schema = Arc::new(schema);
        self.entries.insert(kind, Arc::clone(&schema));
        Ok(schema)
    }

    /// Builds a registry from a list of declarations.
    pub fn from_schemas(
        schemas: impl IntoIterator<Item = DocumentedSchema>,
    ) -> Result<Self, SchemaValidationError> {
        let mut registry = Self::new();
        for schema in schemas {
            registry.register(schema)?;
        }
        Ok(registry)
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<DocumentedSchema>> {
        self.entries.get(kind)
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Schema declaration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaValidationError {
    InvalidKind(String),
    InvalidUnitSize(u32),
    UnitSizeTooLarge(u32),
    NoFields(String),
    InvalidFieldName(String),
    ReservedFieldName(String),
    DuplicateField(String),
    DuplicateKind(String),
}

impl Display for SchemaValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidKind(value) => write!(f, "schema kind is invalid: `{value}`"),
            Self::InvalidUnitSize(value) => {
                write!(f, "unit_size_in_days must be at least 1, got {value}")
            }
            Self::UnitSizeTooLarge(value) => write!(
                f,
                "unit_size_in_days must be at most {MAX_UNIT_SIZE_IN_DAYS}, got {value}"
            ),
            Self::NoFields(kind) => write!(f, "schema `{kind}` declares no fields"),
            Self::InvalidFieldName(value) => write!(f, "field name is invalid: `{value}`"),
            Self::ReservedFieldName(value) => write!(f, "field name is reserved: `{value}`"),
            Self::DuplicateField(value) => write!(f, "field is declared twice: `{value}`"),
            Self::DuplicateKind(value) => write!(f, "schema kind already registered: `{value}`"),
        }
    }
}

impl Error for SchemaValidationError {}

/// Record-level validation errors for changes and entities.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordValidationError {
    UnknownField { kind: String, field: String },
    KindMismatch { field: String, expected: FieldKind },
    MissingRequiredField(String),
    SchemaMismatch { expected: String, actual: String },
    EmptyDocumentName,
}

impl Display for RecordValidationError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownField { kind, field } => {
                write!(f, "field `{field}` is not declared by schema `{kind}`")
            }
            Self::KindMismatch { field, expected } => {
                write!(f, "field `{field}` expects a {expected:?} value")
            }
            Self::MissingRequiredField(field) => write!(f, "required field `{field}` is empty"),
            Self::SchemaMismatch { expected, actual } => {
                write!(f, "record kind `{actual}` does not match schema `{expected}`")
            }
            Self::EmptyDocumentName => write!(f, "document name must not be blank"),
        }
    }
}

impl Error for RecordValidationError {}

#[cfg(test)]
mod tests {
    use super::{DocumentedSchema, SchemaRegistry, SchemaValidationError, MAX_UNIT_SIZE_IN_DAYS};
    use crate::model::value::FieldKind;

    fn book() -> DocumentedSchema {
        DocumentedSchema::builder("book")
            .required("title", FieldKind::Text)
            .field("author", FieldKind::Reference)
            .build()
            .expect("book schema")
    }

    #[test]
    fn builder_defaults_to_daily_buckets() {
        assert_eq!(book().unit_size_in_days, 1);
    }

    #[test]
    fn rejects_zero_unit_size() {
        let err = DocumentedSchema::builder("book")
            .unit_size_in_days(0)
            .field("title", FieldKind::Text)
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaValidationError::InvalidUnitSize(0));
    }

    #[test]
    fn rejects_unit_size_beyond_date_range() {
        let err = DocumentedSchema::builder("book")
            .unit_size_in_days(200_000_000)
            .field("title", FieldKind::Text)
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaValidationError::UnitSizeTooLarge(200_000_000));

        let widest = DocumentedSchema::builder("book")
            .unit_size_in_days(MAX_UNIT_SIZE_IN_DAYS)
            .field("title", FieldKind::Text)
            .build()
            .expect("widest unit size is accepted");
        assert_eq!(widest.unit_size_in_days, MAX_UNIT_SIZE_IN_DAYS);
    }

    #[test]
    fn rejects_reserved_and_duplicate_fields() {
        let reserved = DocumentedSchema::builder("book")
            .field("document_date", FieldKind::Date)
            .build()
            .unwrap_err();
        assert!(matches!(reserved, SchemaValidationError::ReservedFieldName(_)));

        let duplicate = DocumentedSchema::builder("book")
            .field("title", FieldKind::Text)
            .field("title", FieldKind::Text)
            .build()
            .unwrap_err();
        assert_eq!(
            duplicate,
            SchemaValidationError::DuplicateField("title".to_string())
        );
    }

    #[test]
    fn rejects_invalid_identifiers() {
        let err = DocumentedSchema::builder("Book Store")
            .field("title", FieldKind::Text)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaValidationError::InvalidKind(_)));
    }

    #[test]
    fn registry_rejects_duplicate_kind() {
        let mut registry = SchemaRegistry::new();
        registry.register(book()).expect("first registration");
        let err = registry.register(book()).unwrap_err();
        assert_eq!(err, SchemaValidationError::DuplicateKind("book".to_string()));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn deserializes_manifest_with_optional_required_flag() {
        let schema: DocumentedSchema = serde_json::from_str(
            r#"{"kind":"book","unit_size_in_days":7,
                "fields":[{"name":"title","kind":"text","required":true},
                          {"name":"isbn","kind":"text"}]}"#,
        )
        .unwrap();
        assert!(schema.validate().is_ok());
        assert!(!schema.field("isbn").unwrap().required);
    }
}
