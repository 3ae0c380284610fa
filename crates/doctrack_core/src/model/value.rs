//! Typed field values carried by changes, snapshots and entities.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

/// Field name → value mapping for one point in an entity's history.
///
/// Ordered so persisted payloads are byte-stable across recomputes.
pub type FieldState = BTreeMap<String, FieldValue>;

/// Declared type of one documented field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Boolean,
    Date,
    /// Identifier of another record (foreign key equivalent).
    Reference,
}

/// One documented field value.
///
/// Every documented field is nullable on changes and snapshots, so `Null`
/// is valid for any [`FieldKind`].
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Boolean(bool),
    Date(NaiveDate),
    Reference(Uuid),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns whether this value may be stored in a field of `kind`.
    pub fn fits(&self, kind: FieldKind) -> bool {
        matches!(
            (self, kind),
            (Self::Null, _)
                | (Self::Text(_), FieldKind::Text)
                | (Self::Integer(_), FieldKind::Integer)
                | (Self::Boolean(_), FieldKind::Boolean)
                | (Self::Date(_), FieldKind::Date)
                | (Self::Reference(_), FieldKind::Reference)
        )
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl Display for FieldValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Text(value) => write!(f, "{value:?}"),
            Self::Integer(value) => write!(f, "{value}"),
            Self::Boolean(value) => write!(f, "{value}"),
            Self::Date(value) => write!(f, "{value}"),
            Self::Reference(value) => write!(f, "{value}"),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(value: NaiveDate) -> Self {
        Self::Date(value)
    }
}

impl From<Uuid> for FieldValue {
    fn from(value: Uuid) -> Self {
        Self::Reference(value)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::{FieldKind, FieldValue};

    #[test]
    fn null_fits_every_kind() {
        for kind in [
            FieldKind::Text,
            FieldKind::Integer,
            FieldKind::Boolean,
            FieldKind::Date,
            FieldKind::Reference,
        ] {
            assert!(FieldValue::Null.fits(kind));
        }
    }

    #[test]
    fn typed_values_reject_other_kinds() {
        assert!(FieldValue::from("x").fits(FieldKind::Text));
        assert!(!FieldValue::from("x").fits(FieldKind::Integer));
        assert!(!FieldValue::from(3_i64).fits(FieldKind::Boolean));
    }

    #[test]
    fn serializes_with_explicit_type_tag() {
        let json = serde_json::to_string(&FieldValue::from("X")).unwrap();
        assert_eq!(json, r#"{"type":"text","value":"X"}"#);
        let null = serde_json::to_string(&FieldValue::Null).unwrap();
        assert_eq!(null, r#"{"type":"null"}"#);
    }
}
