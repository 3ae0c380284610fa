//! Repository layer abstractions and persistence implementations.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts for changes, snapshots
//!   and documented entities.
//! - Isolate SQLite query details from engine and service orchestration.
//!
//! # Invariants
//! - Every list/get API takes explicit deletion (and draft) flags; nothing is
//!   filtered implicitly.
//! - Repositories stamp `created_at`/`updated_at` from their injected clock.
//! - Read paths reject invalid persisted state instead of masking it.

use crate::clock::millis_to_datetime;
use crate::db::migrations::latest_version;
use crate::db::DbError;
use crate::model::schema::RecordValidationError;
use crate::model::value::FieldState;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod change_repo;
pub mod entity_repo;
pub mod snapshot_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by all record stores.
#[derive(Debug)]
pub enum RepoError {
    /// Record failed validation before a write.
    Validation(RecordValidationError),
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Target record does not exist (or is soft-deleted where that matters).
    NotFound(Uuid),
    /// Persisted data cannot be converted to a valid record.
    InvalidData(String),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    MissingRequiredTable(&'static str),
    MissingRequiredColumn {
        table: &'static str,
        column: &'static str,
    },
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(err) => write!(f, "{err}"),
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound(id) => write!(f, "record not found: {id}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "repository requires schema version {expected_version}, got {actual_version}"
            ),
            Self::MissingRequiredTable(table) => {
                write!(f, "repository requires table `{table}`")
            }
            Self::MissingRequiredColumn { table, column } => {
                write!(f, "repository requires column `{column}` in table `{table}`")
            }
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Db(err) => Some(err),
            Self::NotFound(_) => None,
            Self::InvalidData(_) => None,
            Self::UninitializedConnection { .. } => None,
            Self::MissingRequiredTable(_) => None,
            Self::MissingRequiredColumn { .. } => None,
        }
    }
}

impl From<RecordValidationError> for RepoError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

/// Checks migration version, table and columns before a repository is built.
pub(crate) fn ensure_connection_ready(
    conn: &Connection,
    table: &'static str,
    columns: &[&'static str],
) -> RepoResult<()> {
    let expected_version = latest_version();
    let actual_version: u32 = conn.query_row("PRAGMA user_version;", [], |row| row.get(0))?;
    if actual_version != expected_version {
        return Err(RepoError::UninitializedConnection {
            expected_version,
            actual_version,
        });
    }

    if !table_exists(conn, table)? {
        return Err(RepoError::MissingRequiredTable(table));
    }

    for &column in columns {
        if !table_has_column(conn, table, column)? {
            return Err(RepoError::MissingRequiredColumn { table, column });
        }
    }

    Ok(())
}

fn table_exists(conn: &Connection, table: &str) -> RepoResult<bool> {
    let exists: i64 = conn.query_row(
        "SELECT EXISTS(
            SELECT 1
            FROM sqlite_master
            WHERE type = 'table' AND name = ?1
        );",
        [table],
        |row| row.get(0),
    )?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> RepoResult<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table});"))?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let current: String = row.get(1)?;
        if current == column {
            return Ok(true);
        }
    }
    Ok(false)
}

pub(crate) fn parse_uuid(value: &str, column: &'static str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid `{value}` in {column}")))
}

pub(crate) fn parse_optional_uuid(
    value: Option<String>,
    column: &'static str,
) -> RepoResult<Option<Uuid>> {
    value.map(|text| parse_uuid(&text, column)).transpose()
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn int_to_bool(value: i64, column: &'static str) -> RepoResult<bool> {
    match value {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(RepoError::InvalidData(format!(
            "invalid boolean value `{other}` in {column}"
        ))),
    }
}

pub(crate) fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

pub(crate) fn from_millis(value: i64) -> DateTime<Utc> {
    millis_to_datetime(value)
}

/// UTC midnight of `day` in epoch milliseconds.
pub(crate) fn day_to_millis(day: NaiveDate) -> i64 {
    day.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

pub(crate) fn millis_to_day(value: i64) -> NaiveDate {
    millis_to_datetime(value).date_naive()
}

pub(crate) fn fields_to_json(fields: &BTreeSet<String>) -> RepoResult<String> {
    serde_json::to_string(fields)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode document fields: {err}")))
}

pub(crate) fn fields_from_json(value: &str, column: &'static str) -> RepoResult<BTreeSet<String>> {
    serde_json::from_str(value)
        .map_err(|err| RepoError::InvalidData(format!("invalid field list in {column}: {err}")))
}

pub(crate) fn payload_to_json(values: &FieldState) -> RepoResult<String> {
    serde_json::to_string(values)
        .map_err(|err| RepoError::InvalidData(format!("cannot encode payload: {err}")))
}

pub(crate) fn payload_from_json(value: &str, column: &'static str) -> RepoResult<FieldState> {
    serde_json::from_str(value)
        .map_err(|err| RepoError::InvalidData(format!("invalid payload in {column}: {err}")))
}

/// Renames one key of a field list and payload; returns whether anything moved.
pub(crate) fn rename_field_in(
    fields: &mut BTreeSet<String>,
    values: &mut FieldState,
    old_name: &str,
    new_name: &str,
) -> bool {
    let mut touched = false;
    if fields.remove(old_name) {
        fields.insert(new_name.to_string());
        touched = true;
    }
    if let Some(value) = values.remove(old_name) {
        values.insert(new_name.to_string(), value);
        touched = true;
    }
    touched
}

/// Drops one key from a field list and payload; returns whether anything moved.
pub(crate) fn remove_field_in(
    fields: &mut BTreeSet<String>,
    values: &mut FieldState,
    name: &str,
) -> bool {
    let removed_field = fields.remove(name);
    let removed_value = values.remove(name).is_some();
    removed_field || removed_value
}

#[cfg(test)]
mod tests {
    use super::{day_to_millis, millis_to_day, rename_field_in};
    use crate::model::value::{FieldState, FieldValue};
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    #[test]
    fn day_millis_round_trip_at_midnight() {
        let day = NaiveDate::from_ymd_opt(2023, 12, 31).unwrap();
        let ms = day_to_millis(day);
        assert_eq!(ms % 86_400_000, 0);
        assert_eq!(millis_to_day(ms), day);
        assert_eq!(millis_to_day(ms + 86_399_999), day);
    }

    #[test]
    fn rename_moves_field_and_value() {
        let mut fields: BTreeSet<String> = ["name".to_string()].into_iter().collect();
        let mut values = FieldState::new();
        values.insert("name".to_string(), FieldValue::from("X"));
        assert!(rename_field_in(&mut fields, &mut values, "name", "title"));
        assert!(fields.contains("title"));
        assert_eq!(values.get("title"), Some(&FieldValue::from("X")));
        assert!(!rename_field_in(&mut fields, &mut values, "name", "title"));
    }
}
