//! Snapshot materialization engine.
//!
//! # Responsibility
//! - Slice an entity's change history into buckets of `unit_size_in_days`.
//! - Recompute only stale buckets and forward-fill the rest.
//! - Apply the newest materialized state onto the live entity.
//!
//! # Invariants
//! - Buckets are processed strictly in ascending order; inherited state only
//!   comes from earlier buckets of the same run.
//! - Drafts and soft-deleted changes never shape a bucket.
//! - More than one live snapshot inside one bucket aborts the run.
//!
//! # See also
//! - `db::with_immediate_transaction` for the locking model.

use crate::model::entity::EntityId;
use crate::model::schema::SchemaValidationError;
use crate::repo::RepoError;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use std::error::Error;
use std::fmt::{Display, Formatter};

pub mod apply;
pub mod calculator;
pub mod notify;
pub mod slicer;

pub use apply::{apply_atomically, ApplyEngine, ApplyOutcome};
pub use calculator::SnapshotCalculator;
pub use notify::{ChangeApplied, ChangeAppliedSink, LogSink};
pub use slicer::{buckets, Bucket, SnapshotsSlicer};

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors raised while materializing snapshots.
#[derive(Debug)]
pub enum EngineError {
    /// The entity has no persistent identity yet.
    ObservableInstanceRequired,
    /// The as-of value carries a time component; only calendar dates apply.
    InvalidCutoffGranularity(String),
    /// The as-of value is not a date at all.
    InvalidCutoffDate(String),
    /// The entity has no changes, so there is nothing to materialize.
    ChangesNotYetCreated(EntityId),
    /// A bucket holds more than one live snapshot.
    SnapshotDuplicateExists {
        entity_id: EntityId,
        history_date: NaiveDate,
        live_count: usize,
    },
    /// The schema cannot be sliced, e.g. a hand-built one that skipped validation.
    InvalidSchema(SchemaValidationError),
    Repo(RepoError),
}

impl Display for EngineError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ObservableInstanceRequired => {
                write!(f, "entity must be saved before documents can be applied")
            }
            Self::InvalidCutoffGranularity(value) => {
                write!(f, "as-of value `{value}` must be a date without time")
            }
            Self::InvalidCutoffDate(value) => {
                write!(f, "as-of value `{value}` is not a YYYY-MM-DD date")
            }
            Self::ChangesNotYetCreated(id) => write!(f, "no changes recorded for entity {id}"),
            Self::SnapshotDuplicateExists {
                entity_id,
                history_date,
                live_count,
            } => write!(
                f,
                "entity {entity_id} has {live_count} live snapshots in the bucket starting {history_date}"
            ),
            Self::InvalidSchema(err) => write!(f, "schema cannot be applied: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for EngineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidSchema(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for EngineError {
    fn from(value: RepoError) -> Self {
        Self::Repo(value)
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

/// Parses a textual as-of value into a calendar date.
///
/// Accepts `YYYY-MM-DD`. Timestamps are rejected with
/// [`EngineError::InvalidCutoffGranularity`] instead of being truncated.
pub fn parse_as_of_date(value: &str) -> EngineResult<NaiveDate> {
    let trimmed = value.trim();
    if let Ok(day) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(day);
    }

    let has_time = DateTime::parse_from_rfc3339(trimmed).is_ok()
        || ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
            .iter()
            .any(|format| NaiveDateTime::parse_from_str(trimmed, format).is_ok());
    if has_time {
        return Err(EngineError::InvalidCutoffGranularity(value.to_string()));
    }

    Err(EngineError::InvalidCutoffDate(value.to_string()))
}
