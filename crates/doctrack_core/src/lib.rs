//! Core domain logic for doctrack.
//! Documented entities, their change history and materialized snapshots.

pub mod clock;
pub mod config;
pub mod db;
pub mod engine;
pub mod logging;
pub mod model;
pub mod repo;
pub mod service;

pub use clock::{system_clock, Clock, ManualClock, SharedClock, SystemClock};
pub use config::{ConfigError, DocumentsConfig, LoggingConfig};
pub use db::{open_db, open_db_in_memory, DbError};
pub use engine::{
    apply_atomically, parse_as_of_date, ApplyEngine, ApplyOutcome, ChangeApplied,
    ChangeAppliedSink, EngineError, LogSink,
};
pub use logging::{
    default_log_level, init_logging, init_logging_from_config, logging_status, LoggingError,
};
pub use model::change::{Change, ChangeId};
pub use model::entity::{Documented, DocumentedObject, EntityId};
pub use model::schema::{
    DocumentedSchema, FieldSpec, RecordValidationError, SchemaRegistry, SchemaValidationError,
};
pub use model::snapshot::{Snapshot, SnapshotId};
pub use model::value::{FieldKind, FieldState, FieldValue};
pub use repo::{RepoError, RepoResult};
pub use service::{DocumentService, PostponedReport, ServiceError, ServiceResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::core_version;

    #[test]
    fn version_is_not_empty() {
        assert!(!core_version().is_empty());
    }
}
