//! Documented entity use-case service.
//!
//! # Responsibility
//! - Persist changes and entities, then re-apply the owning entity's history.
//! - Cascade entity deletion to its changes and snapshots.
//! - Run the postponed-documents batch and schema maintenance rewrites.
//!
//! # Invariants
//! - Every public write runs in one immediate transaction; apply failures
//!   roll back the write that triggered them.
//! - `BusinessEntityCreationNotAllowed` is raised before anything is written.
//! - Notifications go out only after the transaction committed.

use crate::clock::{system_clock, SharedClock};
use crate::db::with_immediate_transaction;
use crate::engine::{ApplyEngine, ApplyOutcome, ChangeAppliedSink, EngineError, LogSink};
use crate::model::change::{Change, ChangeId};
use crate::model::entity::{DocumentedObject, EntityId};
use crate::model::schema::{DocumentedSchema, RecordValidationError, SchemaRegistry};
use crate::model::snapshot::Snapshot;
use crate::repo::change_repo::{ChangeListQuery, ChangeRepository, SqliteChangeRepository};
use crate::repo::entity_repo::{EntityRepository, SqliteEntityRepository};
use crate::repo::snapshot_repo::{SnapshotListQuery, SnapshotRepository, SqliteSnapshotRepository};
use crate::repo::RepoError;
use chrono::{Duration, NaiveDate, NaiveTime};
use log::info;
use rusqlite::Connection;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors from document service operations.
#[derive(Debug)]
pub enum ServiceError {
    /// A published change has no entity and entity creation is disabled.
    BusinessEntityCreationNotAllowed(ChangeId),
    /// No schema is registered for the kind.
    UnknownSchema(String),
    /// Target entity does not exist or is soft-deleted.
    EntityNotFound(EntityId),
    /// Target change does not exist or is soft-deleted.
    ChangeNotFound(ChangeId),
    Validation(RecordValidationError),
    Engine(EngineError),
    Repo(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BusinessEntityCreationNotAllowed(id) => write!(
                f,
                "change {id} has no entity and creating one from changes is disabled"
            ),
            Self::UnknownSchema(kind) => write!(f, "no documented schema registered for `{kind}`"),
            Self::EntityNotFound(id) => write!(f, "documented entity not found: {id}"),
            Self::ChangeNotFound(id) => write!(f, "change not found: {id}"),
            Self::Validation(err) => write!(f, "{err}"),
            Self::Engine(err) => write!(f, "{err}"),
            Self::Repo(err) => write!(f, "{err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Validation(err) => Some(err),
            Self::Engine(err) => Some(err),
            Self::Repo(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RecordValidationError> for ServiceError {
    fn from(value: RecordValidationError) -> Self {
        Self::Validation(value)
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::Validation(err) => Self::Validation(err),
            other => Self::Repo(other),
        }
    }
}

impl From<EngineError> for ServiceError {
    fn from(value: EngineError) -> Self {
        match value {
            EngineError::Repo(err) => Self::from(err),
            other => Self::Engine(other),
        }
    }
}

impl From<rusqlite::Error> for ServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(RepoError::from(value))
    }
}

/// Summary of one postponed-documents run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostponedReport {
    pub kind: String,
    pub day: NaiveDate,
    /// Entities re-applied with the day as cutoff.
    pub applied: Vec<EntityId>,
    /// Changes without entity plus entities that are gone.
    pub skipped: usize,
}

/// Repositories bound to one transaction.
struct TxRepos<'tx> {
    changes: SqliteChangeRepository<'tx>,
    snapshots: SqliteSnapshotRepository<'tx>,
    entities: SqliteEntityRepository<'tx>,
}

impl<'tx> TxRepos<'tx> {
    fn open(conn: &'tx Connection, clock: &SharedClock) -> ServiceResult<Self> {
        Ok(Self {
            changes: SqliteChangeRepository::try_new(conn, Arc::clone(clock))?,
            snapshots: SqliteSnapshotRepository::try_new(conn, Arc::clone(clock))?,
            entities: SqliteEntityRepository::try_new(conn, Arc::clone(clock))?,
        })
    }

    fn engine(&self) -> ApplyEngine<'_, SqliteChangeRepository<'tx>, SqliteSnapshotRepository<'tx>> {
        ApplyEngine::new(&self.changes, &self.snapshots)
    }
}

/// Use-case facade over changes, snapshots and documented entities.
pub struct DocumentService<'conn> {
    conn: &'conn Connection,
    registry: Arc<SchemaRegistry>,
    create_entity_after_change_created: bool,
    clock: SharedClock,
    sink: Box<dyn ChangeAppliedSink + 'conn>,
}

impl<'conn> DocumentService<'conn> {
    /// Creates a service with the system clock and a [`LogSink`].
    pub fn new(conn: &'conn Connection, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            conn,
            registry,
            create_entity_after_change_created: false,
            clock: system_clock(),
            sink: Box::new(LogSink),
        }
    }

    /// Lets published changes without an entity create one from their fields.
    pub fn create_entity_after_change_created(mut self, enabled: bool) -> Self {
        self.create_entity_after_change_created = enabled;
        self
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sink(mut self, sink: impl ChangeAppliedSink + 'conn) -> Self {
        self.sink = Box::new(sink);
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Returns the registered schema for `kind`.
    pub fn schema(&self, kind: &str) -> ServiceResult<Arc<DocumentedSchema>> {
        self.registry
            .get(kind)
            .cloned()
            .ok_or_else(|| ServiceError::UnknownSchema(kind.to_string()))
    }

    /// Starts an unsaved entity of `kind`.
    pub fn new_entity(&self, kind: &str) -> ServiceResult<DocumentedObject> {
        Ok(DocumentedObject::new(self.schema(kind)?))
    }

    pub fn get_entity(
        &self,
        kind: &str,
        id: EntityId,
        include_deleted: bool,
    ) -> ServiceResult<Option<DocumentedObject>> {
        let schema = self.schema(kind)?;
        let repo = SqliteEntityRepository::try_new(self.conn, Arc::clone(&self.clock))?;
        Ok(repo.get_entity(&schema, id, include_deleted)?)
    }

    pub fn get_change(&self, id: ChangeId, include_deleted: bool) -> ServiceResult<Option<Change>> {
        let repo = SqliteChangeRepository::try_new(self.conn, Arc::clone(&self.clock))?;
        Ok(repo.get_change(id, include_deleted)?)
    }

    pub fn list_changes(&self, query: &ChangeListQuery) -> ServiceResult<Vec<Change>> {
        let repo = SqliteChangeRepository::try_new(self.conn, Arc::clone(&self.clock))?;
        Ok(repo.list_changes(query)?)
    }

    pub fn list_snapshots(&self, query: &SnapshotListQuery) -> ServiceResult<Vec<Snapshot>> {
        let repo = SqliteSnapshotRepository::try_new(self.conn, Arc::clone(&self.clock))?;
        Ok(repo.list_snapshots(query)?)
    }

    /// Records a new change and re-applies its entity up to today.
    ///
    /// On success `change` reflects the stored row, including its snapshot
    /// reference.
    pub fn create_change(&self, change: &mut Change) -> ServiceResult<ChangeId> {
        let schema = self.schema(&change.kind)?;
        change.validate(&schema)?;

        let outcomes = with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            self.ensure_entity(&repos, &schema, change)?;

            repos.changes.create_change(change)?;

            let mut outcomes = Vec::new();
            if let Some(entity_id) = change.entity_id {
                if !change.is_draft || change.snapshot_id.is_some() {
                    outcomes.extend(self.reapply(&repos, &schema, entity_id)?);
                }
            }
            refresh(&repos, change)?;
            Ok::<_, ServiceError>(outcomes)
        })?;

        self.notify(&outcomes);
        Ok(change.id)
    }

    /// Rewrites a change and re-applies every entity it touches.
    ///
    /// A change moved to another entity re-applies the previous owner too.
    pub fn update_change(&self, change: &mut Change) -> ServiceResult<()> {
        let schema = self.schema(&change.kind)?;
        change.validate(&schema)?;

        let outcomes = with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            let stored = repos
                .changes
                .get_change(change.id, false)?
                .ok_or(ServiceError::ChangeNotFound(change.id))?;
            self.ensure_entity(&repos, &schema, change)?;

            repos.changes.update_change(change)?;

            let was_applied = !stored.is_draft || stored.snapshot_id.is_some();
            let mut outcomes = Vec::new();
            if let Some(entity_id) = change.entity_id {
                if !change.is_draft || was_applied {
                    outcomes.extend(self.reapply(&repos, &schema, entity_id)?);
                }
            }
            if let Some(previous_owner) = stored.entity_id {
                if Some(previous_owner) != change.entity_id && was_applied {
                    let previous_schema = self.schema(&stored.kind)?;
                    outcomes.extend(self.reapply(&repos, &previous_schema, previous_owner)?);
                }
            }
            refresh(&repos, change)?;
            Ok::<_, ServiceError>(outcomes)
        })?;

        self.notify(&outcomes);
        Ok(())
    }

    /// Soft-deletes a change and re-applies its entity.
    pub fn delete_change(&self, change: &mut Change) -> ServiceResult<()> {
        let outcomes = with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            let stored = repos
                .changes
                .get_change(change.id, false)?
                .ok_or(ServiceError::ChangeNotFound(change.id))?;

            repos.changes.soft_delete_change(change)?;

            let mut outcomes = Vec::new();
            if let Some(entity_id) = stored.entity_id {
                if !stored.is_draft || stored.snapshot_id.is_some() {
                    let schema = self.schema(&stored.kind)?;
                    outcomes.extend(self.reapply(&repos, &schema, entity_id)?);
                }
            }
            refresh(&repos, change)?;
            Ok::<_, ServiceError>(outcomes)
        })?;

        self.notify(&outcomes);
        Ok(())
    }

    /// Persists `entity`, optionally applying its documents first.
    ///
    /// A soft-deleted entity cascades its deletion time to all live changes
    /// and snapshots instead of applying. A missing change history is not an
    /// error here.
    pub fn save_entity(
        &self,
        entity: &mut DocumentedObject,
        apply_documents: bool,
    ) -> ServiceResult<Option<ApplyOutcome>> {
        entity.validate()?;

        let outcome = with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;

            let is_new = entity.id.is_none();
            if is_new {
                repos.entities.create_entity(entity)?;
            }
            let entity_id = entity
                .id
                .ok_or(ServiceError::Engine(EngineError::ObservableInstanceRequired))?;

            if let Some(deleted_at) = entity.deleted_at {
                let snapshots = repos
                    .snapshots
                    .soft_delete_snapshots_for_entity(entity_id, deleted_at)?;
                let changes = repos
                    .changes
                    .soft_delete_changes_for_entity(entity_id, deleted_at)?;
                info!(
                    "event=entity_delete module=service status=ok kind={} entity_id={} changes={} snapshots={}",
                    entity.kind(),
                    entity_id,
                    changes,
                    snapshots
                );
                if !is_new {
                    repos.entities.update_entity(entity)?;
                }
                return Ok::<_, ServiceError>(None);
            }

            let mut outcome = None;
            if apply_documents {
                let today = self.clock.today();
                match repos.engine().materialize(entity, Some(today)) {
                    Ok(applied) => outcome = Some(applied),
                    Err(EngineError::ChangesNotYetCreated(id)) => {
                        info!(
                            "event=apply module=service status=skipped reason=changes_not_yet_created kind={} entity_id={}",
                            entity.kind(),
                            id
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }

            if !is_new || outcome.is_some() {
                repos.entities.update_entity(entity)?;
            }
            Ok(outcome)
        })?;

        if let Some(outcome) = &outcome {
            outcome.notify(self.sink.as_ref());
        }
        Ok(outcome)
    }

    /// Marks `entity` deleted and cascades the deletion.
    pub fn delete_entity(&self, entity: &mut DocumentedObject) -> ServiceResult<()> {
        if entity.id.is_none() {
            return Err(ServiceError::Engine(EngineError::ObservableInstanceRequired));
        }
        entity.deleted_at = Some(self.clock.now());
        self.save_entity(entity, false)?;
        Ok(())
    }

    /// Applies a stored entity as of `as_of` (today when `None`) and persists it.
    pub fn apply(
        &self,
        kind: &str,
        entity_id: EntityId,
        as_of: Option<NaiveDate>,
    ) -> ServiceResult<ApplyOutcome> {
        let schema = self.schema(kind)?;
        let outcome = with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            let mut entity = repos
                .entities
                .get_entity(&schema, entity_id, false)?
                .ok_or(ServiceError::EntityNotFound(entity_id))?;
            let as_of = as_of.unwrap_or_else(|| self.clock.today());
            let outcome = repos.engine().materialize(&mut entity, Some(as_of))?;
            repos.entities.update_entity(&mut entity)?;
            Ok::<_, ServiceError>(outcome)
        })?;

        outcome.notify(self.sink.as_ref());
        Ok(outcome)
    }

    /// Applies every entity with published changes of `kind` dated on `day`.
    ///
    /// Each entity is applied in its own transaction with `day` as cutoff.
    pub fn apply_postponed(&self, kind: &str, day: NaiveDate) -> ServiceResult<PostponedReport> {
        let schema = self.schema(kind)?;
        let from = day.and_time(NaiveTime::MIN).and_utc();
        let due = self.list_changes(&ChangeListQuery::for_kind(kind).between(from, from + Duration::days(1)))?;

        let mut report = PostponedReport {
            kind: kind.to_string(),
            day,
            applied: Vec::new(),
            skipped: 0,
        };
        let mut entity_ids = BTreeSet::new();
        for change in &due {
            match change.entity_id {
                Some(entity_id) => {
                    entity_ids.insert(entity_id);
                }
                None => report.skipped += 1,
            }
        }

        for entity_id in entity_ids {
            let outcome = with_immediate_transaction(self.conn, |tx| {
                let repos = TxRepos::open(tx, &self.clock)?;
                let Some(mut entity) = repos.entities.get_entity(&schema, entity_id, false)? else {
                    return Ok::<_, ServiceError>(None);
                };
                let outcome = repos.engine().materialize(&mut entity, Some(day))?;
                repos.entities.update_entity(&mut entity)?;
                Ok(Some(outcome))
            })?;

            match outcome {
                Some(outcome) => {
                    outcome.notify(self.sink.as_ref());
                    report.applied.push(entity_id);
                }
                None => report.skipped += 1,
            }
        }

        info!(
            "event=apply_postponed module=service status=ok kind={} day={} changes={} applied={} skipped={}",
            kind,
            day,
            due.len(),
            report.applied.len(),
            report.skipped
        );
        Ok(report)
    }

    /// Renames a documented field across stored changes, snapshots and
    /// entities of `kind`. Returns the number of changes touched.
    ///
    /// `updated_at` is left alone, so no bucket turns stale.
    pub fn rename_document_field(
        &self,
        kind: &str,
        old_name: &str,
        new_name: &str,
    ) -> ServiceResult<usize> {
        let schema = self.schema(kind)?;
        if !schema.has_field(new_name) {
            return Err(ServiceError::Validation(RecordValidationError::UnknownField {
                kind: kind.to_string(),
                field: new_name.to_string(),
            }));
        }

        with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            let changes = repos.changes.rename_document_field(kind, old_name, new_name)?;
            let snapshots = repos.snapshots.rename_document_field(kind, old_name, new_name)?;
            let entities = repos.entities.rename_payload_field(kind, old_name, new_name)?;
            info!(
                "event=field_rename module=service status=ok kind={} from={} to={} changes={} snapshots={} entities={}",
                kind, old_name, new_name, changes, snapshots, entities
            );
            Ok::<_, ServiceError>(changes)
        })
    }

    /// Drops a documented field from stored changes, snapshots and entities
    /// of `kind`. Returns the number of changes touched.
    pub fn remove_document_field(&self, kind: &str, name: &str) -> ServiceResult<usize> {
        self.schema(kind)?;

        with_immediate_transaction(self.conn, |tx| {
            let repos = TxRepos::open(tx, &self.clock)?;
            let changes = repos.changes.remove_document_field(kind, name)?;
            let snapshots = repos.snapshots.remove_document_field(kind, name)?;
            let entities = repos.entities.remove_payload_field(kind, name)?;
            info!(
                "event=field_remove module=service status=ok kind={} field={} changes={} snapshots={} entities={}",
                kind, name, changes, snapshots, entities
            );
            Ok::<_, ServiceError>(changes)
        })
    }

    /// Links a published, entity-less change to an entity or refuses it.
    fn ensure_entity(
        &self,
        repos: &TxRepos<'_>,
        schema: &Arc<DocumentedSchema>,
        change: &mut Change,
    ) -> ServiceResult<()> {
        if let Some(entity_id) = change.entity_id {
            if repos.entities.get_entity(schema, entity_id, false)?.is_none() {
                return Err(ServiceError::EntityNotFound(entity_id));
            }
            return Ok(());
        }
        if change.is_draft {
            return Ok(());
        }
        if !self.create_entity_after_change_created {
            return Err(ServiceError::BusinessEntityCreationNotAllowed(change.id));
        }

        let mut entity = DocumentedObject::new(Arc::clone(schema));
        entity.values = change.asserted_state(schema);
        let entity_id = repos.entities.create_entity(&mut entity)?;
        info!(
            "event=entity_create module=service status=ok kind={} entity_id={} change_id={}",
            schema.kind, entity_id, change.id
        );
        change.entity_id = Some(entity_id);
        Ok(())
    }

    /// Applies a stored entity up to today and persists it.
    fn reapply(
        &self,
        repos: &TxRepos<'_>,
        schema: &Arc<DocumentedSchema>,
        entity_id: EntityId,
    ) -> ServiceResult<Option<ApplyOutcome>> {
        let Some(mut entity) = repos.entities.get_entity(schema, entity_id, false)? else {
            return Ok(None);
        };
        let today = self.clock.today();
        let outcome = repos.engine().materialize(&mut entity, Some(today))?;
        repos.entities.update_entity(&mut entity)?;
        Ok(Some(outcome))
    }

    fn notify(&self, outcomes: &[ApplyOutcome]) {
        for outcome in outcomes {
            outcome.notify(self.sink.as_ref());
        }
    }
}

/// Reloads `change` so callers see engine-owned columns.
fn refresh(repos: &TxRepos<'_>, change: &mut Change) -> ServiceResult<()> {
    if let Some(stored) = repos.changes.get_change(change.id, true)? {
        *change = stored;
    }
    Ok(())
}
