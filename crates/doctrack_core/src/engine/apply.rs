//! Per-entity apply orchestration.
//!
//! # Responsibility
//! - Run the slicer for one entity and copy the newest state onto it.
//! - Report what changed through a [`ChangeAppliedSink`].
//!
//! # Invariants
//! - Only fields that differ are written onto the entity.
//! - Persisting the entity stays with the caller.
//! - [`apply_atomically`] notifies only after its transaction committed.

use crate::clock::SharedClock;
use crate::db::with_immediate_transaction;
use crate::engine::notify::{ChangeApplied, ChangeAppliedSink};
use crate::engine::slicer::SnapshotsSlicer;
use crate::engine::{EngineError, EngineResult};
use crate::model::change::Change;
use crate::model::entity::{Documented, EntityId};
use crate::model::snapshot::Snapshot;
use crate::model::value::FieldValue;
use crate::repo::change_repo::{ChangeRepository, SqliteChangeRepository};
use crate::repo::snapshot_repo::{SnapshotRepository, SqliteSnapshotRepository};
use chrono::NaiveDate;
use log::info;
use rusqlite::Connection;
use std::sync::Arc;
use std::time::Instant;

/// Result of one apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub entity_id: EntityId,
    pub kind: String,
    /// Newest live snapshot, `None` when every change is a draft or deleted.
    pub snapshot: Option<Snapshot>,
    /// Most recent change contributing to `snapshot`.
    pub latest_change: Option<Change>,
    /// Entity fields whose value was replaced, in name order.
    pub changed_fields: Vec<String>,
}

impl ApplyOutcome {
    /// Emits the outcome to `sink` when a snapshot was applied.
    pub fn notify<N>(&self, sink: &N)
    where
        N: ChangeAppliedSink + ?Sized,
    {
        if self.snapshot.is_none() {
            return;
        }
        sink.change_applied(&ChangeApplied {
            entity_id: self.entity_id,
            kind: self.kind.as_str(),
            change: self.latest_change.as_ref(),
            changed_fields: &self.changed_fields,
        });
    }
}

/// Applies documented history onto live entities.
pub struct ApplyEngine<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    changes: &'a C,
    slicer: SnapshotsSlicer<'a, C, S>,
}

impl<'a, C, S> ApplyEngine<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    pub fn new(changes: &'a C, snapshots: &'a S) -> Self {
        Self {
            changes,
            slicer: SnapshotsSlicer::new(changes, snapshots),
        }
    }

    /// Materializes snapshots up to `as_of` and writes the newest state onto
    /// `entity`, then notifies `sink`.
    pub fn apply_to_object<D, N>(
        &self,
        entity: &mut D,
        as_of: Option<NaiveDate>,
        sink: &N,
    ) -> EngineResult<ApplyOutcome>
    where
        D: Documented + ?Sized,
        N: ChangeAppliedSink + ?Sized,
    {
        let outcome = self.materialize(entity, as_of)?;
        outcome.notify(sink);
        Ok(outcome)
    }

    /// Same as [`ApplyEngine::apply_to_object`] without notifying.
    pub fn materialize<D>(&self, entity: &mut D, as_of: Option<NaiveDate>) -> EngineResult<ApplyOutcome>
    where
        D: Documented + ?Sized,
    {
        let entity_id = entity
            .entity_id()
            .ok_or(EngineError::ObservableInstanceRequired)?;
        let kind = entity.schema().kind.clone();

        if self.changes.count_changes_for_entity(entity_id, true, true)? == 0 {
            return Err(EngineError::ChangesNotYetCreated(entity_id));
        }

        let started_at = Instant::now();
        let snapshot = self
            .slicer
            .latest_snapshot(entity_id, entity.schema(), as_of)?;

        let mut outcome = ApplyOutcome {
            entity_id,
            kind,
            snapshot: None,
            latest_change: None,
            changed_fields: Vec::new(),
        };
        let Some(snapshot) = snapshot else {
            info!(
                "event=apply module=engine status=empty kind={} entity_id={} duration_ms={}",
                outcome.kind,
                entity_id,
                started_at.elapsed().as_millis()
            );
            return Ok(outcome);
        };

        let updates: Vec<(String, FieldValue)> = snapshot
            .state()
            .iter()
            .filter(|(field, _)| entity.schema().has_field(field))
            .filter(|(field, value)| entity.field_value(field) != **value)
            .map(|(field, value)| (field.clone(), value.clone()))
            .collect();
        for (field, value) in updates {
            entity.set_field_value(&field, value);
            outcome.changed_fields.push(field);
        }

        outcome.latest_change = self
            .changes
            .list_changes_for_snapshot(snapshot.id, false)?
            .into_iter()
            .filter(Change::is_eligible)
            .max_by_key(|change| (change.document_date, change.created_at));

        info!(
            "event=apply module=engine status=ok kind={} entity_id={} history_date={} changed_fields={} duration_ms={}",
            outcome.kind,
            entity_id,
            snapshot.history_date,
            outcome.changed_fields.len(),
            started_at.elapsed().as_millis()
        );
        outcome.snapshot = Some(snapshot);
        Ok(outcome)
    }
}

/// Applies `entity` inside one immediate transaction on `conn`.
///
/// Joins the caller's transaction when one is already open. The sink is
/// notified after the work committed (or after it joined the caller's).
pub fn apply_atomically<D, N>(
    conn: &Connection,
    clock: &SharedClock,
    sink: &N,
    entity: &mut D,
    as_of: Option<NaiveDate>,
) -> EngineResult<ApplyOutcome>
where
    D: Documented + ?Sized,
    N: ChangeAppliedSink + ?Sized,
{
    if entity.entity_id().is_none() {
        return Err(EngineError::ObservableInstanceRequired);
    }

    let outcome = with_immediate_transaction(conn, |tx| {
        let changes = SqliteChangeRepository::try_new(tx, Arc::clone(clock))?;
        let snapshots = SqliteSnapshotRepository::try_new(tx, Arc::clone(clock))?;
        ApplyEngine::new(&changes, &snapshots).materialize(entity, as_of)
    })?;
    outcome.notify(sink);
    Ok(outcome)
}
