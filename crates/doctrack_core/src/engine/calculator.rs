//! Per-bucket state calculation.
//!
//! # Responsibility
//! - Fold a bucket's eligible changes over the inherited state.
//! - Reuse, revive, create or retire the bucket's snapshot row.
//! - Keep change → snapshot references in sync with contributions.
//!
//! # Invariants
//! - Later changes win; only asserted fields are overlaid.
//! - Re-pointing a contributor never bumps its `updated_at`.
//! - Soft-deleted changes keep their snapshot reference.

use crate::engine::EngineResult;
use crate::model::change::{Change, ChangeId};
use crate::model::entity::EntityId;
use crate::model::schema::DocumentedSchema;
use crate::model::snapshot::Snapshot;
use crate::model::value::FieldState;
use crate::repo::change_repo::ChangeRepository;
use crate::repo::snapshot_repo::SnapshotRepository;
use chrono::NaiveDate;
use std::collections::BTreeSet;

/// Computes and persists the snapshot of a single bucket.
pub struct SnapshotCalculator<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    changes: &'a C,
    snapshots: &'a S,
}

impl<'a, C, S> SnapshotCalculator<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    pub fn new(changes: &'a C, snapshots: &'a S) -> Self {
        Self { changes, snapshots }
    }

    /// Materializes the bucket starting at `history_date`.
    ///
    /// `existing` holds every snapshot found in the bucket, live or not, and
    /// `eligible` the bucket's live non-draft changes in document order.
    ///
    /// Returns the written snapshot, a retired (soft-deleted) snapshot when
    /// the bucket lost all its changes, or `None` when there was nothing to
    /// write.
    pub fn calculate(
        &self,
        entity_id: EntityId,
        schema: &DocumentedSchema,
        history_date: NaiveDate,
        existing: &[Snapshot],
        eligible: &[Change],
        inherited: FieldState,
    ) -> EngineResult<Option<Snapshot>> {
        let live = existing.iter().find(|snapshot| snapshot.is_live()).cloned();

        if eligible.is_empty() {
            let Some(mut snapshot) = live else {
                return Ok(None);
            };
            self.snapshots.soft_delete_snapshot(&mut snapshot)?;
            self.release_refs(&snapshot, &BTreeSet::new())?;
            return Ok(Some(snapshot));
        }

        let state = fold_state(schema, inherited, eligible);

        let reusable = live.or_else(|| {
            existing
                .iter()
                .filter(|snapshot| !snapshot.is_live())
                .max_by_key(|snapshot| snapshot.updated_at)
                .cloned()
        });

        let snapshot = match reusable {
            Some(mut snapshot) => {
                snapshot.deleted_at = None;
                snapshot.history_date = history_date;
                snapshot.replace_state(state);
                self.snapshots.update_snapshot(&mut snapshot)?;
                snapshot
            }
            None => {
                let mut snapshot =
                    Snapshot::new(schema.kind.as_str(), entity_id, history_date, state);
                self.snapshots.create_snapshot(&mut snapshot)?;
                snapshot
            }
        };

        let contributors: BTreeSet<ChangeId> = eligible.iter().map(|change| change.id).collect();
        for change in eligible {
            if change.snapshot_id != Some(snapshot.id) {
                self.changes.set_snapshot_ref(change.id, Some(snapshot.id))?;
            }
        }
        self.release_refs(&snapshot, &contributors)?;

        Ok(Some(snapshot))
    }

    /// Clears the reference of live changes that no longer contribute.
    fn release_refs(
        &self,
        snapshot: &Snapshot,
        contributors: &BTreeSet<ChangeId>,
    ) -> EngineResult<()> {
        for change in self.changes.list_changes_for_snapshot(snapshot.id, false)? {
            if !contributors.contains(&change.id) {
                self.changes.set_snapshot_ref(change.id, None)?;
            }
        }
        Ok(())
    }
}

/// Overlays each change's asserted fields on top of `inherited`.
pub(crate) fn fold_state(
    schema: &DocumentedSchema,
    inherited: FieldState,
    changes: &[Change],
) -> FieldState {
    let mut state = inherited;
    for change in changes {
        state.extend(change.asserted_state(schema));
    }
    state
}
