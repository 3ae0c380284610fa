//! Bucket slicing, staleness detection and forward-fill.
//!
//! # Responsibility
//! - Derive an entity's buckets from its change and snapshot dates.
//! - Decide per bucket whether to recompute or keep the stored snapshot.
//! - Propagate fresher inherited values into kept snapshots.
//!
//! # Invariants
//! - A bucket exists only when a collected date falls inside it.
//! - No bucket extends past the cutoff day.
//! - The last accepted snapshot is the only source of inherited state.

use crate::engine::calculator::SnapshotCalculator;
use crate::engine::{EngineError, EngineResult};
use crate::model::change::Change;
use crate::model::entity::EntityId;
use crate::model::schema::{check_unit_size, DocumentedSchema};
use crate::model::snapshot::Snapshot;
use crate::repo::change_repo::{ChangeListQuery, ChangeRepository};
use crate::repo::snapshot_repo::{SnapshotListQuery, SnapshotRepository};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use log::{debug, info, warn};
use std::collections::BTreeSet;

/// Half-open day range `[begin, end)` materialized by one snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Bucket {
    pub begin: NaiveDate,
    pub end: NaiveDate,
}

impl Bucket {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.begin <= day && day < self.end
    }

    fn begin_at(&self) -> DateTime<Utc> {
        self.begin.and_time(NaiveTime::MIN).and_utc()
    }

    fn end_at(&self) -> DateTime<Utc> {
        self.end.and_time(NaiveTime::MIN).and_utc()
    }
}

/// Splits the timeline spanned by `dates` into occupied buckets.
///
/// The grid starts at the earliest date and steps by `unit_size_in_days`.
/// With a cutoff, dates after it are ignored and the bucket holding the
/// cutoff is clamped to end right after it. Buckets reaching past the last
/// representable day are clamped the same way.
pub fn buckets(
    dates: &BTreeSet<NaiveDate>,
    unit_size_in_days: u32,
    cutoff: Option<NaiveDate>,
) -> EngineResult<Vec<Bucket>> {
    check_unit_size(unit_size_in_days).map_err(EngineError::InvalidSchema)?;
    let Some(&first) = dates.first() else {
        return Ok(Vec::new());
    };
    let Some(latest) = cutoff.or_else(|| dates.last().copied()) else {
        return Ok(Vec::new());
    };
    let unit = i64::from(unit_size_in_days);
    let limit = latest
        .checked_add_signed(Duration::days(1))
        .unwrap_or(NaiveDate::MAX);

    let mut result = Vec::new();
    let mut cursor = first;
    while let Some(&next) = dates.range(cursor..).next() {
        if next > latest {
            break;
        }
        let steps = (next - first).num_days() / unit;
        let begin = first
            .checked_add_signed(Duration::days(steps * unit))
            .unwrap_or(next);
        let end = begin
            .checked_add_signed(Duration::days(unit))
            .map_or(limit, |end| end.min(limit));
        if end <= next {
            break;
        }
        result.push(Bucket { begin, end });
        cursor = end;
    }
    Ok(result)
}

/// Walks an entity's buckets and returns its newest live snapshot.
pub struct SnapshotsSlicer<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    changes: &'a C,
    snapshots: &'a S,
    calculator: SnapshotCalculator<'a, C, S>,
}

impl<'a, C, S> SnapshotsSlicer<'a, C, S>
where
    C: ChangeRepository,
    S: SnapshotRepository,
{
    pub fn new(changes: &'a C, snapshots: &'a S) -> Self {
        Self {
            changes,
            snapshots,
            calculator: SnapshotCalculator::new(changes, snapshots),
        }
    }

    /// Brings every bucket up to `cutoff` up to date and returns the last
    /// accepted snapshot.
    pub fn latest_snapshot(
        &self,
        entity_id: EntityId,
        schema: &DocumentedSchema,
        cutoff: Option<NaiveDate>,
    ) -> EngineResult<Option<Snapshot>> {
        let mut dates = self.changes.list_document_days(entity_id)?;
        dates.extend(self.snapshots.list_history_dates(entity_id)?);
        let outdated = self.changes.list_outdated_snapshot_refs(entity_id)?;

        let mut previous: Option<Snapshot> = None;
        let mut predecessor_retired = false;

        for bucket in buckets(&dates, schema.unit_size_in_days, cutoff)? {
            let existing = self.snapshots.list_snapshots(
                &SnapshotListQuery::for_entity(entity_id)
                    .between(bucket.begin, bucket.end)
                    .include_deleted(true),
            )?;
            let live_count = existing.iter().filter(|snapshot| snapshot.is_live()).count();
            if live_count > 1 {
                warn!(
                    "event=duplicate_snapshot module=engine status=error entity_id={} history_date={} live_count={}",
                    entity_id, bucket.begin, live_count
                );
                return Err(EngineError::SnapshotDuplicateExists {
                    entity_id,
                    history_date: bucket.begin,
                    live_count,
                });
            }
            let live = existing.iter().find(|snapshot| snapshot.is_live());

            let in_range = self.changes.list_changes(
                &ChangeListQuery::for_entity(entity_id)
                    .between(bucket.begin_at(), bucket.end_at())
                    .include_deleted(true)
                    .include_drafts(false),
            )?;
            let eligible: Vec<Change> = in_range
                .iter()
                .filter(|change| change.is_eligible())
                .cloned()
                .collect();

            let stale = match live {
                None => !eligible.is_empty(),
                Some(snapshot) => {
                    eligible.is_empty()
                        || predecessor_retired
                        || outdated.contains(&snapshot.id)
                        || diverged(&in_range, snapshot)
                }
            };

            if stale {
                debug!(
                    "event=bucket_recompute module=engine status=start entity_id={} history_date={} changes={}",
                    entity_id,
                    bucket.begin,
                    eligible.len()
                );
                let inherited = previous
                    .as_ref()
                    .map(|snapshot| snapshot.state().clone())
                    .unwrap_or_default();
                let result = self.calculator.calculate(
                    entity_id,
                    schema,
                    bucket.begin,
                    &existing,
                    &eligible,
                    inherited,
                )?;
                match result {
                    Some(snapshot) if snapshot.is_live() => {
                        previous = Some(snapshot);
                        predecessor_retired = false;
                    }
                    Some(retired) => {
                        info!(
                            "event=snapshot_retired module=engine status=ok entity_id={} snapshot_id={} history_date={}",
                            entity_id, retired.id, retired.history_date
                        );
                        predecessor_retired = true;
                    }
                    None => {}
                }
                continue;
            }

            if let Some(snapshot) = live {
                let mut snapshot = snapshot.clone();
                if let Some(prev) = previous.as_ref() {
                    if prev.updated_at > snapshot.updated_at {
                        self.forward_fill(schema, prev, &mut snapshot, &eligible)?;
                    }
                }
                previous = Some(snapshot);
                predecessor_retired = false;
            }
        }

        Ok(previous)
    }

    /// Re-derives the inherited part of a kept snapshot from `prev`.
    ///
    /// Fields the bucket does not assert itself take the predecessor's value,
    /// and fields the predecessor no longer lists are dropped.
    fn forward_fill(
        &self,
        schema: &DocumentedSchema,
        prev: &Snapshot,
        snapshot: &mut Snapshot,
        eligible: &[Change],
    ) -> EngineResult<()> {
        let asserted: BTreeSet<&str> = eligible
            .iter()
            .flat_map(|change| change.asserted_fields(schema))
            .collect();

        let mut filled = Vec::new();
        for field in &prev.document_fields {
            if asserted.contains(field.as_str()) {
                continue;
            }
            let value = prev.values.get(field).cloned().unwrap_or_default();
            let listed = snapshot.document_fields.insert(field.clone());
            if snapshot.values.get(field) != Some(&value) || listed {
                snapshot.values.insert(field.clone(), value);
                filled.push(field.as_str());
            }
        }

        let dropped: Vec<String> = snapshot
            .document_fields
            .iter()
            .filter(|field| {
                !asserted.contains(field.as_str()) && !prev.document_fields.contains(*field)
            })
            .cloned()
            .collect();
        for field in &dropped {
            snapshot.document_fields.remove(field);
            snapshot.values.remove(field);
        }

        if filled.is_empty() && dropped.is_empty() {
            return Ok(());
        }

        self.snapshots.update_snapshot(snapshot)?;
        info!(
            "event=forward_fill module=engine status=ok snapshot_id={} history_date={} fields={} dropped={}",
            snapshot.id,
            snapshot.history_date,
            filled.join(","),
            dropped.join(",")
        );
        Ok(())
    }
}

/// Whether the stored snapshot misses edits made to the bucket's changes.
///
/// A live change that does not point at the snapshot was never folded into
/// it, e.g. because an earlier run stopped at a cutoff inside this bucket.
fn diverged(in_range: &[Change], snapshot: &Snapshot) -> bool {
    in_range.iter().any(|change| {
        change.last_touched_at() > snapshot.updated_at
            || (change.is_eligible() && change.snapshot_id != Some(snapshot.id))
    })
}

#[cfg(test)]
mod tests {
    use super::{buckets, Bucket};
    use crate::engine::EngineError;
    use crate::model::schema::SchemaValidationError;
    use chrono::NaiveDate;
    use std::collections::BTreeSet;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn dates(days: &[u32]) -> BTreeSet<NaiveDate> {
        days.iter().map(|d| day(*d)).collect()
    }

    #[test]
    fn daily_buckets_follow_occupied_days() {
        let result = buckets(&dates(&[1, 3, 4]), 1, None).unwrap();
        assert_eq!(
            result,
            vec![
                Bucket { begin: day(1), end: day(2) },
                Bucket { begin: day(3), end: day(4) },
                Bucket { begin: day(4), end: day(5) },
            ]
        );
    }

    #[test]
    fn weekly_grid_is_anchored_at_first_date() {
        let result = buckets(&dates(&[2, 5, 10, 20]), 7, None).unwrap();
        assert_eq!(
            result,
            vec![
                Bucket { begin: day(2), end: day(9) },
                Bucket { begin: day(9), end: day(16) },
                Bucket { begin: day(16), end: day(21) },
            ]
        );
    }

    #[test]
    fn cutoff_clamps_and_drops_later_days() {
        let result = buckets(&dates(&[2, 5, 10]), 7, Some(day(4))).unwrap();
        assert_eq!(result, vec![Bucket { begin: day(2), end: day(5) }]);

        assert!(buckets(&dates(&[10]), 1, Some(day(4))).unwrap().is_empty());
    }

    #[test]
    fn empty_timeline_has_no_buckets() {
        assert!(buckets(&BTreeSet::new(), 1, None).unwrap().is_empty());
    }

    #[test]
    fn unusable_unit_sizes_are_rejected() {
        let zero = buckets(&dates(&[1]), 0, None).unwrap_err();
        assert!(matches!(
            zero,
            EngineError::InvalidSchema(SchemaValidationError::InvalidUnitSize(0))
        ));

        let huge = buckets(&dates(&[1]), 200_000_000, None).unwrap_err();
        assert!(matches!(
            huge,
            EngineError::InvalidSchema(SchemaValidationError::UnitSizeTooLarge(200_000_000))
        ));
    }

    #[test]
    fn buckets_near_the_last_representable_day_are_clamped() {
        let last = NaiveDate::MAX;
        let before = last.pred_opt().unwrap();
        let result = buckets(&[before, last].into_iter().collect(), 36_500, None).unwrap();
        assert_eq!(result, vec![Bucket { begin: before, end: last }]);
    }
}
