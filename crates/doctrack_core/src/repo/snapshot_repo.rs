//! Snapshot repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist materialized bucket states per documented entity.
//!
//! # Invariants
//! - The partial unique index `uq_snapshots_live_history_date` rejects a
//!   second live snapshot for the same `(entity_uuid, history_date)`.
//! - `history_date` is stored as the UTC midnight of the bucket start.

use crate::clock::SharedClock;
use crate::model::entity::EntityId;
use crate::model::snapshot::{Snapshot, SnapshotId};
use crate::repo::{
    bool_to_int, day_to_millis, ensure_connection_ready, fields_from_json, fields_to_json,
    from_millis, millis_to_day, parse_uuid, payload_from_json, payload_to_json, remove_field_in,
    rename_field_in, to_millis, RepoError, RepoResult,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeSet;

const SNAPSHOT_SELECT_SQL: &str = "SELECT
    uuid,
    kind,
    entity_uuid,
    history_date,
    document_fields,
    payload,
    created_at,
    updated_at,
    deleted_at
FROM snapshots";

const SNAPSHOT_COLUMNS: &[&str] = &[
    "uuid",
    "kind",
    "entity_uuid",
    "history_date",
    "document_fields",
    "payload",
    "created_at",
    "updated_at",
    "deleted_at",
];

/// Query options for listing one entity's snapshots.
///
/// Results are ordered by `history_date`, then `updated_at`, then id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotListQuery {
    pub entity_id: EntityId,
    /// Inclusive lower bound on `history_date`.
    pub from: Option<NaiveDate>,
    /// Exclusive upper bound on `history_date`.
    pub until: Option<NaiveDate>,
    pub include_deleted: bool,
}

impl SnapshotListQuery {
    pub fn for_entity(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            from: None,
            until: None,
            include_deleted: false,
        }
    }

    /// Restricts to `history_date` in `[from, until)`.
    pub fn between(mut self, from: NaiveDate, until: NaiveDate) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }
}

/// Repository interface for materialized snapshots.
pub trait SnapshotRepository {
    /// Inserts `snapshot`, stamping `created_at`/`updated_at`.
    fn create_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<SnapshotId>;
    /// Rewrites date, state and deletion marker, stamping `updated_at`.
    fn update_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<()>;
    /// Soft-deletes a live snapshot, stamping `deleted_at` and `updated_at`.
    fn soft_delete_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<()>;
    fn get_snapshot(&self, id: SnapshotId, include_deleted: bool)
        -> RepoResult<Option<Snapshot>>;
    fn list_snapshots(&self, query: &SnapshotListQuery) -> RepoResult<Vec<Snapshot>>;
    /// Distinct history dates of all snapshots of `entity_id`, deleted included.
    fn list_history_dates(&self, entity_id: EntityId) -> RepoResult<BTreeSet<NaiveDate>>;
    /// Soft-deletes every live snapshot of `entity_id` at `at`.
    fn soft_delete_snapshots_for_entity(
        &self,
        entity_id: EntityId,
        at: DateTime<Utc>,
    ) -> RepoResult<usize>;
    fn rename_document_field(&self, kind: &str, old_name: &str, new_name: &str)
        -> RepoResult<usize>;
    fn remove_document_field(&self, kind: &str, name: &str) -> RepoResult<usize>;
}

/// SQLite-backed snapshot repository.
pub struct SqliteSnapshotRepository<'conn> {
    conn: &'conn Connection,
    clock: SharedClock,
}

impl<'conn> SqliteSnapshotRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection, clock: SharedClock) -> RepoResult<Self> {
        ensure_connection_ready(conn, "snapshots", SNAPSHOT_COLUMNS)?;
        Ok(Self { conn, clock })
    }

    fn rewrite_fields(
        &self,
        kind: &str,
        mut rewrite: impl FnMut(&mut Snapshot) -> bool,
    ) -> RepoResult<usize> {
        let snapshots = {
            let mut stmt = self.conn.prepare(&format!(
                "{SNAPSHOT_SELECT_SQL}
                 WHERE kind = ?1;"
            ))?;
            let mut rows = stmt.query([kind])?;
            let mut snapshots = Vec::new();
            while let Some(row) = rows.next()? {
                snapshots.push(parse_snapshot_row(row)?);
            }
            snapshots
        };

        let mut touched = 0;
        for mut snapshot in snapshots {
            if !rewrite(&mut snapshot) {
                continue;
            }
            self.conn.execute(
                "UPDATE snapshots
                 SET
                    document_fields = ?2,
                    payload = ?3
                 WHERE uuid = ?1;",
                params![
                    snapshot.id.to_string(),
                    fields_to_json(&snapshot.document_fields)?,
                    payload_to_json(&snapshot.values)?,
                ],
            )?;
            touched += 1;
        }
        Ok(touched)
    }
}

impl SnapshotRepository for SqliteSnapshotRepository<'_> {
    fn create_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<SnapshotId> {
        let now = self.clock.now();
        snapshot.created_at = now;
        snapshot.updated_at = now;

        self.conn.execute(
            "INSERT INTO snapshots (
                uuid,
                kind,
                entity_uuid,
                history_date,
                document_fields,
                payload,
                created_at,
                updated_at,
                deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                snapshot.id.to_string(),
                snapshot.kind.as_str(),
                snapshot.entity_id.to_string(),
                day_to_millis(snapshot.history_date),
                fields_to_json(&snapshot.document_fields)?,
                payload_to_json(&snapshot.values)?,
                to_millis(snapshot.created_at),
                to_millis(snapshot.updated_at),
                snapshot.deleted_at.map(to_millis),
            ],
        )?;

        Ok(snapshot.id)
    }

    fn update_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<()> {
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE snapshots
             SET
                history_date = ?2,
                document_fields = ?3,
                payload = ?4,
                deleted_at = ?5,
                updated_at = ?6
             WHERE uuid = ?1;",
            params![
                snapshot.id.to_string(),
                day_to_millis(snapshot.history_date),
                fields_to_json(&snapshot.document_fields)?,
                payload_to_json(&snapshot.values)?,
                snapshot.deleted_at.map(to_millis),
                to_millis(now),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(snapshot.id));
        }

        snapshot.updated_at = now;
        Ok(())
    }

    fn soft_delete_snapshot(&self, snapshot: &mut Snapshot) -> RepoResult<()> {
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE snapshots
             SET
                deleted_at = ?2,
                updated_at = ?2
             WHERE uuid = ?1
               AND deleted_at IS NULL;",
            params![snapshot.id.to_string(), to_millis(now)],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(snapshot.id));
        }

        snapshot.deleted_at = Some(now);
        snapshot.updated_at = now;
        Ok(())
    }

    fn get_snapshot(
        &self,
        id: SnapshotId,
        include_deleted: bool,
    ) -> RepoResult<Option<Snapshot>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SNAPSHOT_SELECT_SQL}
             WHERE uuid = ?1
               AND (?2 = 1 OR deleted_at IS NULL);"
        ))?;

        let mut rows = stmt.query(params![id.to_string(), bool_to_int(include_deleted)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_snapshot_row(row)?));
        }

        Ok(None)
    }

    fn list_snapshots(&self, query: &SnapshotListQuery) -> RepoResult<Vec<Snapshot>> {
        let mut sql = format!("{SNAPSHOT_SELECT_SQL} WHERE entity_uuid = ?");
        let mut bind_values: Vec<Value> = vec![Value::Text(query.entity_id.to_string())];

        if !query.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if let Some(from) = query.from {
            sql.push_str(" AND history_date >= ?");
            bind_values.push(Value::Integer(day_to_millis(from)));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND history_date < ?");
            bind_values.push(Value::Integer(day_to_millis(until)));
        }

        sql.push_str(" ORDER BY history_date ASC, updated_at ASC, uuid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut snapshots = Vec::new();
        while let Some(row) = rows.next()? {
            snapshots.push(parse_snapshot_row(row)?);
        }

        Ok(snapshots)
    }

    fn list_history_dates(&self, entity_id: EntityId) -> RepoResult<BTreeSet<NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT history_date
             FROM snapshots
             WHERE entity_uuid = ?1;",
        )?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut days = BTreeSet::new();
        while let Some(row) = rows.next()? {
            days.insert(millis_to_day(row.get(0)?));
        }
        Ok(days)
    }

    fn soft_delete_snapshots_for_entity(
        &self,
        entity_id: EntityId,
        at: DateTime<Utc>,
    ) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE snapshots
             SET deleted_at = ?2
             WHERE entity_uuid = ?1
               AND deleted_at IS NULL;",
            params![entity_id.to_string(), to_millis(at)],
        )?;
        Ok(changed)
    }

    fn rename_document_field(
        &self,
        kind: &str,
        old_name: &str,
        new_name: &str,
    ) -> RepoResult<usize> {
        self.rewrite_fields(kind, |snapshot| {
            rename_field_in(
                &mut snapshot.document_fields,
                &mut snapshot.values,
                old_name,
                new_name,
            )
        })
    }

    fn remove_document_field(&self, kind: &str, name: &str) -> RepoResult<usize> {
        self.rewrite_fields(kind, |snapshot| {
            remove_field_in(&mut snapshot.document_fields, &mut snapshot.values, name)
        })
    }
}

fn parse_snapshot_row(row: &Row<'_>) -> RepoResult<Snapshot> {
    let uuid: String = row.get("uuid")?;
    let entity_uuid: String = row.get("entity_uuid")?;

    Ok(Snapshot {
        id: parse_uuid(&uuid, "snapshots.uuid")?,
        kind: row.get("kind")?,
        entity_id: parse_uuid(&entity_uuid, "snapshots.entity_uuid")?,
        history_date: millis_to_day(row.get("history_date")?),
        document_fields: fields_from_json(
            &row.get::<_, String>("document_fields")?,
            "snapshots.document_fields",
        )?,
        values: payload_from_json(&row.get::<_, String>("payload")?, "snapshots.payload")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(from_millis),
    })
}
