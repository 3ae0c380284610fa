//! Change repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist the append-only change log of documented entities.
//! - Answer the range and reference queries the slicer needs.
//!
//! # Invariants
//! - Changes are soft-deleted only.
//! - `snapshot_uuid` is owned by the engine: regular updates never write it,
//!   and [`ChangeRepository::set_snapshot_ref`] never bumps `updated_at`.
//! - Schema maintenance rewrites never bump `updated_at`.

use crate::clock::SharedClock;
use crate::model::change::{Change, ChangeId};
use crate::model::entity::EntityId;
use crate::model::snapshot::SnapshotId;
use crate::repo::{
    bool_to_int, ensure_connection_ready, fields_from_json, fields_to_json, from_millis,
    int_to_bool, millis_to_day, parse_optional_uuid, parse_uuid, payload_from_json,
    payload_to_json, remove_field_in, rename_field_in, to_millis, RepoError, RepoResult,
};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, Row};
use std::collections::BTreeSet;

const CHANGE_SELECT_SQL: &str = "SELECT
    uuid,
    kind,
    entity_uuid,
    document_name,
    document_date,
    document_link,
    is_draft,
    document_fields,
    payload,
    snapshot_uuid,
    created_at,
    updated_at,
    deleted_at
FROM changes";

const CHANGE_COLUMNS: &[&str] = &[
    "uuid",
    "kind",
    "entity_uuid",
    "document_name",
    "document_date",
    "document_link",
    "is_draft",
    "document_fields",
    "payload",
    "snapshot_uuid",
    "created_at",
    "updated_at",
    "deleted_at",
];

/// Query options for listing changes.
///
/// Results are ordered by `document_date`, then `created_at`, then id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeListQuery {
    pub entity_id: Option<EntityId>,
    pub kind: Option<String>,
    /// Inclusive lower bound on `document_date`.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `document_date`.
    pub until: Option<DateTime<Utc>>,
    pub include_deleted: bool,
    pub include_drafts: bool,
}

impl ChangeListQuery {
    pub fn for_entity(entity_id: EntityId) -> Self {
        Self {
            entity_id: Some(entity_id),
            ..Self::default()
        }
    }

    pub fn for_kind(kind: impl Into<String>) -> Self {
        Self {
            kind: Some(kind.into()),
            ..Self::default()
        }
    }

    /// Restricts to `document_date` in `[from, until)`.
    pub fn between(mut self, from: DateTime<Utc>, until: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.until = Some(until);
        self
    }

    pub fn include_deleted(mut self, include: bool) -> Self {
        self.include_deleted = include;
        self
    }

    pub fn include_drafts(mut self, include: bool) -> Self {
        self.include_drafts = include;
        self
    }
}

/// Repository interface for the change log.
pub trait ChangeRepository {
    /// Inserts `change`, stamping `created_at`/`updated_at`.
    fn create_change(&self, change: &mut Change) -> RepoResult<ChangeId>;
    /// Rewrites the user-editable columns of a live change, stamping `updated_at`.
    fn update_change(&self, change: &mut Change) -> RepoResult<()>;
    fn get_change(&self, id: ChangeId, include_deleted: bool) -> RepoResult<Option<Change>>;
    fn list_changes(&self, query: &ChangeListQuery) -> RepoResult<Vec<Change>>;
    fn count_changes_for_entity(
        &self,
        entity_id: EntityId,
        include_deleted: bool,
        include_drafts: bool,
    ) -> RepoResult<u64>;
    /// Distinct UTC days carrying at least one live, non-draft change.
    fn list_document_days(&self, entity_id: EntityId) -> RepoResult<BTreeSet<NaiveDate>>;
    /// Live snapshots of `entity_id` referenced by a change that was edited or
    /// deleted after the snapshot was last written.
    fn list_outdated_snapshot_refs(&self, entity_id: EntityId)
        -> RepoResult<BTreeSet<SnapshotId>>;
    fn list_changes_for_snapshot(
        &self,
        snapshot_id: SnapshotId,
        include_deleted: bool,
    ) -> RepoResult<Vec<Change>>;
    /// Points a change at a snapshot without touching `updated_at`.
    fn set_snapshot_ref(&self, id: ChangeId, snapshot_id: Option<SnapshotId>) -> RepoResult<()>;
    /// Soft-deletes a live change, stamping `deleted_at` and `updated_at`.
    fn soft_delete_change(&self, change: &mut Change) -> RepoResult<()>;
    /// Soft-deletes every live change of `entity_id` at `at`.
    fn soft_delete_changes_for_entity(
        &self,
        entity_id: EntityId,
        at: DateTime<Utc>,
    ) -> RepoResult<usize>;
    /// Renames one documented field across all changes of `kind`.
    fn rename_document_field(&self, kind: &str, old_name: &str, new_name: &str)
        -> RepoResult<usize>;
    /// Drops one documented field from all changes of `kind`.
    fn remove_document_field(&self, kind: &str, name: &str) -> RepoResult<usize>;
}

/// SQLite-backed change repository.
pub struct SqliteChangeRepository<'conn> {
    conn: &'conn Connection,
    clock: SharedClock,
}

impl<'conn> SqliteChangeRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection, clock: SharedClock) -> RepoResult<Self> {
        ensure_connection_ready(conn, "changes", CHANGE_COLUMNS)?;
        Ok(Self { conn, clock })
    }

    fn rewrite_fields(
        &self,
        kind: &str,
        mut rewrite: impl FnMut(&mut Change) -> bool,
    ) -> RepoResult<usize> {
        let changes = self.list_changes(
            &ChangeListQuery::for_kind(kind)
                .include_deleted(true)
                .include_drafts(true),
        )?;

        let mut touched = 0;
        for mut change in changes {
            if !rewrite(&mut change) {
                continue;
            }
            self.conn.execute(
                "UPDATE changes
                 SET
                    document_fields = ?2,
                    payload = ?3
                 WHERE uuid = ?1;",
                params![
                    change.id.to_string(),
                    fields_to_json(&change.document_fields)?,
                    payload_to_json(&change.values)?,
                ],
            )?;
            touched += 1;
        }
        Ok(touched)
    }
}

impl ChangeRepository for SqliteChangeRepository<'_> {
    fn create_change(&self, change: &mut Change) -> RepoResult<ChangeId> {
        change.validate_record()?;

        let now = self.clock.now();
        change.created_at = now;
        change.updated_at = now;

        self.conn.execute(
            "INSERT INTO changes (
                uuid,
                kind,
                entity_uuid,
                document_name,
                document_date,
                document_link,
                is_draft,
                document_fields,
                payload,
                snapshot_uuid,
                created_at,
                updated_at,
                deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13);",
            params![
                change.id.to_string(),
                change.kind.as_str(),
                change.entity_id.map(|id| id.to_string()),
                change.document_name.as_str(),
                to_millis(change.document_date),
                change.document_link.as_str(),
                bool_to_int(change.is_draft),
                fields_to_json(&change.document_fields)?,
                payload_to_json(&change.values)?,
                change.snapshot_id.map(|id| id.to_string()),
                to_millis(change.created_at),
                to_millis(change.updated_at),
                change.deleted_at.map(to_millis),
            ],
        )?;

        Ok(change.id)
    }

    fn update_change(&self, change: &mut Change) -> RepoResult<()> {
        change.validate_record()?;

        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE changes
             SET
                kind = ?2,
                entity_uuid = ?3,
                document_name = ?4,
                document_date = ?5,
                document_link = ?6,
                is_draft = ?7,
                document_fields = ?8,
                payload = ?9,
                updated_at = ?10
             WHERE uuid = ?1
               AND deleted_at IS NULL;",
            params![
                change.id.to_string(),
                change.kind.as_str(),
                change.entity_id.map(|id| id.to_string()),
                change.document_name.as_str(),
                to_millis(change.document_date),
                change.document_link.as_str(),
                bool_to_int(change.is_draft),
                fields_to_json(&change.document_fields)?,
                payload_to_json(&change.values)?,
                to_millis(now),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(change.id));
        }

        change.updated_at = now;
        Ok(())
    }

    fn get_change(&self, id: ChangeId, include_deleted: bool) -> RepoResult<Option<Change>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CHANGE_SELECT_SQL}
             WHERE uuid = ?1
               AND (?2 = 1 OR deleted_at IS NULL);"
        ))?;

        let mut rows = stmt.query(params![id.to_string(), bool_to_int(include_deleted)])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_change_row(row)?));
        }

        Ok(None)
    }

    fn list_changes(&self, query: &ChangeListQuery) -> RepoResult<Vec<Change>> {
        let mut sql = format!("{CHANGE_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if !query.include_deleted {
            sql.push_str(" AND deleted_at IS NULL");
        }
        if !query.include_drafts {
            sql.push_str(" AND is_draft = 0");
        }
        if let Some(entity_id) = query.entity_id {
            sql.push_str(" AND entity_uuid = ?");
            bind_values.push(Value::Text(entity_id.to_string()));
        }
        if let Some(kind) = &query.kind {
            sql.push_str(" AND kind = ?");
            bind_values.push(Value::Text(kind.clone()));
        }
        if let Some(from) = query.from {
            sql.push_str(" AND document_date >= ?");
            bind_values.push(Value::Integer(to_millis(from)));
        }
        if let Some(until) = query.until {
            sql.push_str(" AND document_date < ?");
            bind_values.push(Value::Integer(to_millis(until)));
        }

        sql.push_str(" ORDER BY document_date ASC, created_at ASC, uuid ASC");

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(parse_change_row(row)?);
        }

        Ok(changes)
    }

    fn count_changes_for_entity(
        &self,
        entity_id: EntityId,
        include_deleted: bool,
        include_drafts: bool,
    ) -> RepoResult<u64> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*)
             FROM changes
             WHERE entity_uuid = ?1
               AND (?2 = 1 OR deleted_at IS NULL)
               AND (?3 = 1 OR is_draft = 0);",
            params![
                entity_id.to_string(),
                bool_to_int(include_deleted),
                bool_to_int(include_drafts),
            ],
            |row| row.get(0),
        )?;
        Ok(u64::try_from(count).unwrap_or_default())
    }

    fn list_document_days(&self, entity_id: EntityId) -> RepoResult<BTreeSet<NaiveDate>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT document_date
             FROM changes
             WHERE entity_uuid = ?1
               AND is_draft = 0
               AND deleted_at IS NULL;",
        )?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut days = BTreeSet::new();
        while let Some(row) = rows.next()? {
            days.insert(millis_to_day(row.get(0)?));
        }
        Ok(days)
    }

    fn list_outdated_snapshot_refs(
        &self,
        entity_id: EntityId,
    ) -> RepoResult<BTreeSet<SnapshotId>> {
        let mut stmt = self.conn.prepare(
            "SELECT DISTINCT s.uuid
             FROM changes c
             JOIN snapshots s ON s.uuid = c.snapshot_uuid
             WHERE s.entity_uuid = ?1
               AND s.deleted_at IS NULL
               AND (
                    c.updated_at > s.updated_at
                    OR (c.deleted_at IS NOT NULL AND c.deleted_at > s.updated_at)
               );",
        )?;
        let mut rows = stmt.query([entity_id.to_string()])?;
        let mut ids = BTreeSet::new();
        while let Some(row) = rows.next()? {
            let uuid: String = row.get(0)?;
            ids.insert(parse_uuid(&uuid, "snapshots.uuid")?);
        }
        Ok(ids)
    }

    fn list_changes_for_snapshot(
        &self,
        snapshot_id: SnapshotId,
        include_deleted: bool,
    ) -> RepoResult<Vec<Change>> {
        let mut stmt = self.conn.prepare(&format!(
            "{CHANGE_SELECT_SQL}
             WHERE snapshot_uuid = ?1
               AND (?2 = 1 OR deleted_at IS NULL)
             ORDER BY document_date ASC, created_at ASC, uuid ASC;"
        ))?;
        let mut rows = stmt.query(params![
            snapshot_id.to_string(),
            bool_to_int(include_deleted)
        ])?;
        let mut changes = Vec::new();
        while let Some(row) = rows.next()? {
            changes.push(parse_change_row(row)?);
        }
        Ok(changes)
    }

    fn set_snapshot_ref(&self, id: ChangeId, snapshot_id: Option<SnapshotId>) -> RepoResult<()> {
        let changed = self.conn.execute(
            "UPDATE changes SET snapshot_uuid = ?2 WHERE uuid = ?1;",
            params![id.to_string(), snapshot_id.map(|value| value.to_string())],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }
        Ok(())
    }

    fn soft_delete_change(&self, change: &mut Change) -> RepoResult<()> {
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE changes
             SET
                deleted_at = ?2,
                updated_at = ?2
             WHERE uuid = ?1
               AND deleted_at IS NULL;",
            params![change.id.to_string(), to_millis(now)],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound(change.id));
        }

        change.deleted_at = Some(now);
        change.updated_at = now;
        Ok(())
    }

    fn soft_delete_changes_for_entity(
        &self,
        entity_id: EntityId,
        at: DateTime<Utc>,
    ) -> RepoResult<usize> {
        let changed = self.conn.execute(
            "UPDATE changes
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
        self.rewrite_fields(kind, |change| {
            rename_field_in(
                &mut change.document_fields,
                &mut change.values,
                old_name,
                new_name,
            )
        })
    }

    fn remove_document_field(&self, kind: &str, name: &str) -> RepoResult<usize> {
        self.rewrite_fields(kind, |change| {
            remove_field_in(&mut change.document_fields, &mut change.values, name)
        })
    }
}

fn parse_change_row(row: &Row<'_>) -> RepoResult<Change> {
    let uuid: String = row.get("uuid")?;

    let change = Change {
        id: parse_uuid(&uuid, "changes.uuid")?,
        kind: row.get("kind")?,
        entity_id: parse_optional_uuid(row.get("entity_uuid")?, "changes.entity_uuid")?,
        document_name: row.get("document_name")?,
        document_date: from_millis(row.get("document_date")?),
        document_link: row.get("document_link")?,
        is_draft: int_to_bool(row.get("is_draft")?, "changes.is_draft")?,
        document_fields: fields_from_json(
            &row.get::<_, String>("document_fields")?,
            "changes.document_fields",
        )?,
        values: payload_from_json(&row.get::<_, String>("payload")?, "changes.payload")?,
        snapshot_id: parse_optional_uuid(row.get("snapshot_uuid")?, "changes.snapshot_uuid")?,
        created_at: from_millis(row.get("created_at")?),
        updated_at: from_millis(row.get("updated_at")?),
        deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(from_millis),
    };
    change.validate_record()?;
    Ok(change)
}
