//! Documented entity repository contracts and SQLite implementation.
//!
//! # Responsibility
//! - Persist [`DocumentedObject`] live projections keyed by kind and id.
//!
//! # Invariants
//! - Write paths call `DocumentedObject::validate()` before SQL mutations.
//! - Reads resolve the payload against the caller's schema and reject rows of
//!   another kind.

use crate::clock::SharedClock;
use crate::model::entity::{DocumentedObject, EntityId};
use crate::model::schema::DocumentedSchema;
use crate::model::value::FieldState;
use crate::repo::{
    bool_to_int, ensure_connection_ready, from_millis, parse_uuid, payload_from_json,
    payload_to_json, remove_field_in, rename_field_in, to_millis, RepoError, RepoResult,
};
use rusqlite::{params, Connection, Row};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

const ENTITY_SELECT_SQL: &str = "SELECT
    uuid,
    kind,
    payload,
    created_at,
    updated_at,
    deleted_at
FROM documented_entities";

const ENTITY_COLUMNS: &[&str] = &[
    "uuid",
    "kind",
    "payload",
    "created_at",
    "updated_at",
    "deleted_at",
];

/// Repository interface for documented entities.
pub trait EntityRepository {
    /// Inserts `entity`, assigning an id when absent.
    fn create_entity(&self, entity: &mut DocumentedObject) -> RepoResult<EntityId>;
    /// Rewrites payload and deletion marker, stamping `updated_at`.
    fn update_entity(&self, entity: &mut DocumentedObject) -> RepoResult<()>;
    fn get_entity(
        &self,
        schema: &Arc<DocumentedSchema>,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<DocumentedObject>>;
    /// Soft-deletes a live entity, stamping `deleted_at` and `updated_at`.
    fn soft_delete_entity(&self, entity: &mut DocumentedObject) -> RepoResult<()>;
    fn rename_payload_field(&self, kind: &str, old_name: &str, new_name: &str)
        -> RepoResult<usize>;
    fn remove_payload_field(&self, kind: &str, name: &str) -> RepoResult<usize>;
}

/// SQLite-backed documented entity repository.
pub struct SqliteEntityRepository<'conn> {
    conn: &'conn Connection,
    clock: SharedClock,
}

impl<'conn> SqliteEntityRepository<'conn> {
    /// Creates repository from migrated connection.
    pub fn try_new(conn: &'conn Connection, clock: SharedClock) -> RepoResult<Self> {
        ensure_connection_ready(conn, "documented_entities", ENTITY_COLUMNS)?;
        Ok(Self { conn, clock })
    }

    fn rewrite_payloads(
        &self,
        kind: &str,
        mut rewrite: impl FnMut(&mut BTreeSet<String>, &mut FieldState) -> bool,
    ) -> RepoResult<usize> {
        let rows = {
            let mut stmt = self.conn.prepare(
                "SELECT uuid, payload
                 FROM documented_entities
                 WHERE kind = ?1;",
            )?;
            let mut rows = stmt.query([kind])?;
            let mut collected = Vec::new();
            while let Some(row) = rows.next()? {
                let uuid: String = row.get(0)?;
                let payload: String = row.get(1)?;
                collected.push((uuid, payload_from_json(&payload, "documented_entities.payload")?));
            }
            collected
        };

        let mut touched = 0;
        for (uuid, mut values) in rows {
            let mut keys: BTreeSet<String> = values.keys().cloned().collect();
            if !rewrite(&mut keys, &mut values) {
                continue;
            }
            self.conn.execute(
                "UPDATE documented_entities SET payload = ?2 WHERE uuid = ?1;",
                params![uuid, payload_to_json(&values)?],
            )?;
            touched += 1;
        }
        Ok(touched)
    }
}

impl EntityRepository for SqliteEntityRepository<'_> {
    fn create_entity(&self, entity: &mut DocumentedObject) -> RepoResult<EntityId> {
        entity.validate()?;

        let id = *entity.id.get_or_insert_with(Uuid::new_v4);
        let now = self.clock.now();

        self.conn.execute(
            "INSERT INTO documented_entities (
                uuid,
                kind,
                payload,
                created_at,
                updated_at,
                deleted_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6);",
            params![
                id.to_string(),
                entity.kind(),
                payload_to_json(&entity.values)?,
                to_millis(now),
                to_millis(now),
                entity.deleted_at.map(to_millis),
            ],
        )?;

        entity.created_at = Some(now);
        entity.updated_at = Some(now);
        Ok(id)
    }

    fn update_entity(&self, entity: &mut DocumentedObject) -> RepoResult<()> {
        entity.validate()?;

        let id = entity
            .id
            .ok_or_else(|| RepoError::InvalidData("cannot update an unsaved entity".to_string()))?;
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE documented_entities
             SET
                payload = ?3,
                deleted_at = ?4,
                updated_at = ?5
             WHERE uuid = ?1
               AND kind = ?2;",
            params![
                id.to_string(),
                entity.kind(),
                payload_to_json(&entity.values)?,
                entity.deleted_at.map(to_millis),
                to_millis(now),
            ],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        entity.updated_at = Some(now);
        Ok(())
    }

    fn get_entity(
        &self,
        schema: &Arc<DocumentedSchema>,
        id: EntityId,
        include_deleted: bool,
    ) -> RepoResult<Option<DocumentedObject>> {
        let mut stmt = self.conn.prepare(&format!(
            "{ENTITY_SELECT_SQL}
             WHERE uuid = ?1
               AND kind = ?2
               AND (?3 = 1 OR deleted_at IS NULL);"
        ))?;

        let mut rows = stmt.query(params![
            id.to_string(),
            schema.kind.as_str(),
            bool_to_int(include_deleted)
        ])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_entity_row(row, schema)?));
        }

        Ok(None)
    }

    fn soft_delete_entity(&self, entity: &mut DocumentedObject) -> RepoResult<()> {
        let id = entity
            .id
            .ok_or_else(|| RepoError::InvalidData("cannot delete an unsaved entity".to_string()))?;
        let now = self.clock.now();
        let changed = self.conn.execute(
            "UPDATE documented_entities
             SET
                deleted_at = ?2,
                updated_at = ?2
             WHERE uuid = ?1
               AND deleted_at IS NULL;",
            params![id.to_string(), to_millis(now)],
        )?;

        if changed == 0 {
            return Err(RepoError::NotFound(id));
        }

        entity.deleted_at = Some(now);
        entity.updated_at = Some(now);
        Ok(())
    }

    fn rename_payload_field(
        &self,
        kind: &str,
        old_name: &str,
        new_name: &str,
    ) -> RepoResult<usize> {
        self.rewrite_payloads(kind, |keys, values| {
            rename_field_in(keys, values, old_name, new_name)
        })
    }

    fn remove_payload_field(&self, kind: &str, name: &str) -> RepoResult<usize> {
        self.rewrite_payloads(kind, |keys, values| remove_field_in(keys, values, name))
    }
}

fn parse_entity_row(row: &Row<'_>, schema: &Arc<DocumentedSchema>) -> RepoResult<DocumentedObject> {
    let uuid: String = row.get("uuid")?;
    let kind: String = row.get("kind")?;
    if kind != schema.kind {
        return Err(RepoError::InvalidData(format!(
            "entity `{uuid}` has kind `{kind}`, expected `{}`",
            schema.kind
        )));
    }

    let entity = DocumentedObject {
        id: Some(parse_uuid(&uuid, "documented_entities.uuid")?),
        schema: Arc::clone(schema),
        values: payload_from_json(
            &row.get::<_, String>("payload")?,
            "documented_entities.payload",
        )?,
        created_at: Some(from_millis(row.get("created_at")?)),
        updated_at: Some(from_millis(row.get("updated_at")?)),
        deleted_at: row.get::<_, Option<i64>>("deleted_at")?.map(from_millis),
    };
    entity.schema.check_values(&entity.values)?;
    Ok(entity)
}
