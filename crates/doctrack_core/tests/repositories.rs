use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use doctrack_core::clock::{ManualClock, SharedClock};
use doctrack_core::db::open_db_in_memory;
use doctrack_core::model::change::Change;
use doctrack_core::model::entity::DocumentedObject;
use doctrack_core::model::schema::{DocumentedSchema, RecordValidationError};
use doctrack_core::model::snapshot::Snapshot;
use doctrack_core::model::value::{FieldKind, FieldState, FieldValue};
use doctrack_core::repo::change_repo::{ChangeListQuery, ChangeRepository, SqliteChangeRepository};
use doctrack_core::repo::entity_repo::{EntityRepository, SqliteEntityRepository};
use doctrack_core::repo::snapshot_repo::{SnapshotListQuery, SnapshotRepository, SqliteSnapshotRepository};
use doctrack_core::repo::RepoError;
use rusqlite::Connection;
use std::sync::Arc;
use uuid::Uuid;

fn clock() -> SharedClock {
    ManualClock::new(Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap()).shared()
}

fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
}

fn day(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 3, day).unwrap()
}

fn book_schema() -> Arc<DocumentedSchema> {
    Arc::new(
        DocumentedSchema::builder("book")
            .required("title", FieldKind::Text)
            .field("pages", FieldKind::Integer)
            .build()
            .unwrap(),
    )
}

#[test]
fn repositories_reject_unmigrated_connections() {
    let conn = Connection::open_in_memory().unwrap();

    let err = SqliteChangeRepository::try_new(&conn, clock())
        .err()
        .expect("unmigrated connection must be rejected");
    assert!(matches!(
        err,
        RepoError::UninitializedConnection {
            actual_version: 0,
            ..
        }
    ));
    assert!(SqliteSnapshotRepository::try_new(&conn, clock()).is_err());
    assert!(SqliteEntityRepository::try_new(&conn, clock()).is_err());
}

#[test]
fn change_round_trip_stamps_timestamps() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteChangeRepository::try_new(&conn, clock()).unwrap();
    let entity_id = Uuid::new_v4();

    let mut change = Change::new("book", "intake", at(2, 10))
        .for_entity(entity_id)
        .published()
        .assert_field("title", "Dune")
        .with_value("pages", 412_i64);
    change.document_link = "https://records.example/42".to_string();
    repo.create_change(&mut change).unwrap();

    let loaded = repo.get_change(change.id, false).unwrap().unwrap();
    assert_eq!(loaded, change);
    assert!(loaded.created_at >= Utc.with_ymd_and_hms(2024, 4, 1, 9, 0, 0).unwrap());
    assert_eq!(loaded.created_at, loaded.updated_at);
    assert!(loaded.document_fields.contains("title"));
    assert!(!loaded.document_fields.contains("pages"));
    assert_eq!(loaded.values.get("pages"), Some(&FieldValue::Integer(412)));
}

#[test]
fn change_lists_honor_deleted_and_draft_flags() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteChangeRepository::try_new(&conn, clock()).unwrap();
    let entity_id = Uuid::new_v4();

    let mut published = Change::new("book", "published", at(1, 9))
        .for_entity(entity_id)
        .published();
    let mut draft = Change::new("book", "draft", at(2, 9)).for_entity(entity_id);
    let mut deleted = Change::new("book", "deleted", at(3, 9))
        .for_entity(entity_id)
        .published();
    for change in [&mut published, &mut draft, &mut deleted] {
        repo.create_change(change).unwrap();
    }
    repo.soft_delete_change(&mut deleted).unwrap();
    assert!(deleted.deleted_at.is_some());

    let names = |query: ChangeListQuery| -> Vec<String> {
        repo.list_changes(&query)
            .unwrap()
            .into_iter()
            .map(|change| change.document_name)
            .collect()
    };

    assert_eq!(names(ChangeListQuery::for_entity(entity_id)), vec!["published"]);
    assert_eq!(
        names(ChangeListQuery::for_entity(entity_id).include_drafts(true)),
        vec!["published", "draft"]
    );
    assert_eq!(
        names(
            ChangeListQuery::for_entity(entity_id)
                .include_drafts(true)
                .include_deleted(true)
        ),
        vec!["published", "draft", "deleted"]
    );
    assert_eq!(
        names(
            ChangeListQuery::for_entity(entity_id)
                .include_deleted(true)
                .between(at(2, 0), at(4, 0))
        ),
        vec!["deleted"]
    );

    assert_eq!(repo.count_changes_for_entity(entity_id, false, false).unwrap(), 1);
    assert_eq!(repo.count_changes_for_entity(entity_id, true, true).unwrap(), 3);
    assert_eq!(
        repo.list_document_days(entity_id).unwrap().into_iter().collect::<Vec<_>>(),
        vec![day(1)]
    );
    assert!(repo.get_change(deleted.id, false).unwrap().is_none());
    assert!(repo.get_change(deleted.id, true).unwrap().is_some());
}

#[test]
fn deleted_changes_cannot_be_updated_or_deleted_again() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteChangeRepository::try_new(&conn, clock()).unwrap();

    let mut change = Change::new("book", "once", at(1, 9));
    repo.create_change(&mut change).unwrap();
    repo.soft_delete_change(&mut change).unwrap();

    assert!(matches!(
        repo.update_change(&mut change),
        Err(RepoError::NotFound(id)) if id == change.id
    ));
    assert!(matches!(
        repo.soft_delete_change(&mut change),
        Err(RepoError::NotFound(_))
    ));
}

#[test]
fn empty_document_name_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteChangeRepository::try_new(&conn, clock()).unwrap();

    let mut change = Change::new("book", "  ", at(1, 9));
    let err = repo.create_change(&mut change).unwrap_err();
    assert!(matches!(
        err,
        RepoError::Validation(RecordValidationError::EmptyDocumentName)
    ));
}

#[test]
fn snapshot_refs_do_not_bump_updated_at_and_edits_are_detected() {
    let conn = open_db_in_memory().unwrap();
    let clock = clock();
    let changes = SqliteChangeRepository::try_new(&conn, Arc::clone(&clock)).unwrap();
    let snapshots = SqliteSnapshotRepository::try_new(&conn, clock).unwrap();
    let entity_id = Uuid::new_v4();

    let mut change = Change::new("book", "intake", at(1, 9))
        .for_entity(entity_id)
        .published()
        .assert_field("title", "A");
    changes.create_change(&mut change).unwrap();

    let mut snapshot = Snapshot::new("book", entity_id, day(1), change.asserted_state(&book_schema()));
    snapshots.create_snapshot(&mut snapshot).unwrap();
    changes.set_snapshot_ref(change.id, Some(snapshot.id)).unwrap();

    let referenced = changes.get_change(change.id, false).unwrap().unwrap();
    assert_eq!(referenced.snapshot_id, Some(snapshot.id));
    assert_eq!(referenced.updated_at, change.updated_at);
    assert!(changes.list_outdated_snapshot_refs(entity_id).unwrap().is_empty());
    assert_eq!(
        changes
            .list_changes_for_snapshot(snapshot.id, false)
            .unwrap()
            .into_iter()
            .map(|change| change.id)
            .collect::<Vec<_>>(),
        vec![change.id]
    );

    let mut edited = referenced.assert_field("title", "B");
    changes.update_change(&mut edited).unwrap();
    let outdated = changes.list_outdated_snapshot_refs(entity_id).unwrap();
    assert!(outdated.contains(&snapshot.id));
    assert_eq!(
        changes.get_change(change.id, false).unwrap().unwrap().snapshot_id,
        Some(snapshot.id)
    );
}

#[test]
fn snapshot_queries_cover_ranges_and_deletion() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteSnapshotRepository::try_new(&conn, clock()).unwrap();
    let entity_id = Uuid::new_v4();

    let mut ids = Vec::new();
    for d in [1, 4, 9] {
        let mut snapshot = Snapshot::new("book", entity_id, day(d), FieldState::new());
        repo.create_snapshot(&mut snapshot).unwrap();
        ids.push(snapshot);
    }
    let mut middle = ids.remove(1);
    repo.soft_delete_snapshot(&mut middle).unwrap();

    let live = repo
        .list_snapshots(&SnapshotListQuery::for_entity(entity_id))
        .unwrap();
    assert_eq!(
        live.iter().map(|snapshot| snapshot.history_date).collect::<Vec<_>>(),
        vec![day(1), day(9)]
    );

    let in_range = repo
        .list_snapshots(
            &SnapshotListQuery::for_entity(entity_id)
                .between(day(2), day(9))
                .include_deleted(true),
        )
        .unwrap();
    assert_eq!(in_range.len(), 1);
    assert_eq!(in_range[0].id, middle.id);
    assert!(in_range[0].deleted_at.is_some());

    assert_eq!(
        repo.list_history_dates(entity_id).unwrap().into_iter().collect::<Vec<_>>(),
        vec![day(1), day(4), day(9)]
    );

    middle.deleted_at = None;
    middle.history_date = day(5);
    repo.update_snapshot(&mut middle).unwrap();
    let revived = repo.get_snapshot(middle.id, false).unwrap().unwrap();
    assert_eq!(revived.history_date, day(5));
}

#[test]
fn entity_cascade_helpers_share_one_timestamp() {
    let conn = open_db_in_memory().unwrap();
    let clock = clock();
    let changes = SqliteChangeRepository::try_new(&conn, Arc::clone(&clock)).unwrap();
    let snapshots = SqliteSnapshotRepository::try_new(&conn, clock).unwrap();
    let entity_id = Uuid::new_v4();

    let mut change = Change::new("book", "intake", at(1, 9))
        .for_entity(entity_id)
        .published();
    changes.create_change(&mut change).unwrap();
    let mut snapshot = Snapshot::new("book", entity_id, day(1), FieldState::new());
    snapshots.create_snapshot(&mut snapshot).unwrap();

    let deleted_at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
    assert_eq!(changes.soft_delete_changes_for_entity(entity_id, deleted_at).unwrap(), 1);
    assert_eq!(snapshots.soft_delete_snapshots_for_entity(entity_id, deleted_at).unwrap(), 1);
    assert_eq!(changes.soft_delete_changes_for_entity(entity_id, deleted_at).unwrap(), 0);

    let change = changes.get_change(change.id, true).unwrap().unwrap();
    let snapshot = snapshots.get_snapshot(snapshot.id, true).unwrap().unwrap();
    assert_eq!(change.deleted_at, Some(deleted_at));
    assert_eq!(snapshot.deleted_at, Some(deleted_at));
}

#[test]
fn field_rewrites_keep_updated_at() {
    let conn = open_db_in_memory().unwrap();
    let clock = clock();
    let changes = SqliteChangeRepository::try_new(&conn, Arc::clone(&clock)).unwrap();
    let snapshots = SqliteSnapshotRepository::try_new(&conn, clock).unwrap();
    let entity_id = Uuid::new_v4();

    let mut change = Change::new("book", "intake", at(1, 9))
        .for_entity(entity_id)
        .published()
        .assert_field("name", "Dune")
        .assert_field("pages", 412_i64);
    changes.create_change(&mut change).unwrap();
    let mut other_kind = Change::new("film", "intake", at(1, 9)).assert_field("name", "Dune");
    changes.create_change(&mut other_kind).unwrap();
    let mut snapshot = Snapshot::new("book", entity_id, day(1), change.values.clone());
    snapshots.create_snapshot(&mut snapshot).unwrap();

    assert_eq!(changes.rename_document_field("book", "name", "title").unwrap(), 1);
    assert_eq!(snapshots.rename_document_field("book", "name", "title").unwrap(), 1);
    assert_eq!(changes.remove_document_field("book", "pages").unwrap(), 1);
    assert_eq!(changes.remove_document_field("book", "pages").unwrap(), 0);

    let renamed = changes.get_change(change.id, false).unwrap().unwrap();
    assert_eq!(renamed.document_fields.iter().collect::<Vec<_>>(), vec!["title"]);
    assert_eq!(renamed.values.get("title"), Some(&FieldValue::from("Dune")));
    assert!(renamed.values.get("pages").is_none());
    assert_eq!(renamed.updated_at, change.updated_at);

    let untouched = changes.get_change(other_kind.id, false).unwrap().unwrap();
    assert!(untouched.document_fields.contains("name"));

    let snapshot_after = snapshots.get_snapshot(snapshot.id, false).unwrap().unwrap();
    assert!(snapshot_after.document_fields.contains("title"));
    assert_eq!(snapshot_after.updated_at, snapshot.updated_at);
}

#[test]
fn entity_round_trip_validates_and_soft_deletes() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEntityRepository::try_new(&conn, clock()).unwrap();
    let schema = book_schema();

    let mut missing_title = DocumentedObject::new(Arc::clone(&schema));
    assert!(matches!(
        repo.create_entity(&mut missing_title),
        Err(RepoError::Validation(
            RecordValidationError::MissingRequiredField(_)
        ))
    ));

    let mut entity = DocumentedObject::new(Arc::clone(&schema))
        .with_field("title", "Dune")
        .with_field("pages", 412_i64);
    let id = repo.create_entity(&mut entity).unwrap();
    assert_eq!(entity.id, Some(id));

    entity.values.insert("pages".to_string(), FieldValue::Integer(500));
    repo.update_entity(&mut entity).unwrap();
    let loaded = repo.get_entity(&schema, id, false).unwrap().unwrap();
    assert_eq!(loaded.values.get("pages"), Some(&FieldValue::Integer(500)));
    assert!(loaded.updated_at > loaded.created_at);

    repo.soft_delete_entity(&mut entity).unwrap();
    assert!(repo.get_entity(&schema, id, false).unwrap().is_none());
    assert!(repo.get_entity(&schema, id, true).unwrap().unwrap().is_deleted());
}

#[test]
fn entity_payload_fields_follow_renames() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteEntityRepository::try_new(&conn, clock()).unwrap();
    let old_schema = Arc::new(
        DocumentedSchema::builder("book")
            .field("name", FieldKind::Text)
            .build()
            .unwrap(),
    );
    let mut entity = DocumentedObject::new(old_schema).with_field("name", "Dune");
    let id = repo.create_entity(&mut entity).unwrap();

    assert_eq!(repo.rename_payload_field("book", "name", "title").unwrap(), 1);

    let new_schema = Arc::new(
        DocumentedSchema::builder("book")
            .field("title", FieldKind::Text)
            .build()
            .unwrap(),
    );
    let loaded = repo.get_entity(&new_schema, id, false).unwrap().unwrap();
    assert_eq!(loaded.values.get("title"), Some(&FieldValue::from("Dune")));
}
