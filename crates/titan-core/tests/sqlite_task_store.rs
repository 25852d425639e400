mod support;

use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use titan_core::models::{AiSettings, CoreErrorKind, Task, TaskId, TaskStatus, TaskType};
use titan_core::persistence::{MigrationStore, SettingsStore, TaskStore};
use titan_core::sqlite::{SqliteStore, current_schema_version, migration, migrations};

use support::test_db_path;

fn migrated_store(test_name: &str) -> (SqliteStore, PathBuf) {
    let path = test_db_path(test_name);
    let store = SqliteStore::new(&path);
    store.migrate_to_latest().unwrap();
    (store, path)
}

fn task(id: u64, created_ms: u64) -> Task {
    Task::new(
        TaskId(id),
        TaskType::DataExtraction,
        format!("extract {id}"),
        serde_json::from_value(json!({ "content": "Rust borrow checker", "depth": 2 })).unwrap(),
        UNIX_EPOCH + Duration::from_millis(created_ms),
    )
}

#[test]
fn migration_versions_are_strictly_increasing() {
    let mut previous = 0;
    for entry in migrations() {
        assert!(entry.version > previous);
        assert!(!entry.up_sql.trim().is_empty());
        assert!(!entry.down_sql.trim().is_empty());
        previous = entry.version;
    }
    let latest = migration(current_schema_version()).expect("latest migration must exist");
    assert_eq!(latest.version, current_schema_version());
}

#[test]
fn migrations_apply_and_roll_back() {
    let path = test_db_path("migrations");
    let store = SqliteStore::new(&path);
    assert_eq!(store.current_version().unwrap(), 0);
    assert_eq!(store.planned_migrations(0)[0].version, 1);

    store.migrate_to_latest().unwrap();
    assert_eq!(store.current_version().unwrap(), current_schema_version());

    store.apply_migration(0).unwrap();
    assert_eq!(store.current_version().unwrap(), 0);

    let error = store
        .apply_migration(current_schema_version() + 1)
        .unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);

    let _ = std::fs::remove_file(path);
}

#[test]
fn task_operations_require_a_migrated_schema() {
    let path = test_db_path("unmigrated");
    let store = SqliteStore::new(&path);

    let error = store.list_all().unwrap_err();
    assert_eq!(error.kind, CoreErrorKind::StorageFailure);
    assert!(error.message.contains("not initialized"));

    let _ = std::fs::remove_file(path);
}

#[test]
fn put_inserts_and_replaces_records() {
    let (store, path) = migrated_store("put");
    let mut record = task(1, 1_000);
    store.put(&record).unwrap();

    record.mark_running().unwrap();
    record.apply_progress(0.5).unwrap();
    record
        .complete(Some("[\"rust\"]".to_string()), UNIX_EPOCH + Duration::from_millis(9_000))
        .unwrap();
    store.put(&record).unwrap();

    let listed = store.list_all().unwrap();
    assert_eq!(listed, vec![record]);

    let _ = std::fs::remove_file(path);
}

#[test]
fn list_is_newest_first() {
    let (store, path) = migrated_store("ordering");
    store.put(&task(1, 1_000)).unwrap();
    store.put(&task(2, 3_000)).unwrap();
    store.put(&task(3, 2_000)).unwrap();

    let ids: Vec<u64> = store.list_all().unwrap().iter().map(|task| task.id.0).collect();
    assert_eq!(ids, vec![2, 3, 1]);

    let _ = std::fs::remove_file(path);
}

#[test]
fn next_task_id_survives_deletion() {
    let (store, path) = migrated_store("high-water");
    assert_eq!(store.next_task_id().unwrap(), 1);

    store.put(&task(4, 1_000)).unwrap();
    store.put(&task(2, 2_000)).unwrap();
    assert_eq!(store.next_task_id().unwrap(), 5);

    store.delete(TaskId(4)).unwrap();
    assert_eq!(store.next_task_id().unwrap(), 5);

    store.delete_all().unwrap();
    assert!(store.list_all().unwrap().is_empty());
    assert_eq!(store.next_task_id().unwrap(), 5);

    let _ = std::fs::remove_file(path);
}

#[test]
fn deleting_a_missing_task_is_not_an_error() {
    let (store, path) = migrated_store("delete-missing");
    store.delete(TaskId(77)).unwrap();
    let _ = std::fs::remove_file(path);
}

#[test]
fn failed_tasks_keep_their_error() {
    let (store, path) = migrated_store("failed");
    let mut record = task(1, 1_000);
    record.mark_running().unwrap();
    record.fail("quota exceeded", SystemTime::now()).unwrap();
    store.put(&record).unwrap();

    let listed = store.list_all().unwrap();
    assert_eq!(listed[0].status, TaskStatus::Failed);
    assert_eq!(listed[0].error.as_deref(), Some("quota exceeded"));
    assert!(listed[0].result.is_none());

    let _ = std::fs::remove_file(path);
}

#[test]
fn settings_are_absent_until_saved() {
    let (store, path) = migrated_store("settings-store");
    assert!(store.load_settings().unwrap().is_none());

    let settings = AiSettings {
        model: "titan-large".to_string(),
        ..AiSettings::default()
    };
    store.save_settings(&settings).unwrap();
    assert_eq!(store.load_settings().unwrap(), Some(settings));

    let _ = std::fs::remove_file(path);
}
