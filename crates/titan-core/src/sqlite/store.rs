use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rusqlite::{Connection, OptionalExtension, Row, params};

use crate::models::{
    AiSettings, CoreError, CoreErrorKind, Task, TaskId, TaskParameters, TaskStatus, TaskType,
};
use crate::persistence::{MigrationStore, PersistenceResult, SettingsStore, TaskStore};
use crate::sqlite::migrations::{SqliteMigration, current_schema_version, migration, migrations};

const MIGRATIONS_TABLE: &str = "titan_schema_migrations";
const SETTINGS_KEY: &str = "ai_settings";
const HIGH_WATER_KEY: &str = "task_id_high_water";

pub struct SqliteStore {
    database_path: PathBuf,
}

impl SqliteStore {
    pub fn new(database_path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: database_path.into(),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.database_path
    }

    pub fn planned_migrations(&self, from_version: i64) -> Vec<&'static SqliteMigration> {
        migrations()
            .iter()
            .filter(|entry| entry.version > from_version)
            .collect()
    }

    pub fn migrate_to_latest(&self) -> PersistenceResult<()> {
        self.apply_migration(current_schema_version())
    }

    fn with_connection<T>(
        &self,
        operation_name: &str,
        operation: impl FnOnce(&mut Connection) -> rusqlite::Result<T>,
    ) -> PersistenceResult<T> {
        let mut connection = open_connection(&self.database_path)
            .map_err(|error| storage_error(operation_name, error))?;
        operation(&mut connection).map_err(|error| storage_error(operation_name, error))
    }
}

impl MigrationStore for SqliteStore {
    fn current_version(&self) -> PersistenceResult<i64> {
        self.with_connection("current_version", |connection| {
            ensure_migrations_table(connection)?;
            read_current_version(connection)
        })
    }

    fn apply_migration(&self, target_version: i64) -> PersistenceResult<()> {
        if target_version < 0 || target_version > current_schema_version() {
            return Err(storage_error_text(
                "apply_migration",
                format!("invalid migration target version '{target_version}'"),
            ));
        }

        if target_version > 0 && migration(target_version).is_none() {
            return Err(storage_error_text(
                "apply_migration",
                format!("migration version '{target_version}' is not defined"),
            ));
        }

        self.with_connection("apply_migration", |connection| {
            ensure_migrations_table(connection)?;
            let current_version = read_current_version(connection)?;

            if target_version == current_version {
                // DDL is all IF NOT EXISTS; replaying heals a recorded version whose
                // tables were dropped out from under us.
                for version in 1..=target_version {
                    connection.execute_batch(defined_migration(version)?.up_sql)?;
                }
                return Ok(());
            }

            if target_version > current_version {
                for version in (current_version + 1)..=target_version {
                    apply_up_migration(connection, defined_migration(version)?)?;
                }
            } else {
                for version in ((target_version + 1)..=current_version).rev() {
                    apply_down_migration(connection, defined_migration(version)?)?;
                }
            }

            Ok(())
        })
    }
}

impl TaskStore for SqliteStore {
    fn put(&self, task: &Task) -> PersistenceResult<()> {
        let parameters_json = serde_json::to_string(&task.parameters).map_err(|error| {
            storage_error_text("put", format!("failed to encode task parameters: {error}"))
        })?;

        self.with_connection("put", |connection| {
            ensure_schema_ready(connection)?;
            let task_id = task_id_to_i64(task.id)?;
            let transaction = connection.transaction()?;
            transaction.execute(
                "
INSERT INTO ai_tasks (
    task_id, task_type, description, parameters_json, status, progress,
    result, error, created_at_ms, completed_at_ms
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
ON CONFLICT(task_id) DO UPDATE SET
    task_type = excluded.task_type,
    description = excluded.description,
    parameters_json = excluded.parameters_json,
    status = excluded.status,
    progress = excluded.progress,
    result = excluded.result,
    error = excluded.error,
    created_at_ms = excluded.created_at_ms,
    completed_at_ms = excluded.completed_at_ms
",
                params![
                    task_id,
                    task.task_type.as_str(),
                    task.description.as_str(),
                    parameters_json,
                    task.status.as_str(),
                    task.progress,
                    task.result.as_deref(),
                    task.error.as_deref(),
                    to_unix_millis(task.created_at)?,
                    task.completed_at.map(to_unix_millis).transpose()?,
                ],
            )?;
            transaction.execute(
                "
INSERT INTO app_settings (key, value)
VALUES (?1, CAST(?2 AS TEXT))
ON CONFLICT(key) DO UPDATE SET
    value = CAST(MAX(CAST(value AS INTEGER), CAST(excluded.value AS INTEGER)) AS TEXT)
",
                params![HIGH_WATER_KEY, task_id],
            )?;
            transaction.commit()?;
            Ok(())
        })
    }

    fn delete(&self, task_id: TaskId) -> PersistenceResult<()> {
        self.with_connection("delete", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "DELETE FROM ai_tasks WHERE task_id = ?1",
                params![task_id_to_i64(task_id)?],
            )?;
            Ok(())
        })
    }

    fn list_all(&self) -> PersistenceResult<Vec<Task>> {
        self.with_connection("list_all", |connection| {
            ensure_schema_ready(connection)?;
            let mut statement = connection.prepare(
                "
SELECT task_id, task_type, description, parameters_json, status, progress,
       result, error, created_at_ms, completed_at_ms
FROM ai_tasks
ORDER BY created_at_ms DESC, task_id DESC
",
            )?;
            let rows = statement.query_map([], read_task_row)?;
            rows.collect()
        })
    }

    fn delete_all(&self) -> PersistenceResult<()> {
        self.with_connection("delete_all", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute("DELETE FROM ai_tasks", [])?;
            Ok(())
        })
    }

    fn next_task_id(&self) -> PersistenceResult<u64> {
        self.with_connection("next_task_id", |connection| {
            ensure_schema_ready(connection)?;
            let max_id: Option<i64> =
                connection.query_row("SELECT MAX(task_id) FROM ai_tasks", [], |row| row.get(0))?;
            let high_water: Option<i64> = connection
                .query_row(
                    "SELECT CAST(value AS INTEGER) FROM app_settings WHERE key = ?1",
                    params![HIGH_WATER_KEY],
                    |row| row.get(0),
                )
                .optional()?;
            let highest = max_id.unwrap_or(0).max(high_water.unwrap_or(0));
            Ok(i64_to_u64(highest)?.saturating_add(1))
        })
    }
}

impl SettingsStore for SqliteStore {
    fn load_settings(&self) -> PersistenceResult<Option<AiSettings>> {
        let raw: Option<String> = self.with_connection("load_settings", |connection| {
            ensure_schema_ready(connection)?;
            connection
                .query_row(
                    "SELECT value FROM app_settings WHERE key = ?1",
                    params![SETTINGS_KEY],
                    |row| row.get(0),
                )
                .optional()
        })?;

        raw.map(|raw| {
            serde_json::from_str(&raw).map_err(|error| {
                storage_error_text("load_settings", format!("malformed settings: {error}"))
            })
        })
        .transpose()
    }

    fn save_settings(&self, settings: &AiSettings) -> PersistenceResult<()> {
        let encoded = serde_json::to_string(settings).map_err(|error| {
            storage_error_text("save_settings", format!("failed to encode settings: {error}"))
        })?;
        self.with_connection("save_settings", |connection| {
            ensure_schema_ready(connection)?;
            connection.execute(
                "
INSERT INTO app_settings (key, value)
VALUES (?1, ?2)
ON CONFLICT(key) DO UPDATE SET value = excluded.value
",
                params![SETTINGS_KEY, encoded],
            )?;
            Ok(())
        })
    }
}

fn read_task_row(row: &Row<'_>) -> rusqlite::Result<Task> {
    let task_id_raw: i64 = row.get(0)?;
    let task_type_raw: String = row.get(1)?;
    let parameters_raw: String = row.get(3)?;
    let status_raw: String = row.get(4)?;
    let created_at_ms: i64 = row.get(8)?;
    let completed_at_ms: Option<i64> = row.get(9)?;

    Ok(Task {
        id: TaskId(i64_to_u64(task_id_raw)?),
        task_type: parse_task_type(&task_type_raw)?,
        description: row.get(2)?,
        parameters: parse_parameters(&parameters_raw)?,
        status: parse_task_status(&status_raw)?,
        progress: row.get(5)?,
        result: row.get(6)?,
        error: row.get(7)?,
        created_at: from_unix_millis(created_at_ms)?,
        completed_at: completed_at_ms.map(from_unix_millis).transpose()?,
    })
}

fn open_connection(database_path: &Path) -> rusqlite::Result<Connection> {
    if let Some(parent) = database_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
    }
    Connection::open(database_path)
}

fn ensure_migrations_table(connection: &Connection) -> rusqlite::Result<()> {
    connection.execute_batch(&format!(
        "
CREATE TABLE IF NOT EXISTS {MIGRATIONS_TABLE} (
    version INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    applied_at_unix INTEGER NOT NULL
);
"
    ))?;
    Ok(())
}

fn ensure_schema_ready(connection: &Connection) -> rusqlite::Result<()> {
    ensure_migrations_table(connection)?;
    let version = read_current_version(connection)?;
    if version <= 0 {
        return Err(storage_error_sqlite(
            "database schema is not initialized; apply migrations before task operations",
        ));
    }
    Ok(())
}

fn read_current_version(connection: &Connection) -> rusqlite::Result<i64> {
    connection.query_row(
        &format!("SELECT COALESCE(MAX(version), 0) FROM {MIGRATIONS_TABLE}"),
        [],
        |row| row.get(0),
    )
}

fn defined_migration(version: i64) -> rusqlite::Result<&'static SqliteMigration> {
    migration(version).ok_or_else(|| {
        storage_error_sqlite(&format!("migration version '{version}' is not defined"))
    })
}

fn apply_up_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.up_sql)?;
    transaction.execute(
        &format!(
            "INSERT INTO {MIGRATIONS_TABLE} (version, name, applied_at_unix)
             VALUES (?1, ?2, strftime('%s', 'now'))"
        ),
        (migration.version, migration.name),
    )?;
    transaction.commit()?;
    Ok(())
}

fn apply_down_migration(
    connection: &mut Connection,
    migration: &SqliteMigration,
) -> rusqlite::Result<()> {
    let transaction = connection.transaction()?;
    transaction.execute_batch(migration.down_sql)?;
    transaction.execute(
        &format!("DELETE FROM {MIGRATIONS_TABLE} WHERE version = ?1"),
        [migration.version],
    )?;
    transaction.commit()?;
    Ok(())
}

fn storage_error(operation: &str, error: rusqlite::Error) -> CoreError {
    storage_error_text(operation, error.to_string())
}

fn storage_error_sqlite(message: &str) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(Box::new(std::io::Error::other(message.to_string())))
}

fn parse_task_type(raw: &str) -> rusqlite::Result<TaskType> {
    raw.parse::<TaskType>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task type '{raw}' in sqlite record"))
    })
}

fn parse_task_status(raw: &str) -> rusqlite::Result<TaskStatus> {
    raw.parse::<TaskStatus>().map_err(|_| {
        storage_error_sqlite(&format!("unknown task status '{raw}' in sqlite record"))
    })
}

fn parse_parameters(raw: &str) -> rusqlite::Result<TaskParameters> {
    serde_json::from_str(raw).map_err(|error| {
        storage_error_sqlite(&format!("malformed task parameters in sqlite record: {error}"))
    })
}

fn to_unix_millis(value: SystemTime) -> rusqlite::Result<i64> {
    let duration = value.duration_since(UNIX_EPOCH).map_err(|error| {
        storage_error_sqlite(&format!("time before unix epoch is not supported: {error}"))
    })?;
    i64::try_from(duration.as_millis())
        .map_err(|_| storage_error_sqlite("unix timestamp millis exceed i64 range"))
}

fn from_unix_millis(value: i64) -> rusqlite::Result<SystemTime> {
    let millis = u64::try_from(value)
        .map_err(|_| storage_error_sqlite("negative unix timestamps are not supported"))?;
    Ok(UNIX_EPOCH + Duration::from_millis(millis))
}

fn task_id_to_i64(value: TaskId) -> rusqlite::Result<i64> {
    i64::try_from(value.0).map_err(|_| storage_error_sqlite("task id exceeds i64 range"))
}

fn i64_to_u64(value: i64) -> rusqlite::Result<u64> {
    u64::try_from(value).map_err(|_| storage_error_sqlite("negative task id in sqlite record"))
}

fn storage_error_text(operation: &str, message: impl AsRef<str>) -> CoreError {
    CoreError::new(
        CoreErrorKind::StorageFailure,
        format!("sqlite store '{operation}' failed: {}", message.as_ref()),
    )
}
