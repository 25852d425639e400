#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SqliteMigration {
    pub version: i64,
    pub name: &'static str,
    pub up_sql: &'static str,
    pub down_sql: &'static str,
}

const MIGRATION_0001: SqliteMigration = SqliteMigration {
    version: 1,
    name: "initial_task_schema",
    up_sql: r#"
CREATE TABLE IF NOT EXISTS ai_tasks (
    task_id INTEGER PRIMARY KEY,
    task_type TEXT NOT NULL,
    description TEXT NOT NULL,
    parameters_json TEXT NOT NULL DEFAULT '{}',
    status TEXT NOT NULL,
    progress REAL NOT NULL DEFAULT 0,
    result TEXT,
    error TEXT,
    created_at_ms INTEGER NOT NULL,
    completed_at_ms INTEGER
);

CREATE TABLE IF NOT EXISTS app_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#,
    down_sql: r#"
DROP TABLE IF EXISTS app_settings;
DROP TABLE IF EXISTS ai_tasks;
"#,
};

const MIGRATION_0002: SqliteMigration = SqliteMigration {
    version: 2,
    name: "add_task_retention_index",
    up_sql: r#"
CREATE INDEX IF NOT EXISTS idx_ai_tasks_status_completed
    ON ai_tasks (status, completed_at_ms);

CREATE INDEX IF NOT EXISTS idx_ai_tasks_created
    ON ai_tasks (created_at_ms DESC, task_id DESC);
"#,
    down_sql: r#"
DROP INDEX IF EXISTS idx_ai_tasks_created;
DROP INDEX IF EXISTS idx_ai_tasks_status_completed;
"#,
};

const MIGRATIONS: [SqliteMigration; 2] = [MIGRATION_0001, MIGRATION_0002];

pub fn migrations() -> &'static [SqliteMigration] {
    &MIGRATIONS
}

pub fn migration(version: i64) -> Option<&'static SqliteMigration> {
    MIGRATIONS.iter().find(|entry| entry.version == version)
}

pub fn current_schema_version() -> i64 {
    MIGRATIONS.last().map(|entry| entry.version).unwrap_or(0)
}
