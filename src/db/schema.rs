//! Database schema and migrations for warden.
//!
//! Migrations are applied sequentially when the database is first opened or
//! upgraded.

/// Database migrations.
///
/// Each migration is a SQL script that will be executed in order.
/// The schema_version table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: Script definitions
    r#"
CREATE TABLE scripts (
    id          TEXT PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE,
    category    TEXT NOT NULL,           -- 'manual', 'hook', 'router', 'cron', ...
    content     TEXT NOT NULL,
    enabled     INTEGER NOT NULL DEFAULT 1,
    priority    INTEGER NOT NULL DEFAULT 0,
    metadata    TEXT NOT NULL DEFAULT '{}',  -- JSON object
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE INDEX idx_scripts_category ON scripts(category);
CREATE INDEX idx_scripts_enabled ON scripts(enabled);
"#,
    // v2: Execution log
    r#"
CREATE TABLE script_logs (
    id              INTEGER PRIMARY KEY AUTOINCREMENT,
    script_id       TEXT NOT NULL,
    trigger_type    TEXT NOT NULL,       -- 'manual', 'hook', 'cron', 'route'
    status          TEXT NOT NULL,       -- 'success', 'error', 'timeout'
    executed_at     TEXT NOT NULL,
    execution_ms    INTEGER NOT NULL,
    input           TEXT,
    output          TEXT,
    error_message   TEXT,
    stack_trace     TEXT
);

CREATE INDEX idx_script_logs_script_id ON script_logs(script_id);
CREATE INDEX idx_script_logs_executed_at ON script_logs(executed_at);
"#,
    // v3: Records written by `dbx` scripts
    r#"
CREATE TABLE script_records (
    collection  TEXT NOT NULL,
    id          TEXT NOT NULL,
    data        TEXT NOT NULL DEFAULT '{}',  -- JSON object
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE INDEX idx_script_records_created_at ON script_records(collection, created_at);
"#,
];
