//! Database schema constants.
//!
//! Statements are applied one at a time by the migration runner, so each
//! constant holds exactly one SQL statement.

/// One row per finished run; the full summary is kept as JSON.
pub const CREATE_RUNS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    timestamp_utc TEXT NOT NULL,
    models TEXT NOT NULL,
    tasks TEXT NOT NULL,
    samples INTEGER NOT NULL,
    accuracy REAL NOT NULL,
    total_cost REAL NOT NULL,
    total_duration REAL NOT NULL,
    error_count INTEGER NOT NULL,
    summary_json TEXT NOT NULL
)
"#;

/// Flattened attempts for ad-hoc queries.
pub const CREATE_ATTEMPTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS attempts (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
    task_id TEXT NOT NULL,
    model TEXT NOT NULL,
    sample_index INTEGER NOT NULL,
    status TEXT NOT NULL,
    duration REAL NOT NULL,
    prompt_tokens INTEGER,
    completion_tokens INTEGER,
    cost REAL,
    error TEXT,
    UNIQUE(run_id, task_id, model, sample_index)
)
"#;

pub const CREATE_RUNS_TIMESTAMP_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_runs_timestamp ON runs(timestamp_utc)";

pub const CREATE_ATTEMPTS_RUN_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_attempts_run_id ON attempts(run_id)";

pub const CREATE_ATTEMPTS_MODEL_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_attempts_model ON attempts(model)";

/// Returns all schema creation statements in the correct order.
pub fn all_schema_statements() -> Vec<&'static str> {
    vec![
        CREATE_RUNS_TABLE,
        CREATE_ATTEMPTS_TABLE,
        CREATE_RUNS_TIMESTAMP_INDEX,
        CREATE_ATTEMPTS_RUN_INDEX,
        CREATE_ATTEMPTS_MODEL_INDEX,
    ]
}

/// Table names in the schema.
pub mod tables {
    pub const RUNS: &str = "runs";
    pub const ATTEMPTS: &str = "attempts";
}
