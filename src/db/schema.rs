/// Schema for the local offline database.
pub const SCHEMA: &str = r#"
-- Actions recorded while offline, drained by background sync
CREATE TABLE IF NOT EXISTS sync_tasks (
    id TEXT PRIMARY KEY,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at TEXT NOT NULL,
    synced_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_sync_tasks_status ON sync_tasks(status, created_at);
"#;
