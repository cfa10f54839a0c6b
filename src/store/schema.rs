//! Database schema for run persistence

use rusqlite::Connection;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS runs (
            id TEXT PRIMARY KEY,
            graph_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending',
            input TEXT NOT NULL,
            workspace_id TEXT,
            user_id TEXT,
            agent_state TEXT NOT NULL DEFAULT '{}',
            messages TEXT NOT NULL DEFAULT '[]',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_runs_graph ON runs(graph_id);
        CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);

        CREATE TABLE IF NOT EXISTS step_records (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            run_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            step_name TEXT NOT NULL,
            node_type TEXT NOT NULL,
            parent_step_id TEXT,
            iteration INTEGER,
            status TEXT NOT NULL,
            start_time TEXT NOT NULL,
            end_time TEXT,
            duration_ms INTEGER,
            input TEXT,
            output TEXT,
            error TEXT,
            UNIQUE(run_id, step_id, attempt),
            FOREIGN KEY(run_id) REFERENCES runs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_step_records_run ON step_records(run_id);

        CREATE TABLE IF NOT EXISTS errors (
            id TEXT PRIMARY KEY,
            run_id TEXT NOT NULL,
            step_id TEXT NOT NULL,
            attempt INTEGER NOT NULL,
            timestamp TEXT NOT NULL,
            message TEXT NOT NULL,
            code TEXT NOT NULL,
            stack TEXT,
            context TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            FOREIGN KEY(run_id) REFERENCES runs(id)
        );

        CREATE INDEX IF NOT EXISTS idx_errors_run ON errors(run_id);
        CREATE INDEX IF NOT EXISTS idx_errors_step ON errors(run_id, step_id);
        "#,
    )
}
