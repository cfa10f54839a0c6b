//! SQLite run store

use super::schema::init_schema;
use super::{RunListing, RunStore, StoreError, check_transition, check_writable};
use crate::config::NodeType;
use crate::state::{
    ErrorDetail, ErrorRecord, RunContext, RunState, RunStatus, StepTraceEntry, compute_metrics,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Run store persisted to a SQLite database
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a run database
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::Corrupt(format!(
                        "cannot create database directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        tracing::debug!(path = %path.display(), "opened run database");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// A throwaway database, mostly for tests
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Lock)
    }

    fn current_status(conn: &Connection, run_id: &str) -> Result<RunStatus, StoreError> {
        let status: Option<String> = conn
            .query_row("SELECT status FROM runs WHERE id = ?1", [run_id], |row| {
                row.get(0)
            })
            .optional()?;
        match status {
            Some(s) => parse_status(&s),
            None => Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    fn ensure_run(conn: &Connection, run_id: &str) -> Result<(), StoreError> {
        Self::current_status(conn, run_id).map(|_| ())
    }
}

impl RunStore for SqliteStore {
    fn create_run(
        &self,
        graph_id: &str,
        trigger_input: &Value,
        context: &RunContext,
    ) -> Result<String, StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO runs (id, graph_id, status, input, workspace_id, user_id, created_at, updated_at)
             VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
            params![
                run_id,
                graph_id,
                serde_json::to_string(trigger_input)?,
                context.workspace_id,
                context.user_id,
                now,
            ],
        )?;
        Ok(run_id)
    }

    fn append_step_record(&self, run_id: &str, entry: &StepTraceEntry) -> Result<(), StoreError> {
        let conn = self.conn()?;
        check_writable(run_id, Self::current_status(&conn, run_id)?)?;

        conn.execute(
            "INSERT INTO step_records (run_id, step_id, attempt, step_name, node_type, parent_step_id,
                iteration, status, start_time, end_time, duration_ms, input, output, error)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
             ON CONFLICT(run_id, step_id, attempt) DO UPDATE SET
                status = excluded.status,
                end_time = excluded.end_time,
                duration_ms = excluded.duration_ms,
                input = excluded.input,
                output = excluded.output,
                error = excluded.error
             WHERE step_records.status = 'started' AND excluded.status != 'started'",
            params![
                run_id,
                entry.step_id,
                entry.attempt,
                entry.step_name,
                entry.node_type.as_str(),
                entry.parent_step_id,
                entry.iteration,
                entry.status.as_str(),
                entry.start_time.to_rfc3339(),
                entry.end_time.map(|t| t.to_rfc3339()),
                entry.duration_ms.map(|d| d as i64),
                entry.input.as_ref().map(serde_json::to_string).transpose()?,
                entry.output.as_ref().map(serde_json::to_string).transpose()?,
                entry.error,
            ],
        )?;

        conn.execute(
            "UPDATE runs SET updated_at = ?2 WHERE id = ?1",
            params![run_id, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn append_error(&self, run_id: &str, record: &ErrorRecord) -> Result<(), StoreError> {
        let conn = self.conn()?;
        check_writable(run_id, Self::current_status(&conn, run_id)?)?;

        conn.execute(
            "INSERT OR IGNORE INTO errors (id, run_id, step_id, attempt, timestamp, message, code,
                stack, context, resolved)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.id,
                run_id,
                record.step_id,
                record.attempt,
                record.timestamp.to_rfc3339(),
                record.error.message,
                record.error.code,
                record.error.stack,
                serde_json::to_string(&record.context)?,
                record.resolved,
            ],
        )?;
        Ok(())
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let current = Self::current_status(&conn, run_id)?;
        check_transition(run_id, current, status)?;

        conn.execute(
            "UPDATE runs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![run_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    fn save_state(
        &self,
        run_id: &str,
        agent_state: &Map<String, Value>,
        messages: &[Value],
    ) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET agent_state = ?2, messages = ?3, updated_at = ?4 WHERE id = ?1",
            params![
                run_id,
                serde_json::to_string(agent_state)?,
                serde_json::to_string(messages)?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    fn resolve_error(&self, run_id: &str, error_id: &str) -> Result<(), StoreError> {
        let conn = self.conn()?;
        Self::ensure_run(&conn, run_id)?;

        let changed = conn.execute(
            "UPDATE errors SET resolved = 1 WHERE run_id = ?1 AND id = ?2",
            params![run_id, error_id],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownError {
                run_id: run_id.to_string(),
                error_id: error_id.to_string(),
            });
        }
        Ok(())
    }

    fn get_run(&self, run_id: &str) -> Result<RunState, StoreError> {
        let conn = self.conn()?;

        let row = conn
            .query_row(
                "SELECT graph_id, status, input, workspace_id, user_id, agent_state, messages, updated_at
                 FROM runs WHERE id = ?1",
                [run_id],
                |row| {
                    Ok(RunRow {
                        graph_id: row.get(0)?,
                        status: row.get(1)?,
                        input: row.get(2)?,
                        workspace_id: row.get(3)?,
                        user_id: row.get(4)?,
                        agent_state: row.get(5)?,
                        messages: row.get(6)?,
                        updated_at: row.get(7)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound {
                run_id: run_id.to_string(),
            })?;

        let mut stmt = conn.prepare(
            "SELECT step_id, attempt, step_name, node_type, parent_step_id, iteration, status,
                start_time, end_time, duration_ms, input, output, error
             FROM step_records WHERE run_id = ?1 ORDER BY seq",
        )?;
        let step_rows = stmt
            .query_map([run_id], StepRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let trace = step_rows
            .into_iter()
            .map(StepRow::into_entry)
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = conn.prepare(
            "SELECT id, step_id, attempt, timestamp, message, code, stack, context, resolved
             FROM errors WHERE run_id = ?1 ORDER BY rowid",
        )?;
        let error_rows = stmt
            .query_map([run_id], ErrorRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        let errors = error_rows
            .into_iter()
            .map(ErrorRow::into_record)
            .collect::<Result<Vec<_>, _>>()?;

        let agent_state: Map<String, Value> = serde_json::from_str(&row.agent_state)?;
        let messages: Vec<Value> = serde_json::from_str(&row.messages)?;
        let metrics = compute_metrics(&trace);

        Ok(RunState {
            run_id: run_id.to_string(),
            graph_id: row.graph_id,
            status: parse_status(&row.status)?,
            context: RunContext {
                workspace_id: row.workspace_id,
                user_id: row.user_id,
                updated_at: parse_time(&row.updated_at)?,
            },
            input: serde_json::from_str(&row.input)?,
            messages,
            agent_state,
            metrics,
            errors,
            trace,
        })
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, graph_id, status, created_at, updated_at FROM runs
             ORDER BY created_at DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(run_id, graph_id, status, created_at, updated_at)| {
                Ok(RunListing {
                    run_id,
                    graph_id,
                    status: parse_status(&status)?,
                    created_at: parse_time(&created_at)?,
                    updated_at: parse_time(&updated_at)?,
                })
            })
            .collect()
    }
}

struct RunRow {
    graph_id: String,
    status: String,
    input: String,
    workspace_id: Option<String>,
    user_id: Option<String>,
    agent_state: String,
    messages: String,
    updated_at: String,
}

struct StepRow {
    step_id: String,
    attempt: u32,
    step_name: String,
    node_type: String,
    parent_step_id: Option<String>,
    iteration: Option<u32>,
    status: String,
    start_time: String,
    end_time: Option<String>,
    duration_ms: Option<i64>,
    input: Option<String>,
    output: Option<String>,
    error: Option<String>,
}

impl StepRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            step_id: row.get(0)?,
            attempt: row.get(1)?,
            step_name: row.get(2)?,
            node_type: row.get(3)?,
            parent_step_id: row.get(4)?,
            iteration: row.get(5)?,
            status: row.get(6)?,
            start_time: row.get(7)?,
            end_time: row.get(8)?,
            duration_ms: row.get(9)?,
            input: row.get(10)?,
            output: row.get(11)?,
            error: row.get(12)?,
        })
    }

    fn into_entry(self) -> Result<StepTraceEntry, StoreError> {
        let node_type: NodeType = serde_json::from_value(Value::String(self.node_type))?;
        Ok(StepTraceEntry {
            step_id: self.step_id,
            step_name: self.step_name,
            node_type,
            attempt: self.attempt,
            parent_step_id: self.parent_step_id,
            iteration: self.iteration,
            start_time: parse_time(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_time).transpose()?,
            status: self.status.parse().map_err(StoreError::Corrupt)?,
            duration_ms: self.duration_ms.map(|d| d.max(0) as u64),
            input: self.input.as_deref().map(serde_json::from_str).transpose()?,
            output: self.output.as_deref().map(serde_json::from_str).transpose()?,
            error: self.error,
        })
    }
}

struct ErrorRow {
    id: String,
    step_id: String,
    attempt: u32,
    timestamp: String,
    message: String,
    code: String,
    stack: Option<String>,
    context: String,
    resolved: bool,
}

impl ErrorRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            step_id: row.get(1)?,
            attempt: row.get(2)?,
            timestamp: row.get(3)?,
            message: row.get(4)?,
            code: row.get(5)?,
            stack: row.get(6)?,
            context: row.get(7)?,
            resolved: row.get(8)?,
        })
    }

    fn into_record(self) -> Result<ErrorRecord, StoreError> {
        Ok(ErrorRecord {
            id: self.id,
            step_id: self.step_id,
            attempt: self.attempt,
            timestamp: parse_time(&self.timestamp)?,
            error: ErrorDetail {
                message: self.message,
                code: self.code,
                stack: self.stack,
            },
            context: serde_json::from_str(&self.context)?,
            resolved: self.resolved,
        })
    }
}

fn parse_status(s: &str) -> Result<RunStatus, StoreError> {
    s.parse().map_err(StoreError::Corrupt)
}

fn parse_time(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{}': {}", s, e)))
}
