//! Run persistence
//!
//! The walker only talks to a [`RunStore`]. Step records are keyed by
//! `(run_id, step_id, attempt)`; appending a record that already exists
//! upgrades a `started` record to its terminal status once and is otherwise a
//! no-op, so replays after a restart are harmless.

mod memory;
mod schema;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::state::{ErrorRecord, RunContext, RunState, RunStatus, StepTraceEntry};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

/// Errors from a run store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("run '{run_id}' not found")]
    NotFound { run_id: String },

    #[error("run '{run_id}' is {from} and cannot become {to}")]
    TerminalStatus {
        run_id: String,
        from: RunStatus,
        to: RunStatus,
    },

    #[error("run '{run_id}' has no error '{error_id}'")]
    UnknownError { run_id: String, error_id: String },

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("store lock poisoned")]
    Lock,
}

/// One row of a run listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunListing {
    pub run_id: String,
    pub graph_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Persistence boundary between the walker and storage
pub trait RunStore: Send + Sync {
    /// Create a pending run and return its id
    fn create_run(
        &self,
        graph_id: &str,
        trigger_input: &Value,
        context: &RunContext,
    ) -> Result<String, StoreError>;

    /// Insert a step record, or upgrade a `started` record to its terminal status
    ///
    /// Rejected with [`StoreError::TerminalStatus`] once the run has finished.
    fn append_step_record(&self, run_id: &str, entry: &StepTraceEntry) -> Result<(), StoreError>;

    /// Append to the error ledger; appending the same id twice is a no-op
    ///
    /// Rejected with [`StoreError::TerminalStatus`] once the run has finished.
    fn append_error(&self, run_id: &str, record: &ErrorRecord) -> Result<(), StoreError>;

    /// Move the run to a new status; a terminal run rejects any change
    fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError>;

    /// Replace the stored agent state and message channel
    fn save_state(
        &self,
        run_id: &str,
        agent_state: &Map<String, Value>,
        messages: &[Value],
    ) -> Result<(), StoreError>;

    /// Mark an error as resolved
    fn resolve_error(&self, run_id: &str, error_id: &str) -> Result<(), StoreError>;

    /// Load a run with its trace, errors and recomputed metrics
    fn get_run(&self, run_id: &str) -> Result<RunState, StoreError>;

    /// Most recently created runs first
    fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError>;
}

/// Status transition check shared by the store implementations
fn check_transition(run_id: &str, from: RunStatus, to: RunStatus) -> Result<(), StoreError> {
    if from.is_terminal() && from != to {
        return Err(StoreError::TerminalStatus {
            run_id: run_id.to_string(),
            from,
            to,
        });
    }
    Ok(())
}

/// Trace and ledger writes are only accepted while a run is live
fn check_writable(run_id: &str, status: RunStatus) -> Result<(), StoreError> {
    if status.is_terminal() {
        return Err(StoreError::TerminalStatus {
            run_id: run_id.to_string(),
            from: status,
            to: RunStatus::Running,
        });
    }
    Ok(())
}
