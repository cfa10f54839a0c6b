//! In-process run store

use super::{RunListing, RunStore, StoreError, check_transition, check_writable};
use crate::state::{
    ErrorRecord, RunContext, RunState, RunStatus, StepStatus, StepTraceEntry, compute_metrics,
};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

struct StoredRun {
    state: RunState,
    created_at: DateTime<Utc>,
    /// Position of each (step_id, attempt) in `state.trace`
    records: HashMap<(String, u32), usize>,
}

/// Run store backed by a mutex-guarded map; runs are lost on exit
#[derive(Default)]
pub struct MemoryStore {
    runs: Mutex<HashMap<String, StoredRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_run<T>(
        &self,
        run_id: &str,
        f: impl FnOnce(&mut StoredRun) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut runs = self.runs.lock().map_err(|_| StoreError::Lock)?;
        let run = runs.get_mut(run_id).ok_or_else(|| StoreError::NotFound {
            run_id: run_id.to_string(),
        })?;
        f(run)
    }
}

impl RunStore for MemoryStore {
    fn create_run(
        &self,
        graph_id: &str,
        trigger_input: &Value,
        context: &RunContext,
    ) -> Result<String, StoreError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let state = RunState::new(
            run_id.clone(),
            graph_id,
            trigger_input.clone(),
            context.clone(),
        );
        let mut runs = self.runs.lock().map_err(|_| StoreError::Lock)?;
        runs.insert(
            run_id.clone(),
            StoredRun {
                state,
                created_at: Utc::now(),
                records: HashMap::new(),
            },
        );
        Ok(run_id)
    }

    fn append_step_record(&self, run_id: &str, entry: &StepTraceEntry) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            check_writable(run_id, run.state.status)?;
            let key = (entry.step_id.clone(), entry.attempt);
            match run.records.get(&key) {
                Some(&pos) => {
                    let existing = &mut run.state.trace[pos];
                    if existing.status == StepStatus::Started && entry.status.is_finished() {
                        *existing = entry.clone();
                    }
                }
                None => {
                    run.records.insert(key, run.state.trace.len());
                    run.state.trace.push(entry.clone());
                }
            }
            run.state.context.updated_at = Utc::now();
            Ok(())
        })
    }

    fn append_error(&self, run_id: &str, record: &ErrorRecord) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            check_writable(run_id, run.state.status)?;
            if !run.state.errors.iter().any(|e| e.id == record.id) {
                run.state.errors.push(record.clone());
            }
            Ok(())
        })
    }

    fn update_run_status(&self, run_id: &str, status: RunStatus) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            check_transition(run_id, run.state.status, status)?;
            run.state.status = status;
            run.state.context.updated_at = Utc::now();
            Ok(())
        })
    }

    fn save_state(
        &self,
        run_id: &str,
        agent_state: &Map<String, Value>,
        messages: &[Value],
    ) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            run.state.agent_state = agent_state.clone();
            run.state.messages = messages.to_vec();
            Ok(())
        })
    }

    fn resolve_error(&self, run_id: &str, error_id: &str) -> Result<(), StoreError> {
        self.with_run(run_id, |run| {
            let record = run
                .state
                .errors
                .iter_mut()
                .find(|e| e.id == error_id)
                .ok_or_else(|| StoreError::UnknownError {
                    run_id: run_id.to_string(),
                    error_id: error_id.to_string(),
                })?;
            record.resolved = true;
            Ok(())
        })
    }

    fn get_run(&self, run_id: &str) -> Result<RunState, StoreError> {
        self.with_run(run_id, |run| {
            let mut state = run.state.clone();
            state.metrics = compute_metrics(&state.trace);
            Ok(state)
        })
    }

    fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        let runs = self.runs.lock().map_err(|_| StoreError::Lock)?;
        let mut listing: Vec<RunListing> = runs
            .values()
            .map(|run| RunListing {
                run_id: run.state.run_id.clone(),
                graph_id: run.state.graph_id.clone(),
                status: run.state.status,
                created_at: run.created_at,
                updated_at: run.state.context.updated_at,
            })
            .collect();
        listing.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listing.truncate(limit);
        Ok(listing)
    }
}
