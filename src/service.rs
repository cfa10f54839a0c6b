//! Run service: execution plus read access to stored runs

use crate::config::GraphDefinition;
use crate::engine::{CancellationToken, EngineError, GraphWalker};
use crate::state::{RunContext, RunState};
use crate::store::{RunListing, RunStore, StoreError};
use crate::tracer::{StepDetail, Summary, step_detail, summarize};
use serde_json::Value;
use std::sync::Arc;

/// Front door for embedding applications and the CLI
pub struct RunService {
    walker: GraphWalker,
    store: Arc<dyn RunStore>,
}

impl RunService {
    pub fn new(walker: GraphWalker) -> Self {
        let store = walker.store().clone();
        Self { walker, store }
    }

    pub async fn execute(
        &self,
        graph: &GraphDefinition,
        trigger_input: Value,
        context: RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunState, EngineError> {
        self.walker
            .execute_with(graph, trigger_input, context, cancel)
            .await
    }

    pub fn get_run(&self, run_id: &str) -> Result<RunState, StoreError> {
        self.store.get_run(run_id)
    }

    pub fn get_summary(&self, run_id: &str) -> Result<Summary, StoreError> {
        Ok(summarize(&self.store.get_run(run_id)?))
    }

    /// `None` when the run exists but the step never ran
    pub fn get_step_detail(
        &self,
        run_id: &str,
        step_id: &str,
    ) -> Result<Option<StepDetail>, StoreError> {
        Ok(step_detail(&self.store.get_run(run_id)?, step_id))
    }

    /// Mark a ledger entry as handled; the entry itself is kept
    pub fn resolve_error(&self, run_id: &str, error_id: &str) -> Result<(), StoreError> {
        self.store.resolve_error(run_id, error_id)?;
        tracing::info!(run_id, error_id, "Error resolved");
        Ok(())
    }

    pub fn list_runs(&self, limit: usize) -> Result<Vec<RunListing>, StoreError> {
        self.store.list_runs(limit)
    }
}
