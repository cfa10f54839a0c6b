//! Graph execution
//!
//! [`ExecutionPlan::compile`] validates a graph and orders it; [`GraphWalker`]
//! walks the plan, dispatching nodes through a
//! [`StepInvoker`](crate::invoker::StepInvoker) and persisting every attempt to
//! a [`RunStore`](crate::store::RunStore).

mod cancel;
mod events;
mod plan;
mod walker;

pub use cancel::CancellationToken;
pub use events::{EventSink, NoopSink, RunEvent};
pub use plan::ExecutionPlan;
pub use walker::GraphWalker;

use crate::config::GraphDefinitionError;
use crate::store::StoreError;
use thiserror::Error;

/// Why a run could not be carried out
///
/// Step failures are not engine errors: they are recorded in the run and
/// decide its status.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Graph(#[from] GraphDefinitionError),

    #[error("run store error: {0}")]
    Store(#[from] StoreError),
}
