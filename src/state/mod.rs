//! Run state, its reducer and derived metrics

mod metrics;
mod reducer;
mod run_state;

pub use metrics::compute_metrics;
pub use reducer::{CHANNELS, MergeStrategy, RunStateDelta, merge, strategy_for};
pub use run_state::{
    ErrorDetail, ErrorRecord, Metrics, RunContext, RunState, RunStatus, StepDuration,
    StepStatus, StepTraceEntry,
};
