//! Graph walker
//!
//! Walks a compiled plan one node at a time. A node runs only once a
//! predecessor has activated it; the plan order makes fan-out targets run in
//! their declared order and joins run after every activated predecessor. Every
//! change to the run goes through the reducer, and every attempt is written to
//! the store as it starts and again when it settles.

use super::cancel::CancellationToken;
use super::events::{EventSink, NoopSink, RunEvent};
use super::plan::ExecutionPlan;
use super::EngineError;
use crate::condition::evaluate;
use crate::config::{CaptureConfig, Defaults, EngineConfig, GraphDefinition, NodeDefinition, NodeType};
use crate::error::StepError;
use crate::invoker::{Invocation, StepInvoker};
use crate::retry::{AttemptEvent, AttemptObserver, RetryPolicy, run_with_policy};
use crate::state::{
    ErrorRecord, RunContext, RunState, RunStateDelta, RunStatus, StepStatus, StepTraceEntry, merge,
};
use crate::store::{RunStore, StoreError};
use crate::template::TemplateEngine;
use chrono::Utc;
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

type WalkFuture<'a> = Pin<Box<dyn Future<Output = Result<WalkOutcome, StoreError>> + Send + 'a>>;

/// Position inside a logic-loop
#[derive(Debug, Clone)]
struct LoopFrame {
    node: String,
    index: u32,
    item: Value,
}

/// How a (sub-)walk ended
#[derive(Debug)]
enum WalkOutcome {
    Completed,
    Failed { step_id: String, error: StepError },
    Cancelled,
}

/// How one node ended
#[derive(Debug)]
enum StepOutcome {
    Done(Value),
    Failed { step_id: String, error: StepError },
    Cancelled,
}

/// Mutable state of one run while it is walked
struct RunCursor<'g> {
    graph: &'g GraphDefinition,
    plan: ExecutionPlan,
    state: RunState,
    /// Attempts made so far per step id, across loop iterations and recoveries
    attempts: HashMap<String, u32>,
    cancel: &'g CancellationToken,
}

impl RunCursor<'_> {
    fn apply(&mut self, delta: RunStateDelta) {
        self.state = merge(std::mem::take(&mut self.state), delta);
    }

    /// The context bindings and conditions are evaluated against
    fn eval_context(&self, frame: Option<&LoopFrame>) -> Value {
        let mut ctx = json!({
            "trigger": self.state.input,
            "steps": self.state.agent_state,
            "run": {
                "id": self.state.run_id,
                "graph": self.state.graph_id,
            },
        });
        if let Some(frame) = frame {
            ctx["loop"] = json!({
                "index": frame.index,
                "item": frame.item,
                "node": frame.node,
            });
        }
        ctx
    }
}

/// Executes graphs against an invoker and a run store
pub struct GraphWalker {
    invoker: Arc<dyn StepInvoker>,
    store: Arc<dyn RunStore>,
    sink: Arc<dyn EventSink>,
    templates: TemplateEngine,
    defaults: Defaults,
    capture: CaptureConfig,
}

impl GraphWalker {
    pub fn new(invoker: Arc<dyn StepInvoker>, store: Arc<dyn RunStore>) -> Self {
        Self {
            invoker,
            store,
            sink: Arc::new(NoopSink),
            templates: TemplateEngine::new(),
            defaults: Defaults::default(),
            capture: CaptureConfig::default(),
        }
    }

    pub fn with_events(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Take retry defaults and capture flags from the engine config
    pub fn with_config(mut self, config: &EngineConfig) -> Self {
        self.defaults = config.defaults.clone();
        self.capture = config.capture;
        self
    }

    pub fn with_defaults(mut self, defaults: Defaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// Run a graph to a terminal status
    pub async fn execute(
        &self,
        graph: &GraphDefinition,
        trigger_input: Value,
    ) -> Result<RunState, EngineError> {
        let cancel = CancellationToken::new();
        self.execute_with(graph, trigger_input, RunContext::default(), &cancel)
            .await
    }

    /// Run a graph with a caller-provided context and cancellation token
    ///
    /// A graph that does not compile is rejected before any run is created.
    /// Step failures end up in the returned state; only store failures are
    /// returned as errors.
    pub async fn execute_with(
        &self,
        graph: &GraphDefinition,
        trigger_input: Value,
        context: RunContext,
        cancel: &CancellationToken,
    ) -> Result<RunState, EngineError> {
        let plan = ExecutionPlan::compile(graph)?;
        let run_id = self.store.create_run(&graph.id, &trigger_input, &context)?;
        tracing::info!(run_id = %run_id, graph = %graph.id, steps = plan.len(), "Run created");

        let mut run = RunCursor {
            graph,
            plan,
            state: RunState::new(run_id.clone(), graph.id.clone(), trigger_input, context),
            attempts: HashMap::new(),
            cancel,
        };

        match self.drive(&mut run).await {
            Ok(()) => Ok(run.state),
            Err(e) => {
                tracing::error!(run_id = %run_id, error = %e, "Run store failed, abandoning run");
                if let Err(status_err) = self.store.update_run_status(&run_id, RunStatus::Failed) {
                    tracing::warn!(run_id = %run_id, error = %status_err, "Could not mark run failed");
                }
                Err(e.into())
            }
        }
    }

    async fn drive(&self, run: &mut RunCursor<'_>) -> Result<(), StoreError> {
        let started = Instant::now();
        let run_id = run.state.run_id.clone();

        self.store.update_run_status(&run_id, RunStatus::Running)?;
        run.apply(
            RunStateDelta::new()
                .with_status(RunStatus::Running)
                .touched(Utc::now()),
        );
        self.sink.emit(&RunEvent::RunStarted {
            run_id: run_id.clone(),
            graph_id: run.graph.id.clone(),
            steps: run.plan.len(),
        });

        let start_at = run.graph.start_at.clone();
        let status = match self.walk(run, &start_at, None).await? {
            WalkOutcome::Completed => RunStatus::Completed,
            WalkOutcome::Cancelled => {
                tracing::warn!(run_id = %run_id, "Run cancelled");
                RunStatus::Cancelled
            }
            WalkOutcome::Failed { step_id, error } => {
                tracing::error!(run_id = %run_id, step = %step_id, error = %error, "Run failed");
                RunStatus::Failed
            }
        };

        self.store.update_run_status(&run_id, status)?;
        run.apply(RunStateDelta::new().with_status(status).touched(Utc::now()));

        let duration_ms = started.elapsed().as_millis() as u64;
        tracing::info!(
            run_id = %run_id,
            status = %status,
            duration_ms,
            completed = run.state.metrics.completed_steps,
            failed = run.state.metrics.failed_steps,
            "Run finished"
        );
        self.sink.emit(&RunEvent::RunFinished {
            run_id,
            status,
            duration_ms,
            steps_completed: run.state.metrics.completed_steps,
        });
        Ok(())
    }

    /// Walk the plan from `entry` until no activated node is left
    fn walk<'a, 'g: 'a>(
        &'a self,
        run: &'a mut RunCursor<'g>,
        entry: &'a str,
        frame: Option<&'a LoopFrame>,
    ) -> WalkFuture<'a> {
        Box::pin(async move {
            let graph = run.graph;
            let Some(start) = run.plan.position(entry) else {
                return Ok(WalkOutcome::Completed);
            };

            let mut activated: HashSet<String> = HashSet::from([entry.to_string()]);
            for index in start..run.plan.len() {
                let id = run.plan.order()[index].clone();
                if !activated.contains(&id) {
                    continue;
                }
                if run.cancel.is_cancelled() {
                    return Ok(WalkOutcome::Cancelled);
                }
                let Some(node) = graph.node(&id) else {
                    continue;
                };

                let outcome = match node.node_type {
                    NodeType::LogicLoop => self.run_loop(run, &id, node, frame).await?,
                    _ => self.run_step(run, &id, node, frame).await?,
                };

                match outcome {
                    StepOutcome::Done(output) => {
                        let Some(ref next) = node.next else {
                            continue;
                        };
                        if node.node_type == NodeType::LogicCondition {
                            let result = output["result"].as_bool().unwrap_or(false);
                            let target = next.branch(result);
                            tracing::debug!(step = %id, result, target = ?target, "Branch selected");
                            self.sink.emit(&RunEvent::BranchSelected {
                                run_id: run.state.run_id.clone(),
                                step_id: id.clone(),
                                outcome: result,
                                target: target.map(String::from),
                            });
                            if let Some(target) = target {
                                activated.insert(target.to_string());
                            }
                        } else {
                            activated.extend(next.targets().into_iter().map(String::from));
                        }
                    }
                    StepOutcome::Failed { step_id, error } => match node.on_error {
                        Some(ref recovery) => {
                            tracing::info!(step = %id, recovery = %recovery, "Following onError");
                            activated.insert(recovery.clone());
                        }
                        None => return Ok(WalkOutcome::Failed { step_id, error }),
                    },
                    StepOutcome::Cancelled => return Ok(WalkOutcome::Cancelled),
                }
            }

            Ok(WalkOutcome::Completed)
        })
    }

    /// Dispatch one node under its retry policy
    async fn run_step(
        &self,
        run: &mut RunCursor<'_>,
        id: &str,
        node: &NodeDefinition,
        frame: Option<&LoopFrame>,
    ) -> Result<StepOutcome, StoreError> {
        let ctx = run.eval_context(frame);
        let params = self
            .templates
            .render_bindings(&node.input, &ctx)
            .map_err(|e| StepError::validation(e.to_string()));
        let policy = RetryPolicy::for_node(&self.defaults, node);
        let base_attempt = run.attempts.get(id).copied().unwrap_or(0);

        let mut recorder = AttemptRecorder {
            store: self.store.as_ref(),
            sink: self.sink.as_ref(),
            capture: self.capture,
            run_id: &run.state.run_id,
            step_id: id,
            step_name: run.graph.node_name(id),
            node_type: node.node_type,
            base_attempt,
            frame,
            params: params.as_ref().ok(),
            context: &ctx,
            current: None,
            attempts_made: 0,
            delta: RunStateDelta::new(),
            store_error: None,
        };

        let invoker = self.invoker.as_ref();
        let ctx_ref = &ctx;
        let params_ref = &params;
        let result = run_with_policy(
            &policy,
            |_attempt| async move {
                let params = params_ref.clone()?;
                let invocation = Invocation::new(id, node, params, ctx_ref);
                let output = invoker
                    .invoke(&invocation)
                    .await
                    .map_err(|e| e.with_step(id))?;
                check_output(id, node, output)
            },
            &mut recorder,
        )
        .await;

        let attempts_made = recorder.attempts_made;
        let store_error = recorder.store_error.take();
        let mut delta = std::mem::take(&mut recorder.delta).touched(Utc::now());
        drop(recorder);

        run.attempts.insert(id.to_string(), base_attempt + attempts_made);

        let outcome = match result {
            Ok(output) => {
                if let Some(messages) = output.get("messages").and_then(Value::as_array) {
                    for message in messages {
                        delta = delta.with_message(message.clone());
                    }
                }
                StepOutcome::Done(output)
            }
            Err(error) => StepOutcome::Failed {
                step_id: id.to_string(),
                error,
            },
        };
        if let StepOutcome::Done(ref output) = outcome {
            delta = delta.with_agent_state(id, output.clone());
        }
        run.apply(delta);

        if let Some(e) = store_error {
            return Err(e);
        }
        self.store
            .save_state(&run.state.run_id, &run.state.agent_state, &run.state.messages)?;
        Ok(outcome)
    }

    /// Run a logic-loop node and its body iterations
    ///
    /// A failing body step fails the loop node, so the loop's `onError` is the
    /// recovery path. The loop's own output gains `completedIterations`.
    async fn run_loop(
        &self,
        run: &mut RunCursor<'_>,
        id: &str,
        node: &NodeDefinition,
        frame: Option<&LoopFrame>,
    ) -> Result<StepOutcome, StoreError> {
        let Some(ref config) = node.loop_config else {
            return Ok(StepOutcome::Failed {
                step_id: id.to_string(),
                error: StepError::validation("logic-loop node has no loop block").with_step(id),
            });
        };

        let mut summary = match self.run_step(run, id, node, frame).await? {
            StepOutcome::Done(output) => output,
            other => return Ok(other),
        };
        let iterations = summary["iterations"]
            .as_u64()
            .unwrap_or(0)
            .min(u64::from(config.max_iterations)) as u32;
        let items = summary["items"].as_array().cloned();

        let mut completed = 0u32;
        for index in 0..iterations {
            if run.cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            let item = items
                .as_ref()
                .and_then(|items| items.get(index as usize))
                .cloned()
                .unwrap_or(Value::Null);
            let loop_frame = LoopFrame {
                node: id.to_string(),
                index,
                item,
            };

            if let Some(ref condition) = config.while_condition {
                let ctx = run.eval_context(Some(&loop_frame));
                match evaluate(&condition.when, &ctx, condition.mode) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(step = %id, index, "Loop while condition false, stopping");
                        break;
                    }
                    Err(e) => {
                        let error = StepError::validation(format!("loop while condition: {}", e))
                            .with_step(id);
                        let attempt = run.attempts.get(id).copied().unwrap_or(1);
                        let record = ErrorRecord::from_step_error(id, attempt, &error, ctx);
                        self.store.append_error(&run.state.run_id, &record)?;
                        run.apply(RunStateDelta::new().with_error(record).touched(Utc::now()));
                        return Ok(StepOutcome::Failed {
                            step_id: id.to_string(),
                            error,
                        });
                    }
                }
            }

            tracing::debug!(step = %id, index, total = iterations, "Loop iteration");
            self.sink.emit(&RunEvent::LoopIteration {
                run_id: run.state.run_id.clone(),
                step_id: id.to_string(),
                index,
                total: iterations,
            });

            match self.walk(run, &config.body, Some(&loop_frame)).await? {
                WalkOutcome::Completed => completed += 1,
                WalkOutcome::Failed { step_id, error } => {
                    tracing::warn!(step = %id, body_step = %step_id, index, "Loop body failed");
                    return Ok(StepOutcome::Failed { step_id, error });
                }
                WalkOutcome::Cancelled => return Ok(StepOutcome::Cancelled),
            }
        }

        summary["completedIterations"] = json!(completed);
        run.apply(RunStateDelta::new().with_agent_state(id, summary.clone()));
        self.store
            .save_state(&run.state.run_id, &run.state.agent_state, &run.state.messages)?;
        Ok(StepOutcome::Done(summary))
    }
}

/// Condition handlers must hand back a boolean `result`
fn check_output(id: &str, node: &NodeDefinition, output: Value) -> Result<Value, StepError> {
    if node.node_type == NodeType::LogicCondition && !output["result"].is_boolean() {
        return Err(StepError::validation(format!(
            "logic-condition handler returned {} instead of {{\"result\": bool}}",
            output
        ))
        .with_step(id));
    }
    Ok(output)
}

/// Writes trace entries, ledger records and events as attempts happen
struct AttemptRecorder<'a> {
    store: &'a dyn RunStore,
    sink: &'a dyn EventSink,
    capture: CaptureConfig,
    run_id: &'a str,
    step_id: &'a str,
    step_name: &'a str,
    node_type: NodeType,
    /// Attempts of this step id made before this dispatch
    base_attempt: u32,
    frame: Option<&'a LoopFrame>,
    params: Option<&'a Value>,
    context: &'a Value,
    current: Option<StepTraceEntry>,
    attempts_made: u32,
    delta: RunStateDelta,
    /// First store failure; reported once the step settles
    store_error: Option<StoreError>,
}

impl AttemptRecorder<'_> {
    fn persist(&mut self, result: Result<(), StoreError>) {
        if let Err(e) = result {
            tracing::error!(step = %self.step_id, error = %e, "Failed to persist step record");
            self.store_error.get_or_insert(e);
        }
    }

    fn started_entry(&self, attempt: u32) -> StepTraceEntry {
        let mut entry = StepTraceEntry::started(self.step_id, self.step_name, self.node_type, attempt);
        if let Some(frame) = self.frame {
            entry = entry.with_parent(frame.node.as_str(), frame.index);
        }
        if self.capture.inputs {
            entry.input = self.params.cloned();
        }
        entry
    }
}

impl AttemptObserver<Value> for AttemptRecorder<'_> {
    fn on_attempt(&mut self, event: AttemptEvent<'_, Value>) {
        match event {
            AttemptEvent::Started { attempt } => {
                let attempt = self.base_attempt + attempt;
                let entry = self.started_entry(attempt);
                tracing::info!(
                    run_id = %self.run_id,
                    step = %self.step_id,
                    node_type = %self.node_type,
                    attempt,
                    "Step started"
                );
                let stored = self.store.append_step_record(self.run_id, &entry);
                self.persist(stored);
                self.sink.emit(&RunEvent::StepStarted {
                    run_id: self.run_id.to_string(),
                    step_id: self.step_id.to_string(),
                    step_name: self.step_name.to_string(),
                    node_type: self.node_type,
                    attempt,
                    iteration: self.frame.map(|f| f.index),
                });
                self.current = Some(entry);
            }
            AttemptEvent::Finished {
                attempt,
                elapsed,
                result,
                will_retry,
            } => {
                let attempt = self.base_attempt + attempt;
                self.attempts_made += 1;
                let started = self
                    .current
                    .take()
                    .unwrap_or_else(|| self.started_entry(attempt));

                let status = match result {
                    Ok(_) => StepStatus::Completed,
                    Err(_) if will_retry => StepStatus::Retrying,
                    Err(_) => StepStatus::Failed,
                };
                let mut entry = started.finish(status, Utc::now());

                match result {
                    Ok(output) => {
                        if self.capture.outputs {
                            entry.output = Some(output.clone());
                        }
                        tracing::info!(
                            step = %self.step_id,
                            attempt,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Step completed"
                        );
                        self.sink.emit(&RunEvent::StepCompleted {
                            run_id: self.run_id.to_string(),
                            step_id: self.step_id.to_string(),
                            attempt,
                            duration_ms: entry.duration_ms.unwrap_or(0),
                        });
                    }
                    Err(error) => {
                        entry = entry.with_error(error.message());
                        let record = ErrorRecord::from_step_error(
                            self.step_id,
                            attempt,
                            error,
                            self.context.clone(),
                        );
                        let stored = self.store.append_error(self.run_id, &record);
                        self.persist(stored);
                        self.delta = std::mem::take(&mut self.delta).with_error(record);

                        if will_retry {
                            tracing::warn!(step = %self.step_id, attempt, error = %error, "Step attempt failed, retrying");
                            self.sink.emit(&RunEvent::StepRetrying {
                                run_id: self.run_id.to_string(),
                                step_id: self.step_id.to_string(),
                                attempt,
                                error: error.message(),
                            });
                        } else {
                            tracing::error!(step = %self.step_id, attempt, error = %error, "Step failed");
                            self.sink.emit(&RunEvent::StepFailed {
                                run_id: self.run_id.to_string(),
                                step_id: self.step_id.to_string(),
                                attempt,
                                error: error.message(),
                            });
                        }
                    }
                }

                let stored = self.store.append_step_record(self.run_id, &entry);
                self.persist(stored);
                self.delta = std::mem::take(&mut self.delta).with_trace(entry);
            }
        }
    }
}
