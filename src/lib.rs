//! agent-flow: execution engine for agent workflow graphs
//!
//! A graph document ([`config::GraphDefinition`]) is compiled into an
//! [`engine::ExecutionPlan`] and walked by an [`engine::GraphWalker`]. Every
//! step attempt is retried per [`retry`] policy, recorded in a
//! [`store::RunStore`], and folded into a [`state::RunState`] through the
//! channel reducers in [`state`]. [`service::RunService`] ties execution to
//! the read side ([`tracer`] summaries and step details).

pub mod cli;
pub mod condition;
pub mod config;
pub mod engine;
pub mod error;
pub mod invoker;
pub mod logging;
pub mod retry;
pub mod service;
pub mod state;
pub mod store;
pub mod template;
pub mod tracer;
