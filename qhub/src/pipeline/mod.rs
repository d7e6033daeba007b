//! Pipeline declaration and execution.
//!
//! - [`PipelineGraph`]: validated stage ordering and artifact contracts
//! - [`PipelineOrchestrator`]: schedules stage executions for runs

mod graph;
mod orchestrator;

pub use graph::PipelineGraph;
pub use orchestrator::PipelineOrchestrator;
