//! Stage execution.
//!
//! A stage is executed by the tool bound to its name in the [`ToolTable`].
//! The [`StageRunner`] prepares an isolated execution directory holding
//! only the declared inputs, enforces the deadline and cancellation, and
//! registers the produced files as new artifact versions.

mod process;
mod runner;
mod tools;
mod workdir;

pub use runner::{StageOutcome, StageRunRequest, StageRunner};
pub use tools::{FnTool, InProcessTool, ProcessTool, StageTool, ToolInvocation, ToolTable};
