//! Test doubles and fixtures for exercising the hub without external tools.
//!
//! - [`ScriptedTool`]: an in-process stage tool with scripted failures
//! - [`ScriptedProvisioner`]: a session provisioner with scripted failures
//! - [`fixtures`]: projects, configuration and fully wired hubs

pub mod fixtures;
mod provisioner;
mod tool;

pub use provisioner::ScriptedProvisioner;
pub use tool::ScriptedTool;
