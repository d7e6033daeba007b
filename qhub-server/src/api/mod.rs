//! API endpoint handlers.

pub mod artifacts;
pub mod health;
pub mod projects;
pub mod runs;
pub mod sessions;
