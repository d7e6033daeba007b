//! Key-value storage backend for projects, artifacts, runs and sessions.
//!
//! Keys are `/`-separated. The layout used by the hub:
//!
//! | Key | Value |
//! |-----|-------|
//! | `projects/{project}` | [`Project`](crate::core::Project) |
//! | `blobs/{sha256}` | raw artifact file content |
//! | `artifacts/{project}/{category}/{version:020}` | [`Artifact`](crate::core::Artifact) |
//! | `outputs/{project}/{stage}/{input_key}/{execution_id}` | recorded output set |
//! | `runs/{project}/{run_id}` | [`PipelineRun`](crate::core::PipelineRun) |
//! | `sessions/{project}/{session_id}` | [`Session`](crate::core::Session) |

mod fs;
mod kv;

pub use fs::FsKvStore;
pub use kv::{load_json, store_json, validate_key, InMemoryKvStore, KvStore};
