//! Content-addressed, versioned artifact storage.

mod store;

pub use store::{ArtifactDraft, ArtifactStore, OutputSet};
