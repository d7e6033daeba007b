//! Utility functions for identifiers, timestamps and hashing.

pub mod hashing;
mod ids;
pub mod timestamps;

pub use hashing::{normalize_semantic, sha256_hex, KeyHasher};
pub use ids::{generate_uuid, generate_uuid_v7, is_valid_id, prefixed_id};
pub use timestamps::{iso_timestamp, now_utc, Timestamp};
