//! Identifier generation.

use uuid::Uuid;

/// Generates a new UUID v4.
#[must_use]
pub fn generate_uuid() -> Uuid {
    Uuid::new_v4()
}

/// Generates a new UUID v7 (time-ordered).
#[must_use]
pub fn generate_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Generates a prefixed, time-ordered identifier such as `run-0190...`.
///
/// The simple (hyphen-free) form keeps identifiers safe to use as storage
/// key segments and directory names.
#[must_use]
pub fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}-{}", generate_uuid_v7().simple())
}

/// Returns true if `id` can be used as a single storage key segment.
///
/// Allowed characters are ASCII alphanumerics, `-`, `_` and `.`, and the
/// id may not start with `.`.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_uuid_is_v4() {
        assert_eq!(generate_uuid().get_version_num(), 4);
    }

    #[test]
    fn test_prefixed_ids_are_ordered() {
        let first = prefixed_id("run");
        let second = prefixed_id("run");
        assert!(first.starts_with("run-"));
        assert_ne!(first, second);
        assert!(is_valid_id(&first));
    }

    #[test]
    fn test_is_valid_id() {
        assert!(is_valid_id("proj-42"));
        assert!(is_valid_id("my_project.v2"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id(".."));
        assert!(!is_valid_id(".hidden"));
        assert!(!is_valid_id("a/b"));
        assert!(!is_valid_id("has space"));
    }
}
