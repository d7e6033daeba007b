//! Stage names, artifact categories and stage definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed set of pipeline stages.
///
/// Variant order is the canonical declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Produces the base IR from project source.
    Generate,
    /// Optimizes the base IR.
    Optimize,
    /// Applies error mitigation to optimized IR.
    Mitigate,
    /// Validates IR and runs security checks.
    Validate,
    /// Simulates base and optimized circuits.
    Simulate,
    /// Analyzes simulation results.
    Analyze,
    /// Runs the project's test suite against optimized IR.
    Test,
}

impl StageName {
    /// All stages in declaration order.
    pub const ALL: [Self; 7] = [
        Self::Generate,
        Self::Optimize,
        Self::Mitigate,
        Self::Validate,
        Self::Simulate,
        Self::Analyze,
        Self::Test,
    ];

    /// Returns the wire name of the stage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Generate => "generate",
            Self::Optimize => "optimize",
            Self::Mitigate => "mitigate",
            Self::Validate => "validate",
            Self::Simulate => "simulate",
            Self::Analyze => "analyze",
            Self::Test => "test",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StageName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage '{s}'"))
    }
}

/// A `/`-separated artifact category such as `ir/base`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ArtifactCategory(String);

impl ArtifactCategory {
    /// Parses and validates a category.
    ///
    /// Each segment must be non-empty and made of lowercase ASCII letters,
    /// digits, `-` or `_`.
    pub fn new(value: impl Into<String>) -> Result<Self, String> {
        let value = value.into();
        let valid = !value.is_empty()
            && value.split('/').all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
            });
        if valid {
            Ok(Self(value))
        } else {
            Err(format!("invalid artifact category '{value}'"))
        }
    }

    /// Returns the category as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ArtifactCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for ArtifactCategory {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ArtifactCategory> for String {
    fn from(value: ArtifactCategory) -> Self {
        value.0
    }
}

impl FromStr for ArtifactCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

/// Declaration of one stage's artifact contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    /// The stage.
    pub name: StageName,
    /// Input artifact categories, in order.
    #[serde(default)]
    pub inputs: Vec<ArtifactCategory>,
    /// Output artifact categories.
    pub outputs: Vec<ArtifactCategory>,
    /// Whether a re-run with identical inputs may be skipped.
    #[serde(default = "default_idempotent")]
    pub idempotent: bool,
    /// Whether the stage reads the project's `src/` tree.
    #[serde(default)]
    pub consumes_source: bool,
}

fn default_idempotent() -> bool {
    true
}

impl StageDefinition {
    /// Creates an idempotent definition with no inputs or outputs.
    #[must_use]
    pub fn new(name: StageName) -> Self {
        Self {
            name,
            inputs: Vec::new(),
            outputs: Vec::new(),
            idempotent: true,
            consumes_source: false,
        }
    }

    /// Adds an input category.
    ///
    /// # Panics
    ///
    /// Panics if `category` is not a valid category literal.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn input(mut self, category: &str) -> Self {
        self.inputs
            .push(ArtifactCategory::new(category).expect("valid category literal"));
        self
    }

    /// Adds an output category.
    ///
    /// # Panics
    ///
    /// Panics if `category` is not a valid category literal.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn output(mut self, category: &str) -> Self {
        self.outputs
            .push(ArtifactCategory::new(category).expect("valid category literal"));
        self
    }

    /// Sets the idempotency flag.
    #[must_use]
    pub fn with_idempotent(mut self, idempotent: bool) -> Self {
        self.idempotent = idempotent;
        self
    }

    /// Marks the stage as reading project source.
    #[must_use]
    pub fn with_source(mut self) -> Self {
        self.consumes_source = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_name_round_trip() {
        for stage in StageName::ALL {
            assert_eq!(stage.as_str().parse::<StageName>(), Ok(stage));
        }
        assert!("compile".parse::<StageName>().is_err());
    }

    #[test]
    fn test_stage_name_serde() {
        let json = serde_json::to_string(&StageName::Simulate).unwrap();
        assert_eq!(json, "\"simulate\"");
    }

    #[test]
    fn test_category_validation() {
        assert!(ArtifactCategory::new("ir/base").is_ok());
        assert!(ArtifactCategory::new("results/simulation/base").is_ok());
        assert!(ArtifactCategory::new("").is_err());
        assert!(ArtifactCategory::new("ir//base").is_err());
        assert!(ArtifactCategory::new("../etc").is_err());
        assert!(ArtifactCategory::new("IR/Base").is_err());
    }

    #[test]
    fn test_category_deserialize_rejects_invalid() {
        let result: Result<ArtifactCategory, _> = serde_json::from_str("\"a/../b\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_definition_builder() {
        let def = StageDefinition::new(StageName::Simulate)
            .input("ir/base")
            .input("ir/optimized")
            .output("results/simulation/base")
            .with_idempotent(false);
        assert_eq!(def.inputs.len(), 2);
        assert_eq!(def.outputs[0].as_str(), "results/simulation/base");
        assert!(!def.idempotent);
        assert!(!def.consumes_source);
    }
}
