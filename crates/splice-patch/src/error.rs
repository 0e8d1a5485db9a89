/// Error types for patch registration and manifest loading

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PatchError>;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: fancy_regex::Error,
    },

    #[error("Rule set for '{owner}' has an empty signature")]
    EmptySignature { owner: String },

    #[error("Rule set for '{owner}' has no rules")]
    NoRules { owner: String },

    #[error("Anchor of rule {rule} in '{owner}' is empty")]
    EmptyAnchor { owner: String, rule: usize },

    #[error("Expected occurrence count of rule {rule} in '{owner}' must be at least 1")]
    ZeroOccurrences { owner: String, rule: usize },

    #[error("Unknown rule set: {0}")]
    UnknownRuleSet(usize),

    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("Multiple errors occurred:\n{}", .0.iter().map(|e| format!("  - {}", e)).collect::<Vec<_>>().join("\n"))]
    Multiple(Vec<PatchError>),
}

impl PatchError {
    pub fn invalid_pattern(pattern: impl Into<String>, source: fancy_regex::Error) -> Self {
        PatchError::InvalidPattern {
            pattern: pattern.into(),
            source,
        }
    }
}
