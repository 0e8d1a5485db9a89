//! Structured patch events for the observability channel.

use std::fmt;
use std::sync::mpsc::Sender;

use thiserror::Error;

use crate::rule::Occurrences;

/// A sink for patch events, allowing a host to collect them away from the log.
pub type EventSink = Sender<PatchEvent>;

/// Index of a registered rule set, in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleSetId(pub usize);

impl fmt::Display for RuleSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of one rule inside a registered set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RuleRef {
    pub set: RuleSetId,
    pub owner: String,
    /// Position of the rule inside its set.
    pub index: usize,
}

impl fmt::Display for RuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{} rule {}", self.owner, self.set, self.index)
    }
}

/// Why a rule could not be applied.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    #[error("anchor {anchor} not found")]
    AnchorNotFound { anchor: String },

    #[error("anchor {anchor} matched {found} times, expected {expected}")]
    AmbiguousMatch {
        anchor: String,
        expected: Occurrences,
        found: usize,
    },

    #[error("replacement for anchor {anchor} panicked: {message}")]
    TransformPanicked { anchor: String, message: String },
}

/// A failed rule of a required set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("patch {rule} failed on module {module_id}: {kind}")]
pub struct RuleFailure {
    pub module_id: String,
    pub rule: RuleRef,
    pub kind: FailureKind,
}

/// Why a rule was passed over without counting as a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The rule's predicate returned false.
    PredicateRejected,
    /// The rule failed but its set is not required.
    NotRequired(FailureKind),
    /// The replacement text already surrounded the anchor.
    AlreadyApplied,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::PredicateRejected => f.write_str("predicate"),
            SkipReason::NotRequired(kind) => write!(f, "{}", kind),
            SkipReason::AlreadyApplied => f.write_str("already applied"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRule {
    pub rule: RuleRef,
    pub reason: SkipReason,
}

/// Result of running one rule against one module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleOutcome {
    Applied { replacements: usize },
    /// The replacement text was already in place; nothing changed.
    AlreadyApplied,
    /// The replacement reproduced the matched text.
    NoEffect,
    /// The rule applied but its set was rolled back after a later failure.
    Reverted,
    Skipped(SkipReason),
    Failed(FailureKind),
}

impl fmt::Display for RuleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleOutcome::Applied { replacements } => write!(f, "applied ({} replacements)", replacements),
            RuleOutcome::AlreadyApplied => f.write_str("already applied"),
            RuleOutcome::NoEffect => f.write_str("no effect"),
            RuleOutcome::Reverted => f.write_str("reverted"),
            RuleOutcome::Skipped(reason) => write!(f, "skipped ({})", reason),
            RuleOutcome::Failed(kind) => write!(f, "failed ({})", kind),
        }
    }
}

/// One entry on the observability channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchEvent {
    pub module_id: String,
    pub rule: RuleRef,
    pub outcome: RuleOutcome,
}
