//! Source-text patching for intercepted modules.
//!
//! Plugins describe rewrites declaratively as [`PatchRuleSet`]s: a
//! [`TextSignature`] picking candidate modules plus an ordered list of
//! [`PatchRule`]s. The [`PatchEngine`] applies every matching set to a module's
//! raw source before the host executes it, reporting per-rule outcomes instead
//! of failing the load.

pub mod canonical;
pub mod engine;
pub mod error;
pub mod event;
pub mod manifest;
pub mod rule;
pub mod signature;

pub use engine::{EngineOptions, PatchEngine, PatchOutcome, Strictness, DEFAULT_SELF_TEMPLATE};
pub use error::{PatchError, Result};
pub use event::{
    EventSink, FailureKind, PatchEvent, RuleFailure, RuleOutcome, RuleRef, RuleSetId, SkipReason,
    SkippedRule,
};
pub use manifest::PatchManifest;
pub use rule::{Anchor, Captured, Occurrences, PatchContext, PatchRule, PatchRuleSet, Replacement};
pub use signature::{Find, TextSignature};
