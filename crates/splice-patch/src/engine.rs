/// Patch engine that rewrites module source text at load time
///
/// The engine owns every registered rule set. For each module it:
/// - Picks the enabled sets whose text signature matches the original source
/// - Runs their rules in registration order against the cumulative text
/// - Records which rules applied, failed or were skipped
///
/// The engine never executes modules and never panics on a bad rule: the
/// returned text is always usable, falling back to the text as it was before
/// a failing set.

use std::panic::{self, AssertUnwindSafe};

use crate::error::{PatchError, Result};
use crate::event::{
    EventSink, FailureKind, PatchEvent, RuleFailure, RuleOutcome, RuleRef, RuleSetId, SkipReason,
    SkippedRule,
};
use crate::rule::{PatchContext, PatchRule, PatchRuleSet, Span};

/// Default expression substituted for `$self`.
pub const DEFAULT_SELF_TEMPLATE: &str = "Splice.plugins[{owner}]";

/// What to do with the rest of a required set once one of its rules fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Roll the set back to the text it started from and stop running it.
    #[default]
    AbortSet,
    /// Keep running the remaining rules and append a marker comment naming
    /// each failed rule.
    Continue,
}

/// Options for the patch engine
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub strictness: Strictness,
    /// Expression used for `$self`; `{owner}` is replaced by the set owner as
    /// a quoted string literal.
    pub self_template: String,
    /// Optional sink receiving every rule outcome.
    pub event_sink: Option<EventSink>,
}

impl EngineOptions {
    pub fn new() -> Self {
        Self {
            strictness: Strictness::default(),
            self_template: DEFAULT_SELF_TEMPLATE.to_string(),
            event_sink: None,
        }
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn self_template(mut self, template: impl Into<String>) -> Self {
        self.self_template = template.into();
        self
    }

    pub fn event_sink(mut self, sink: EventSink) -> Self {
        self.event_sink = Some(sink);
        self
    }
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything `apply` learned about one module.
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    /// Rewritten text (the original text when nothing applied).
    pub text: String,
    pub applied_rules: Vec<RuleRef>,
    /// Failures of required rules.
    pub failures: Vec<RuleFailure>,
    pub skipped: Vec<SkippedRule>,
    /// Sets whose signature matched this module.
    pub matched_sets: Vec<RuleSetId>,
}

impl PatchOutcome {
    pub fn is_modified(&self) -> bool {
        !self.applied_rules.is_empty()
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

struct Registered {
    id: RuleSetId,
    set: PatchRuleSet,
    enabled: bool,
}

/// Result of running one rule against the current text.
enum Application {
    Rewritten { text: String, replacements: usize },
    AlreadyApplied,
    NoEffect,
}

/// The patch engine
pub struct PatchEngine {
    options: EngineOptions,
    sets: Vec<Registered>,
}

impl PatchEngine {
    /// Create an engine with no rule sets
    pub fn new(options: EngineOptions) -> Self {
        Self {
            options,
            sets: Vec::new(),
        }
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Register a rule set; it becomes active immediately.
    pub fn register(&mut self, set: PatchRuleSet) -> Result<RuleSetId> {
        set.validate()?;
        let id = RuleSetId(self.sets.len());
        tracing::debug!(owner = %set.owner, set = %id, signature = %set.signature, rules = set.rules.len(), "registered rule set");
        self.sets.push(Registered {
            id,
            set,
            enabled: true,
        });
        Ok(id)
    }

    /// Register several sets, collecting every validation error.
    ///
    /// Valid sets are registered even when others fail.
    pub fn register_all(&mut self, sets: impl IntoIterator<Item = PatchRuleSet>) -> Result<Vec<RuleSetId>> {
        let mut ids = Vec::new();
        let mut errors = Vec::new();

        for set in sets {
            match self.register(set) {
                Ok(id) => ids.push(id),
                Err(e) => errors.push(e),
            }
        }

        match errors.len() {
            0 => Ok(ids),
            1 => Err(errors.remove(0)),
            _ => Err(PatchError::Multiple(errors)),
        }
    }

    /// Enable or disable one set for modules patched from now on.
    pub fn set_enabled(&mut self, id: RuleSetId, enabled: bool) -> Result<()> {
        let entry = self
            .sets
            .get_mut(id.0)
            .ok_or(PatchError::UnknownRuleSet(id.0))?;
        entry.enabled = enabled;
        tracing::debug!(owner = %entry.set.owner, set = %id, enabled, "rule set toggled");
        Ok(())
    }

    /// Toggle every set of one owner, returning how many sets were touched.
    pub fn set_owner_enabled(&mut self, owner: &str, enabled: bool) -> usize {
        let mut touched = 0;
        for entry in self.sets.iter_mut().filter(|e| e.set.owner == owner) {
            entry.enabled = enabled;
            touched += 1;
        }
        tracing::debug!(owner, enabled, sets = touched, "owner toggled");
        touched
    }

    pub fn is_enabled(&self, id: RuleSetId) -> bool {
        self.sets.get(id.0).is_some_and(|e| e.enabled)
    }

    pub fn rule_set(&self, id: RuleSetId) -> Option<&PatchRuleSet> {
        self.sets.get(id.0).map(|e| &e.set)
    }

    /// All registered set ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = RuleSetId> + '_ {
        self.sets.iter().map(|e| e.id)
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Expression substituted for `$self` in rules owned by `owner`.
    pub fn self_reference(&self, owner: &str) -> String {
        let quoted = serde_json::to_string(owner).unwrap_or_else(|_| format!("{:?}", owner));
        self.options.self_template.replace("{owner}", &quoted)
    }

    /// Run every active, matching rule set over `source`.
    pub fn apply(&self, module_id: &str, source: &str) -> PatchOutcome {
        let mut outcome = PatchOutcome {
            text: source.to_string(),
            ..Default::default()
        };

        for entry in self.sets.iter().filter(|e| e.enabled) {
            if !entry.set.signature.matches(source) {
                continue;
            }
            outcome.matched_sets.push(entry.id);
            self.apply_set(module_id, entry, &mut outcome);
        }

        if outcome.is_modified() {
            tracing::debug!(module = module_id, applied = outcome.applied_rules.len(), "module patched");
        }
        outcome
    }

    fn apply_set(&self, module_id: &str, entry: &Registered, outcome: &mut PatchOutcome) {
        let set = &entry.set;
        let self_ref = self.self_reference(&set.owner);
        let checkpoint = outcome.text.clone();
        let applied_before = outcome.applied_rules.len();
        let mut markers = Vec::new();

        for (index, rule) in set.rules.iter().enumerate() {
            let rule_ref = RuleRef {
                set: entry.id,
                owner: set.owner.clone(),
                index,
            };

            let ctx = PatchContext {
                module_id,
                text: &outcome.text,
            };
            if !rule.permits(&ctx) {
                self.emit(module_id, &rule_ref, RuleOutcome::Skipped(SkipReason::PredicateRejected));
                outcome.skipped.push(SkippedRule {
                    rule: rule_ref,
                    reason: SkipReason::PredicateRejected,
                });
                continue;
            }

            match apply_rule(rule, &outcome.text, &self_ref) {
                Ok(Application::Rewritten { text, replacements }) => {
                    outcome.text = text;
                    self.emit(module_id, &rule_ref, RuleOutcome::Applied { replacements });
                    outcome.applied_rules.push(rule_ref);
                }
                Ok(Application::AlreadyApplied) => {
                    self.emit(module_id, &rule_ref, RuleOutcome::AlreadyApplied);
                    outcome.skipped.push(SkippedRule {
                        rule: rule_ref,
                        reason: SkipReason::AlreadyApplied,
                    });
                }
                Ok(Application::NoEffect) => {
                    self.emit(module_id, &rule_ref, RuleOutcome::NoEffect);
                }
                Err(kind) if !set.required => {
                    let reason = SkipReason::NotRequired(kind);
                    self.emit(module_id, &rule_ref, RuleOutcome::Skipped(reason.clone()));
                    outcome.skipped.push(SkippedRule { rule: rule_ref, reason });
                }
                Err(kind) => {
                    self.emit(module_id, &rule_ref, RuleOutcome::Failed(kind.clone()));
                    outcome.failures.push(RuleFailure {
                        module_id: module_id.to_string(),
                        rule: rule_ref.clone(),
                        kind: kind.clone(),
                    });

                    match self.options.strictness {
                        Strictness::AbortSet => {
                            outcome.text = checkpoint;
                            for reverted in outcome.applied_rules.drain(applied_before..) {
                                self.emit(module_id, &reverted, RuleOutcome::Reverted);
                            }
                            return;
                        }
                        Strictness::Continue => markers.push(failure_marker(&rule_ref, &kind)),
                    }
                }
            }
        }

        for marker in markers {
            outcome.text.push_str(&marker);
        }
    }

    fn emit(&self, module_id: &str, rule: &RuleRef, outcome: RuleOutcome) {
        match &outcome {
            RuleOutcome::Failed(kind) => {
                tracing::warn!(module = module_id, rule = %rule, error = %kind, "required patch failed")
            }
            RuleOutcome::NoEffect => {
                tracing::warn!(module = module_id, rule = %rule, "patch had no effect")
            }
            RuleOutcome::Reverted => {
                tracing::warn!(module = module_id, rule = %rule, "patch reverted")
            }
            other => tracing::debug!(module = module_id, rule = %rule, outcome = %other, "patch rule"),
        }

        if let Some(ref sink) = self.options.event_sink {
            // A dropped receiver only means nobody is listening any more
            let _ = sink.send(PatchEvent {
                module_id: module_id.to_string(),
                rule: rule.clone(),
                outcome,
            });
        }
    }
}

/// Run one rule against `text`.
fn apply_rule(rule: &PatchRule, text: &str, self_ref: &str) -> std::result::Result<Application, FailureKind> {
    let spans = rule.anchor.locate(text);
    let anchor = rule.anchor.to_string();

    if spans.is_empty() {
        return Err(FailureKind::AnchorNotFound { anchor });
    }
    if !rule.occurrences.accepts(spans.len()) {
        return Err(FailureKind::AmbiguousMatch {
            anchor,
            expected: rule.occurrences,
            found: spans.len(),
        });
    }

    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    let mut replacements = 0;
    let mut in_place = 0;

    for span in &spans {
        let captured = span.captured(text, self_ref);
        let rendered = panic::catch_unwind(AssertUnwindSafe(|| rule.replacement.render(&captured)))
            .map_err(|payload| FailureKind::TransformPanicked {
                anchor: anchor.clone(),
                message: panic_message(payload.as_ref()),
            })?;

        out.push_str(&text[cursor..span.start]);
        if rendered != captured.matched && already_in_place(text, span, captured.matched, &rendered) {
            out.push_str(captured.matched);
            in_place += 1;
        } else {
            out.push_str(&rendered);
            if rendered != captured.matched {
                replacements += 1;
            }
        }
        cursor = span.end;
    }
    out.push_str(&text[cursor..]);

    if replacements > 0 {
        Ok(Application::Rewritten { text: out, replacements })
    } else if in_place > 0 {
        Ok(Application::AlreadyApplied)
    } else {
        Ok(Application::NoEffect)
    }
}

/// Whether the text surrounding `span` already reads as `rendered`, meaning an
/// earlier run put the replacement there.
fn already_in_place(text: &str, span: &Span, matched: &str, rendered: &str) -> bool {
    rendered.match_indices(matched).any(|(offset, _)| {
        span.start
            .checked_sub(offset)
            .and_then(|start| text.get(start..))
            .is_some_and(|window| window.starts_with(rendered))
    })
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn failure_marker(rule: &RuleRef, kind: &FailureKind) -> String {
    let detail = kind.to_string().replace("*/", "* /");
    format!("\n/* splice: patch {} failed: {} */", rule, detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rule::{Occurrences, Replacement};
    use std::sync::mpsc;

    fn marker_set() -> PatchRuleSet {
        PatchRuleSet::new("Demo", "FOO_MARKER")
            .required(true)
            .rule(PatchRule::literal("a,b", "a,b,c"))
    }

    #[test]
    fn test_applies_matching_set() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let id = engine.register(marker_set()).unwrap();

        let out = engine.apply("m1", "x=FOO_MARKER;f(a,b)");
        assert_eq!(out.text, "x=FOO_MARKER;f(a,b,c)");
        assert_eq!(out.applied_rules, vec![RuleRef { set: id, owner: "Demo".into(), index: 0 }]);
        assert!(out.failures.is_empty());
        assert_eq!(out.matched_sets, vec![id]);
    }

    #[test]
    fn test_non_candidate_is_untouched() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine.register(marker_set()).unwrap();

        let out = engine.apply("m1", "no marker here");
        assert_eq!(out.text, "no marker here");
        assert!(out.applied_rules.is_empty());
        assert!(out.matched_sets.is_empty());
    }

    #[test]
    fn test_reapplying_is_a_no_op() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine.register(marker_set()).unwrap();

        let once = engine.apply("m1", "x=FOO_MARKER;f(a,b)");
        let twice = engine.apply("m1", &once.text);
        assert_eq!(twice.text, once.text);
        assert!(twice.applied_rules.is_empty());
        assert!(twice.failures.is_empty());
    }

    #[test]
    fn test_self_reference_quotes_owner() {
        let engine = PatchEngine::new(EngineOptions::new());
        assert_eq!(engine.self_reference("Tracker"), r#"Splice.plugins["Tracker"]"#);
        assert_eq!(engine.self_reference(r#"a"b\c"#), r#"Splice.plugins["a\"b\\c"]"#);

        let custom = PatchEngine::new(EngineOptions::new().self_template("plugins.get({owner})"));
        assert_eq!(custom.self_reference("x"), r#"plugins.get("x")"#);
    }

    #[test]
    fn test_required_rule_already_in_place_is_reported() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let id = engine
            .register(
                PatchRuleSet::new("Staff", "MARK")
                    .required(true)
                    .rule(PatchRule::literal("isStaff()", "isStaff()||1")),
            )
            .unwrap();

        let out = engine.apply("m1", "MARK;if(isStaff()||1)x()");
        assert_eq!(out.text, "MARK;if(isStaff()||1)x()");
        assert!(out.applied_rules.is_empty());
        assert!(out.failures.is_empty());
        assert_eq!(
            out.skipped,
            vec![SkippedRule {
                rule: RuleRef { set: id, owner: "Staff".into(), index: 0 },
                reason: SkipReason::AlreadyApplied,
            }]
        );
    }

    #[test]
    fn test_wrapping_replacement_is_not_applied_twice() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine
            .register(PatchRuleSet::new("Demo", "render").rule(PatchRule::literal("render()", "wrap(render())")))
            .unwrap();

        let once = engine.apply("m1", "x.render()");
        assert_eq!(once.text, "x.wrap(render())");
        let twice = engine.apply("m1", &once.text);
        assert_eq!(twice.text, once.text);
    }

    #[test]
    fn test_required_failure_rolls_back_set() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let set = PatchRuleSet::new("Demo", "MARK")
            .required(true)
            .rule(PatchRule::literal("one", "1"))
            .rule(PatchRule::literal("missing", "2"));
        engine.register(set).unwrap();

        let out = engine.apply("m1", "MARK one");
        assert_eq!(out.text, "MARK one");
        assert!(out.applied_rules.is_empty());
        assert_eq!(out.failures.len(), 1);
        assert_eq!(out.failures[0].rule.index, 1);
        assert!(matches!(out.failures[0].kind, FailureKind::AnchorNotFound { .. }));
    }

    #[test]
    fn test_continue_strictness_marks_failure() {
        let mut engine = PatchEngine::new(EngineOptions::new().strictness(Strictness::Continue));
        let set = PatchRuleSet::new("Demo", "MARK")
            .required(true)
            .rule(PatchRule::literal("missing", "2"))
            .rule(PatchRule::literal("one", "1"));
        engine.register(set).unwrap();

        let out = engine.apply("m1", "MARK one");
        assert!(out.text.starts_with("MARK 1\n/* splice: patch Demo#0 rule 0 failed"));
        assert_eq!(out.applied_rules.len(), 1);
        assert_eq!(out.failures.len(), 1);
    }

    #[test]
    fn test_optional_failure_is_skipped() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine
            .register(PatchRuleSet::new("Demo", "MARK").rule(PatchRule::literal("missing", "x")))
            .unwrap();

        let out = engine.apply("m1", "MARK");
        assert_eq!(out.text, "MARK");
        assert!(out.failures.is_empty());
        assert_eq!(out.skipped.len(), 1);
    }

    #[test]
    fn test_ambiguous_match_is_failure() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine
            .register(PatchRuleSet::new("Demo", "MARK").required(true).rule(PatchRule::literal("x", "y")))
            .unwrap();

        let out = engine.apply("m1", "MARK x x");
        assert_eq!(out.text, "MARK x x");
        assert!(matches!(
            out.failures[0].kind,
            FailureKind::AmbiguousMatch { found: 2, .. }
        ));
    }

    #[test]
    fn test_at_least_one_replaces_every_occurrence() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine
            .register(
                PatchRuleSet::new("Demo", "MARK")
                    .rule(PatchRule::literal("x", "y").occurrences(Occurrences::AtLeastOne)),
            )
            .unwrap();

        assert_eq!(engine.apply("m1", "MARK x x").text, "MARK y y");
    }

    #[test]
    fn test_sets_apply_in_registration_order() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        engine
            .register(PatchRuleSet::new("First", "MARK").rule(PatchRule::literal("a", "b")))
            .unwrap();
        engine
            .register(PatchRuleSet::new("Second", "MARK").rule(PatchRule::literal("b", "c")))
            .unwrap();

        assert_eq!(engine.apply("m1", "MARK:a").text, "MARK:c");
    }

    #[test]
    fn test_disabled_set_is_ignored() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let id = engine.register(marker_set()).unwrap();
        engine.set_enabled(id, false).unwrap();

        assert_eq!(engine.apply("m1", "x=FOO_MARKER;f(a,b)").text, "x=FOO_MARKER;f(a,b)");
        assert_eq!(engine.set_owner_enabled("Demo", true), 1);
        assert!(engine.is_enabled(id));
    }

    #[test]
    fn test_regex_rule_with_self_reference() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let rule = PatchRule::pattern(r"copyValue:(\i)\.join\(\)", "$&+$self.info($1)").unwrap();
        engine
            .register(PatchRuleSet::new("Settings", ".versionHash").rule(rule))
            .unwrap();

        let out = engine.apply("m7", "e.versionHash;copyValue:t.join()");
        assert_eq!(
            out.text,
            r#"e.versionHash;copyValue:t.join()+Splice.plugins["Settings"].info(t)"#
        );
    }

    #[test]
    fn test_function_replacement_and_predicate() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let upper = PatchRule::pattern(r"name:(\i)", Replacement::function(|c| c.matched.to_uppercase())).unwrap();
        let never = PatchRule::literal("MARK", "gone").when(|ctx| ctx.module_id == "other");
        engine
            .register(PatchRuleSet::new("Demo", "MARK").rule(upper).rule(never))
            .unwrap();

        let out = engine.apply("m1", "MARK name:x");
        assert_eq!(out.text, "MARK NAME:X");
        assert_eq!(out.skipped[0].reason, SkipReason::PredicateRejected);
    }

    #[test]
    fn test_panicking_replacement_is_contained() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let rule = PatchRule::literal("boom", Replacement::function(|_| panic!("bad replacement")));
        engine
            .register(PatchRuleSet::new("Demo", "boom").required(true).rule(rule))
            .unwrap();

        let out = engine.apply("m1", "boom");
        assert_eq!(out.text, "boom");
        match &out.failures[0].kind {
            FailureKind::TransformPanicked { message, .. } => assert_eq!(message, "bad replacement"),
            other => panic!("unexpected failure: {:?}", other),
        }
    }

    #[test]
    fn test_events_reach_sink() {
        let (tx, rx) = mpsc::channel();
        let mut engine = PatchEngine::new(EngineOptions::new().event_sink(tx));
        engine.register(marker_set()).unwrap();

        engine.apply("m1", "x=FOO_MARKER;f(a,b)");
        let event = rx.try_recv().unwrap();
        assert_eq!(event.module_id, "m1");
        assert_eq!(event.outcome, RuleOutcome::Applied { replacements: 1 });
    }

    #[test]
    fn test_register_all_collects_errors() {
        let mut engine = PatchEngine::new(EngineOptions::new());
        let result = engine.register_all(vec![
            PatchRuleSet::new("Empty", "MARK"),
            marker_set(),
            PatchRuleSet::new("NoSig", "").rule(PatchRule::literal("a", "b")),
        ]);
        assert!(matches!(result, Err(PatchError::Multiple(ref errs)) if errs.len() == 2));
        assert_eq!(engine.len(), 1);
    }
}
