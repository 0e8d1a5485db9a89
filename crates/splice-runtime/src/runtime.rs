//! The process-scoped runtime object.
//!
//! A [`Runtime`] bundles the patch engine, the interception hook, the module
//! registry and the lazy resolver behind one explicit lifecycle:
//! [`Runtime::init`], then defines and requires driven by the host, then
//! [`Runtime::loading_finished`] and finally [`Runtime::teardown`]. Tests
//! create as many independent instances as they like.

use std::fmt;
use std::time::{Duration, Instant};

use splice_patch::{
    EngineOptions, PatchEngine, PatchManifest, PatchOutcome, PatchRuleSet, RuleFailure, RuleSetId,
    SkippedRule, Strictness,
};

use crate::error::FailReason;
use crate::hook::{Interceptor, ModuleHost};
use crate::lazy::{LazyResolver, Placeholder};
use crate::registry::{Found, ModuleRegistry};
use crate::signature::ExportSignature;
use crate::value::Value;
use crate::{Error, Result};

/// Options for creating a runtime.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// Options for the patch engine.
    pub engine: EngineOptions,
    /// How long a lazy may stay pending before `expire_pending` fails it.
    pub resolve_timeout: Option<Duration>,
}

impl RuntimeOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn engine(mut self, engine: EngineOptions) -> Self {
        self.engine = engine;
        self
    }

    /// Shorthand for setting the engine's strictness.
    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.engine.strictness = strictness;
        self
    }

    pub fn resolve_timeout(mut self, timeout: Duration) -> Self {
        self.resolve_timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Loading,
    Finished,
}

pub struct Runtime {
    hook: Interceptor,
    registry: ModuleRegistry,
    resolver: LazyResolver,
    resolve_timeout: Option<Duration>,
    phase: Phase,
}

impl Runtime {
    pub fn init(options: RuntimeOptions) -> Self {
        tracing::debug!(strictness = ?options.engine.strictness, timeout = ?options.resolve_timeout, "runtime init");
        Self {
            hook: Interceptor::new(PatchEngine::new(options.engine)),
            registry: ModuleRegistry::new(),
            resolver: LazyResolver::new(),
            resolve_timeout: options.resolve_timeout,
            phase: Phase::Loading,
        }
    }

    /// Register a rule set; it applies to modules defined from now on.
    pub fn register(&mut self, set: PatchRuleSet) -> splice_patch::Result<RuleSetId> {
        self.hook.engine_mut().register(set)
    }

    pub fn register_manifest(&mut self, manifest: &PatchManifest) -> splice_patch::Result<Vec<RuleSetId>> {
        manifest.register(self.hook.engine_mut())
    }

    pub fn engine(&self) -> &PatchEngine {
        self.hook.engine()
    }

    /// Toggle rule sets; only modules defined afterwards are affected.
    pub fn engine_mut(&mut self) -> &mut PatchEngine {
        self.hook.engine_mut()
    }

    /// Intercept a module definition. `None` for a duplicate id.
    pub fn define(&mut self, module_id: &str, source: &str) -> Option<PatchOutcome> {
        self.hook.define(module_id, source)
    }

    /// Execute a defined module (once) and return its exports.
    pub fn require<H>(&mut self, module_id: &str, host: &mut H) -> Result<Value>
    where
        H: ModuleHost + ?Sized,
    {
        self.hook
            .require(module_id, host, &mut self.registry, &mut self.resolver)
    }

    /// Require every defined module not yet executed, in definition order.
    ///
    /// Host failures are logged and collected; loading carries on.
    pub fn load_all<H>(&mut self, host: &mut H) -> Vec<Error>
    where
        H: ModuleHost + ?Sized,
    {
        self.hook
            .waiting()
            .into_iter()
            .filter_map(|id| self.require(&id, host).err())
            .collect()
    }

    /// A placeholder for the first module whose exports satisfy `signature`.
    ///
    /// Never blocks. Once loading has finished a signature with no match is
    /// born failed.
    pub fn lazy(&mut self, signature: ExportSignature) -> Placeholder {
        let placeholder = self.resolver.lazy(&self.registry, signature);
        if self.phase == Phase::Finished {
            self.resolver.fail_pending(FailReason::LoadingFinished);
        }
        placeholder
    }

    /// Run `callback` once with the first module matching `signature`.
    ///
    /// Returns true if a match already existed and the callback has run.
    pub fn wait_for<F>(&mut self, signature: ExportSignature, callback: F) -> bool
    where
        F: FnOnce(&Found) + Send + 'static,
    {
        if self.phase != Phase::Loading {
            return match self.registry.find(&signature) {
                Some(found) => {
                    callback(&found);
                    true
                }
                None => false,
            };
        }
        self.resolver.wait_for(&self.registry, signature, callback)
    }

    /// Search the modules recorded so far.
    pub fn find(&self, signature: &ExportSignature) -> Option<Found> {
        self.registry.find(signature)
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    /// The host's signal that no more modules will load.
    ///
    /// Fails every pending lazy with `LoadingFinished`. Idempotent.
    pub fn loading_finished(&mut self) -> usize {
        if self.phase == Phase::Loading {
            self.phase = Phase::Finished;
        }
        let failed = self.resolver.fail_pending(FailReason::LoadingFinished);
        tracing::info!(
            modules = self.registry.len(),
            failed_lazies = failed,
            "loading finished"
        );
        failed
    }

    /// Fail lazies pending longer than the configured timeout.
    pub fn expire_pending(&mut self, now: Instant) -> usize {
        match self.resolve_timeout {
            Some(timeout) => self.resolver.expire(now, timeout),
            None => 0,
        }
    }

    pub fn report(&self) -> LoadReport {
        let engine = self.hook.engine();
        LoadReport {
            defined: self.hook.defined_len(),
            executed: self.hook.executed_len(),
            failures: self.hook.failures().to_vec(),
            skipped: self.hook.skipped().to_vec(),
            host_failures: self.hook.host_failures(),
            unmatched_sets: self
                .hook
                .unmatched_sets()
                .into_iter()
                .filter_map(|id| engine.rule_set(id).map(|set| (id, set.owner.clone())))
                .collect(),
            pending: self
                .resolver
                .pending()
                .map(Placeholder::description)
                .collect(),
            failed_lazies: self.resolver.failed().to_vec(),
        }
    }

    /// Fail everything still pending and hand back the final report.
    ///
    /// Placeholders held elsewhere stay valid and report `Teardown`.
    pub fn teardown(mut self) -> LoadReport {
        self.resolver.fail_pending(FailReason::Teardown);
        tracing::debug!("runtime torn down");
        self.report()
    }
}

/// Summary of a load, for diagnostics.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub defined: usize,
    pub executed: usize,
    /// Rule failures of required sets.
    pub failures: Vec<RuleFailure>,
    /// Rules passed over without failing, by module.
    pub skipped: Vec<(String, SkippedRule)>,
    /// Modules the host could not execute.
    pub host_failures: Vec<(String, String)>,
    /// Enabled rule sets that never matched a module, with their owners.
    pub unmatched_sets: Vec<(RuleSetId, String)>,
    /// Lazies still waiting.
    pub pending: Vec<String>,
    /// Lazies that gave up.
    pub failed_lazies: Vec<(String, FailReason)>,
}

impl LoadReport {
    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }
}

impl fmt::Display for LoadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "modules: {} defined, {} executed", self.defined, self.executed)?;
        for failure in &self.failures {
            writeln!(f, "failed: {}", failure)?;
        }
        for (module_id, skip) in &self.skipped {
            writeln!(f, "skipped: patch {} on module {}: {}", skip.rule, module_id, skip.reason)?;
        }
        for (module_id, message) in &self.host_failures {
            writeln!(f, "module {} failed: {}", module_id, message)?;
        }
        for (id, owner) in &self.unmatched_sets {
            writeln!(f, "unmatched: {}{}", owner, id)?;
        }
        for signature in &self.pending {
            writeln!(f, "pending: {}", signature)?;
        }
        for (signature, reason) in &self.failed_lazies {
            writeln!(f, "lazy {}: {}", signature, reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lazy::ResolutionState;
    use splice_patch::PatchRule;

    fn host(_: &str, source: &str) -> std::result::Result<Value, String> {
        Ok(Value::object([("source", Value::from(source))]))
    }

    #[test]
    fn test_define_require_round() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        runtime
            .register(PatchRuleSet::new("p", "FOO_MARKER").rule(PatchRule::literal("a,b", "a,b,c")))
            .unwrap();

        runtime.define("1", "FOO_MARKER a,b");
        let exports = runtime.require("1", &mut host).unwrap();
        assert_eq!(exports.get("source"), Some(&Value::from("FOO_MARKER a,b,c")));
    }

    #[test]
    fn test_load_all_collects_host_errors() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        runtime.define("ok", "1");
        runtime.define("bad", "2");
        let mut host = |id: &str, _: &str| -> std::result::Result<Value, String> {
            if id == "bad" {
                Err("boom".to_string())
            } else {
                Ok(Value::Null)
            }
        };

        let errors = runtime.load_all(&mut host);
        assert_eq!(errors.len(), 1);
        assert!(runtime.load_all(&mut host).is_empty());
        assert_eq!(runtime.report().host_failures.len(), 1);
    }

    #[test]
    fn test_lazy_after_loading_finished_is_failed() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        runtime.loading_finished();
        let p = runtime.lazy(ExportSignature::props(["late"]));
        assert_eq!(p.state(), ResolutionState::Failed);
    }

    #[test]
    fn test_expire_pending_uses_timeout() {
        let mut runtime = Runtime::init(RuntimeOptions::new().resolve_timeout(Duration::from_secs(5)));
        let p = runtime.lazy(ExportSignature::props(["x"]));
        assert_eq!(runtime.expire_pending(Instant::now() + Duration::from_secs(10)), 1);
        assert!(matches!(
            p.value(),
            Err(Error::ResolutionFailed { reason: FailReason::TimedOut(_), .. })
        ));

        let mut untimed = Runtime::init(RuntimeOptions::new());
        untimed.lazy(ExportSignature::props(["x"]));
        assert_eq!(untimed.expire_pending(Instant::now() + Duration::from_secs(3600)), 0);
    }

    #[test]
    fn test_teardown_fails_pending() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        let p = runtime.lazy(ExportSignature::Callable);
        let report = runtime.teardown();

        assert_eq!(report.failed_lazies, vec![("callable".to_string(), FailReason::Teardown)]);
        assert!(report.pending.is_empty());
        assert!(matches!(
            p.value(),
            Err(Error::ResolutionFailed { reason: FailReason::Teardown, .. })
        ));
    }

    #[test]
    fn test_report_display() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        runtime
            .register(PatchRuleSet::new("ghost", "NEVER").rule(PatchRule::literal("x", "y")))
            .unwrap();
        runtime.define("1", "something");
        runtime.lazy(ExportSignature::store("UserStore"));

        let text = runtime.report().to_string();
        assert!(text.contains("modules: 1 defined, 0 executed"));
        assert!(text.contains("unmatched: ghost#0"));
        assert!(text.contains("pending: store(UserStore)"));
    }

    #[test]
    fn test_already_applied_rule_is_in_report() {
        let mut runtime = Runtime::init(RuntimeOptions::new());
        runtime
            .register(
                PatchRuleSet::new("Staff", "MARK")
                    .required(true)
                    .rule(PatchRule::literal("isStaff()", "isStaff()||1")),
            )
            .unwrap();
        runtime.define("3", "MARK;if(isStaff()||1)x()");

        let report = runtime.report();
        assert!(!report.has_failures());
        assert_eq!(report.skipped.len(), 1);
        assert!(report
            .to_string()
            .contains("skipped: patch Staff#0 rule 0 on module 3: already applied"));
    }
}
