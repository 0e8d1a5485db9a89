//! The interception point between the host's module loader and the engine.
//!
//! Every module passes through here twice: once when the host defines it
//! (source is patched and the patched factory kept), and once when it is
//! first required (the factory is executed, the exports recorded, and pending
//! lazies re-tested against them).
//!
//! A module may require its dependencies while it runs through the
//! [`Requirer`] handed to [`ModuleHost::execute`]; nested requires go through
//! the same patch, record and resolve path.

use std::collections::{BTreeSet, HashMap};

use splice_patch::{PatchEngine, PatchOutcome, RuleFailure, RuleSetId, SkippedRule};

use crate::error::Error;
use crate::lazy::LazyResolver;
use crate::registry::ModuleRegistry;
use crate::value::Value;
use crate::Result;

/// The host's module system: runs a (patched) module body, returns its exports.
pub trait ModuleHost {
    /// Run one module. Dependencies are required through `deps`, passing the
    /// host itself back in.
    fn execute(
        &mut self,
        module_id: &str,
        source: &str,
        deps: &mut Requirer<'_>,
    ) -> std::result::Result<Value, String>;
}

/// Closures serve modules without dependencies.
impl<F> ModuleHost for F
where
    F: FnMut(&str, &str) -> std::result::Result<Value, String>,
{
    fn execute(
        &mut self,
        module_id: &str,
        source: &str,
        _deps: &mut Requirer<'_>,
    ) -> std::result::Result<Value, String> {
        self(module_id, source)
    }
}

/// Handle for requiring other modules from inside [`ModuleHost::execute`].
pub struct Requirer<'a> {
    hook: &'a mut Interceptor,
    registry: &'a mut ModuleRegistry,
    resolver: &'a mut LazyResolver,
}

impl Requirer<'_> {
    /// Require a dependency of the module currently executing.
    ///
    /// A module that is still executing further up the chain is a
    /// [`Error::CircularRequire`].
    pub fn require<H>(&mut self, module_id: &str, host: &mut H) -> Result<Value>
    where
        H: ModuleHost + ?Sized,
    {
        self.hook.require(module_id, host, &mut *self.registry, &mut *self.resolver)
    }
}

#[derive(Debug)]
enum ModuleState {
    /// Patched factory waiting for its first require.
    Defined(String),
    /// Running; its own dependencies are being required.
    Executing,
    Executed,
    Failed(String),
}

/// Per-module bookkeeping for the interception layer.
pub struct Interceptor {
    engine: PatchEngine,
    modules: HashMap<String, ModuleState>,
    /// Module ids in definition order.
    order: Vec<String>,
    failures: Vec<RuleFailure>,
    skipped: Vec<(String, SkippedRule)>,
    matched_sets: BTreeSet<RuleSetId>,
}

impl Interceptor {
    pub fn new(engine: PatchEngine) -> Self {
        Self {
            engine,
            modules: HashMap::new(),
            order: Vec::new(),
            failures: Vec::new(),
            skipped: Vec::new(),
            matched_sets: BTreeSet::new(),
        }
    }

    pub fn engine(&self) -> &PatchEngine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut PatchEngine {
        &mut self.engine
    }

    /// Patch and store a module factory.
    ///
    /// Returns `None` when the id was already defined; the first definition
    /// stands and is never re-patched.
    pub fn define(&mut self, module_id: &str, source: &str) -> Option<PatchOutcome> {
        if self.modules.contains_key(module_id) {
            tracing::debug!(module = %module_id, "duplicate define ignored");
            return None;
        }

        let outcome = self.engine.apply(module_id, source);
        self.failures.extend(outcome.failures.iter().cloned());
        self.skipped
            .extend(outcome.skipped.iter().map(|skip| (module_id.to_string(), skip.clone())));
        self.matched_sets.extend(outcome.matched_sets.iter().copied());

        self.modules
            .insert(module_id.to_string(), ModuleState::Defined(outcome.text.clone()));
        self.order.push(module_id.to_string());
        Some(outcome)
    }

    /// Execute a defined module once and feed its exports to the registry.
    ///
    /// Later requires return the recorded exports, or the original host error.
    pub fn require<H>(
        &mut self,
        module_id: &str,
        host: &mut H,
        registry: &mut ModuleRegistry,
        resolver: &mut LazyResolver,
    ) -> Result<Value>
    where
        H: ModuleHost + ?Sized,
    {
        let Some(state) = self.modules.get_mut(module_id) else {
            return Err(Error::ModuleNotDefined(module_id.to_string()));
        };

        let source = match state {
            ModuleState::Executed => {
                return registry
                    .get(module_id)
                    .cloned()
                    .ok_or_else(|| Error::ModuleNotDefined(module_id.to_string()));
            }
            ModuleState::Executing => return Err(Error::CircularRequire(module_id.to_string())),
            ModuleState::Failed(message) => return Err(Error::host(module_id, message.clone())),
            ModuleState::Defined(source) => std::mem::take(source),
        };
        *state = ModuleState::Executing;

        let result = {
            let mut deps = Requirer {
                hook: &mut *self,
                registry: &mut *registry,
                resolver: &mut *resolver,
            };
            host.execute(module_id, &source, &mut deps)
        };

        match result {
            Ok(exports) => {
                self.modules.insert(module_id.to_string(), ModuleState::Executed);
                registry.record(module_id, exports.clone());
                let resolved = resolver.on_record(module_id, &exports);
                tracing::debug!(module = %module_id, resolved, "module executed");
                Ok(exports)
            }
            Err(message) => {
                tracing::warn!(module = %module_id, error = %message, "module execution failed");
                self.modules
                    .insert(module_id.to_string(), ModuleState::Failed(message.clone()));
                Err(Error::host(module_id, message))
            }
        }
    }

    /// Defined modules not yet executed, in definition order.
    pub fn waiting(&self) -> Vec<String> {
        self.order
            .iter()
            .filter(|id| matches!(self.modules.get(id.as_str()), Some(ModuleState::Defined(_))))
            .cloned()
            .collect()
    }

    pub fn defined_len(&self) -> usize {
        self.order.len()
    }

    pub fn executed_len(&self) -> usize {
        self.modules
            .values()
            .filter(|state| matches!(state, ModuleState::Executed))
            .count()
    }

    /// Modules whose host execution failed, in definition order.
    pub fn host_failures(&self) -> Vec<(String, String)> {
        self.order
            .iter()
            .filter_map(|id| match self.modules.get(id.as_str()) {
                Some(ModuleState::Failed(message)) => Some((id.clone(), message.clone())),
                _ => None,
            })
            .collect()
    }

    /// Rule failures across every module defined so far.
    pub fn failures(&self) -> &[RuleFailure] {
        &self.failures
    }

    /// Rules passed over without failing, with the module they were skipped on.
    pub fn skipped(&self) -> &[(String, SkippedRule)] {
        &self.skipped
    }

    /// Enabled rule sets whose signature has not matched any module.
    pub fn unmatched_sets(&self) -> Vec<RuleSetId> {
        self.engine
            .ids()
            .filter(|id| self.engine.is_enabled(*id) && !self.matched_sets.contains(id))
            .collect()
    }
}
