//! Lazy placeholders and the resolver that completes them.
//!
//! A [`Placeholder`] is handed out before the module it refers to has
//! executed. It starts `Unresolved`, is completed at most once, and from then
//! on forwards every access to the value it found. Touching it earlier is an
//! error carrying the signature and the caller's location, never a silent
//! default.
//!
//! Resolution is event-driven: [`LazyResolver::on_record`] tests each pending
//! signature against the newly recorded exports only, so the cost per loaded
//! module is proportional to the number of pending placeholders.

use std::fmt;
use std::panic::Location;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;

use crate::access::Access;
use crate::error::{Error, FailReason};
use crate::registry::{Found, ModuleRegistry};
use crate::signature::ExportSignature;
use crate::value::Value;
use crate::Result;

/// Where a placeholder is in its life.
///
/// `Unresolved -> Resolving -> {Resolved | Failed}`; the last two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionState {
    Unresolved,
    Resolving,
    Resolved,
    Failed,
}

impl ResolutionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ResolutionState::Resolved | ResolutionState::Failed)
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ResolutionState::Unresolved,
            1 => ResolutionState::Resolving,
            2 => ResolutionState::Resolved,
            _ => ResolutionState::Failed,
        }
    }
}

type Factory = Box<dyn FnOnce() -> std::result::Result<Value, String> + Send>;

enum Target {
    Signature(ExportSignature),
    Factory {
        label: String,
        factory: Mutex<Option<Factory>>,
    },
}

struct Resolution {
    module_id: Option<String>,
    path: Option<String>,
    value: Value,
}

struct Cell {
    target: Target,
    phase: AtomicU8,
    outcome: OnceLock<std::result::Result<Resolution, FailReason>>,
    state_tx: watch::Sender<ResolutionState>,
}

impl Cell {
    fn new(target: Target) -> Self {
        let (state_tx, _) = watch::channel(ResolutionState::Unresolved);
        Self {
            target,
            phase: AtomicU8::new(ResolutionState::Unresolved as u8),
            outcome: OnceLock::new(),
            state_tx,
        }
    }

    /// Claim the single `Unresolved -> Resolving` transition.
    fn begin(&self) -> bool {
        self.phase
            .compare_exchange(
                ResolutionState::Unresolved as u8,
                ResolutionState::Resolving as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    fn finish(&self, outcome: std::result::Result<Resolution, FailReason>) {
        let terminal = if outcome.is_ok() {
            ResolutionState::Resolved
        } else {
            ResolutionState::Failed
        };
        let _ = self.outcome.set(outcome);
        self.phase.store(terminal as u8, Ordering::Release);
        self.state_tx.send_replace(terminal);
    }
}

/// A value that stands in for a module export until it is found.
///
/// Clones share the same resolution.
#[derive(Clone)]
pub struct Placeholder(Arc<Cell>);

impl Placeholder {
    /// A placeholder waiting for `signature`.
    pub(crate) fn pending(signature: ExportSignature) -> Self {
        Placeholder(Arc::new(Cell::new(Target::Signature(signature))))
    }

    /// A placeholder born resolved.
    pub(crate) fn born_resolved(signature: ExportSignature, found: Found) -> Self {
        let placeholder = Self::pending(signature);
        placeholder.resolve(found);
        placeholder
    }

    /// Defer an arbitrary computation until the first access.
    pub fn from_factory<F>(label: impl Into<String>, factory: F) -> Self
    where
        F: FnOnce() -> std::result::Result<Value, String> + Send + 'static,
    {
        Placeholder(Arc::new(Cell::new(Target::Factory {
            label: label.into(),
            factory: Mutex::new(Some(Box::new(factory))),
        })))
    }

    /// Complete with a registry match. False if already past `Unresolved`.
    pub(crate) fn resolve(&self, found: Found) -> bool {
        if !self.0.begin() {
            return false;
        }
        tracing::debug!(lazy = %self.description(), module = %found.module_id, path = ?found.path, "lazy resolved");
        self.0.finish(Ok(Resolution {
            module_id: Some(found.module_id),
            path: found.path,
            value: found.value,
        }));
        true
    }

    /// Give up. False if already past `Unresolved`.
    pub(crate) fn fail(&self, reason: FailReason) -> bool {
        if !self.0.begin() {
            return false;
        }
        tracing::warn!(lazy = %self.description(), reason = %reason, "lazy failed");
        self.0.finish(Err(reason));
        true
    }

    fn run_factory(&self) {
        let Target::Factory { factory, .. } = &self.0.target else {
            return;
        };
        if !self.0.begin() {
            return;
        }

        let factory = factory.lock().ok().and_then(|mut slot| slot.take());
        let outcome = match factory {
            Some(f) => f()
                .map(|value| Resolution {
                    module_id: None,
                    path: None,
                    value,
                })
                .map_err(FailReason::Factory),
            None => Err(FailReason::Factory("factory already consumed".to_string())),
        };
        if let Err(ref reason) = outcome {
            tracing::warn!(lazy = %self.description(), reason = %reason, "lazy failed");
        }
        self.0.finish(outcome);
    }

    pub fn state(&self) -> ResolutionState {
        ResolutionState::from_u8(self.0.phase.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == ResolutionState::Resolved
    }

    /// The signature this placeholder waits for, if it is not factory-backed.
    pub fn signature(&self) -> Option<&ExportSignature> {
        match &self.0.target {
            Target::Signature(sig) => Some(sig),
            Target::Factory { .. } => None,
        }
    }

    /// Human-readable target, used in diagnostics.
    pub fn description(&self) -> String {
        match &self.0.target {
            Target::Signature(sig) => sig.to_string(),
            Target::Factory { label, .. } => format!("factory({})", label),
        }
    }

    /// Module the value was found in.
    pub fn module_id(&self) -> Option<&str> {
        match self.0.outcome.get() {
            Some(Ok(resolution)) => resolution.module_id.as_deref(),
            _ => None,
        }
    }

    /// Export property the value was found under.
    pub fn export_path(&self) -> Option<&str> {
        match self.0.outcome.get() {
            Some(Ok(resolution)) => resolution.path.as_deref(),
            _ => None,
        }
    }

    /// The resolved value, without triggering a factory or raising.
    pub fn try_value(&self) -> Option<&Value> {
        match self.0.outcome.get() {
            Some(Ok(resolution)) => Some(&resolution.value),
            _ => None,
        }
    }

    /// The resolved value.
    ///
    /// Factory-backed placeholders run their factory here on first use.
    #[track_caller]
    pub fn value(&self) -> Result<&Value> {
        let location = Location::caller();
        self.run_factory();

        match self.0.outcome.get() {
            Some(Ok(resolution)) => Ok(&resolution.value),
            Some(Err(reason)) => Err(Error::ResolutionFailed {
                signature: self.description(),
                reason: reason.clone(),
            }),
            None => Err(Error::UnresolvedAccess {
                signature: self.description(),
                state: self.state(),
                location,
            }),
        }
    }

    /// Read a property of the resolved value.
    #[track_caller]
    pub fn property(&self, name: &str) -> Result<Value> {
        self.value()?.property(name)
    }

    /// Call the resolved value.
    #[track_caller]
    pub fn call(&self, args: &[Value]) -> Result<Value> {
        self.value()?.call(args)
    }

    /// Wait until the placeholder reaches a terminal state.
    pub async fn resolved(&self) -> ResolutionState {
        let mut rx = self.0.state_tx.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        result.unwrap_or_else(|_| self.state())
    }
}

impl Access for Placeholder {
    #[track_caller]
    fn property(&self, name: &str) -> Result<Value> {
        Placeholder::property(self, name)
    }

    #[track_caller]
    fn call(&self, args: &[Value]) -> Result<Value> {
        Placeholder::call(self, args)
    }

    fn state(&self) -> ResolutionState {
        Placeholder::state(self)
    }
}

impl PartialEq for Placeholder {
    fn eq(&self, other: &Self) -> bool {
        if Arc::ptr_eq(&self.0, &other.0) {
            return true;
        }
        match (self.try_value(), other.try_value()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl PartialEq<Value> for Placeholder {
    fn eq(&self, other: &Value) -> bool {
        self.try_value() == Some(other)
    }
}

impl PartialEq<Placeholder> for Value {
    fn eq(&self, other: &Placeholder) -> bool {
        other == self
    }
}

impl fmt::Display for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_value() {
            Some(value) => fmt::Display::fmt(value, f),
            None => write!(f, "<{:?} lazy {}>", self.state(), self.description()),
        }
    }
}

impl fmt::Debug for Placeholder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Placeholder")
            .field("target", &self.description())
            .field("state", &self.state())
            .field("module_id", &self.module_id())
            .finish()
    }
}

struct Pending {
    placeholder: Placeholder,
    signature: ExportSignature,
    since: Instant,
}

type Callback = Box<dyn FnOnce(&Found) + Send>;

struct Subscription {
    signature: ExportSignature,
    callback: Callback,
}

/// Pending placeholders and subscriptions, completed as modules are recorded.
#[derive(Default)]
pub struct LazyResolver {
    pending: Vec<Pending>,
    subscriptions: Vec<Subscription>,
    /// Signatures that gave up, for reporting.
    failed: Vec<(String, FailReason)>,
}

impl LazyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Placeholder for the first module whose exports satisfy `signature`.
    ///
    /// Resolved immediately if the registry already has a match. A signature
    /// equal to one still pending shares that placeholder.
    pub fn lazy(&mut self, registry: &ModuleRegistry, signature: ExportSignature) -> Placeholder {
        if let Some(existing) = self.pending.iter().find(|p| p.signature == signature) {
            return existing.placeholder.clone();
        }

        if let Some(found) = registry.find(&signature) {
            return Placeholder::born_resolved(signature, found);
        }

        tracing::debug!(lazy = %signature, "lazy pending");
        let placeholder = Placeholder::pending(signature.clone());
        self.pending.push(Pending {
            placeholder: placeholder.clone(),
            signature,
            since: Instant::now(),
        });
        placeholder
    }

    /// Run `callback` once with the first match for `signature`.
    ///
    /// Returns true if it ran immediately against an existing module.
    pub fn wait_for<F>(&mut self, registry: &ModuleRegistry, signature: ExportSignature, callback: F) -> bool
    where
        F: FnOnce(&Found) + Send + 'static,
    {
        if let Some(found) = registry.find(&signature) {
            callback(&found);
            return true;
        }
        self.subscriptions.push(Subscription {
            signature,
            callback: Box::new(callback),
        });
        false
    }

    /// Test everything pending against one newly recorded module.
    ///
    /// Returns how many placeholders resolved.
    pub fn on_record(&mut self, module_id: &str, exports: &Value) -> usize {
        let mut resolved = 0;
        self.pending.retain(|p| match Found::locate(&p.signature, module_id, exports) {
            Some(found) => {
                p.placeholder.resolve(found);
                resolved += 1;
                false
            }
            None => true,
        });

        for sub in std::mem::take(&mut self.subscriptions) {
            match Found::locate(&sub.signature, module_id, exports) {
                Some(found) => (sub.callback)(&found),
                None => self.subscriptions.push(sub),
            }
        }

        resolved
    }

    /// Fail every pending placeholder and drop every subscription.
    pub fn fail_pending(&mut self, reason: FailReason) -> usize {
        let pending = std::mem::take(&mut self.pending);
        let count = pending.len();
        self.fail_all(pending, reason);

        if !self.subscriptions.is_empty() {
            tracing::debug!(dropped = self.subscriptions.len(), "subscriptions dropped");
            self.subscriptions.clear();
        }
        count
    }

    /// Fail placeholders pending for at least `timeout` as of `now`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) -> usize {
        let (expired, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending)
            .into_iter()
            .partition(|p| now.saturating_duration_since(p.since) >= timeout);
        self.pending = waiting;

        let count = expired.len();
        self.fail_all(expired, FailReason::TimedOut(timeout));
        count
    }

    fn fail_all(&mut self, pending: Vec<Pending>, reason: FailReason) {
        for p in pending {
            if p.placeholder.fail(reason.clone()) {
                self.failed.push((p.signature.to_string(), reason.clone()));
            }
        }
    }

    pub fn pending(&self) -> impl Iterator<Item = &Placeholder> + '_ {
        self.pending.iter().map(|p| &p.placeholder)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn subscriptions_len(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn failed(&self) -> &[(String, FailReason)] {
        &self.failed
    }
}
