//! Error types for the runtime.

use std::fmt;
use std::panic::Location;
use std::time::Duration;

use thiserror::Error;

use crate::lazy::ResolutionState;

/// Why a lazy placeholder gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailReason {
    /// The host finished loading and nothing matched.
    LoadingFinished,
    /// Still pending after the configured timeout.
    TimedOut(Duration),
    /// The runtime was torn down first.
    Teardown,
    /// A factory-backed placeholder's factory returned an error.
    Factory(String),
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailReason::LoadingFinished => f.write_str("loading finished without a match"),
            FailReason::TimedOut(after) => write!(f, "timed out after {:?}", after),
            FailReason::Teardown => f.write_str("runtime torn down"),
            FailReason::Factory(message) => write!(f, "factory failed: {}", message),
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("Unresolved access to lazy {signature} ({state:?}) at {location}")]
    UnresolvedAccess {
        signature: String,
        state: ResolutionState,
        location: &'static Location<'static>,
    },

    #[error("Lazy {signature} failed: {reason}")]
    ResolutionFailed { signature: String, reason: FailReason },

    #[error("Value is not callable: {0}")]
    NotCallable(String),

    #[error("Call to {name} failed: {message}")]
    CallFailed { name: String, message: String },

    #[error("Module not defined: {0}")]
    ModuleNotDefined(String),

    #[error("Circular require of module {0}")]
    CircularRequire(String),

    #[error("Module {module_id} failed to execute: {message}")]
    Host { module_id: String, message: String },

    #[error("Bundle error: {0}")]
    Bundle(String),
}

impl Error {
    pub fn host(module_id: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Host {
            module_id: module_id.into(),
            message: message.into(),
        }
    }
}
