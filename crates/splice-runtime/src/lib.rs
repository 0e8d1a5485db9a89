//! Module interception, export registry and lazy resolution.
//!
//! The [`Runtime`] sits between a host module loader and plugin code. It
//! patches each module's source as the host defines it, records each module's
//! exports once the host has executed it, and resolves [`Placeholder`]s that
//! plugins asked for before their target existed.

mod access;
mod bundle;
mod error;
mod hook;
mod lazy;
mod registry;
mod runtime;
mod signature;
mod value;

pub use access::Access;
pub use bundle::{Bundle, BundleHost, BundleModule};
pub use error::{Error, FailReason};
pub use hook::{Interceptor, ModuleHost, Requirer};
pub use lazy::{LazyResolver, Placeholder, ResolutionState};
pub use registry::{Found, ModuleRegistry};
pub use runtime::{LoadReport, Runtime, RuntimeOptions};
pub use signature::{ExportPredicate, ExportSignature, Signature};
pub use value::{Function, NativeFn, Value, FUNCTION_KEY};

/// Result type for runtime operations.
pub type Result<T> = std::result::Result<T, Error>;
