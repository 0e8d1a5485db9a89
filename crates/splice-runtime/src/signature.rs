//! Signatures over resolved exports.
//!
//! An [`ExportSignature`] recognizes a module by the shape of what it
//! exported rather than by its id, which the host reassigns on every build.
//! The predicate space is closed apart from [`ExportSignature::Custom`], so
//! signatures can be compared, deduplicated and printed in diagnostics.

use std::fmt;
use std::sync::Arc;

use splice_patch::TextSignature;

use crate::value::Value;

/// Custom export predicate.
pub type ExportPredicate = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

#[derive(Clone)]
pub enum ExportSignature {
    /// An object carrying all of these properties.
    Props(Vec<String>),
    /// Any function.
    Callable,
    /// A function whose source contains all of these snippets.
    Code(Vec<String>),
    /// A store object, recognized by its `displayName` (directly or on its
    /// `constructor`).
    Store(String),
    Custom { label: String, predicate: ExportPredicate },
}

impl ExportSignature {
    pub fn props<I, S>(props: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExportSignature::Props(props.into_iter().map(Into::into).collect())
    }

    pub fn code<I, S>(snippets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ExportSignature::Code(snippets.into_iter().map(Into::into).collect())
    }

    pub fn store(name: impl Into<String>) -> Self {
        ExportSignature::Store(name.into())
    }

    pub fn custom<F>(label: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        ExportSignature::Custom {
            label: label.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Test one value, without looking inside it.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ExportSignature::Props(props) => !props.is_empty() && value.has_props(props.as_slice()),
            ExportSignature::Callable => value.is_callable(),
            ExportSignature::Code(snippets) => value
                .as_function()
                .is_some_and(|f| snippets.iter().all(|s| f.source.contains(s.as_str()))),
            ExportSignature::Store(name) => {
                let display_name = |v: &Value| v.get("displayName").and_then(Value::as_str) == Some(name.as_str());
                display_name(value) || value.get("constructor").is_some_and(display_name)
            }
            ExportSignature::Custom { predicate, .. } => predicate(value),
        }
    }

    /// Find the matching value inside a module's exports.
    ///
    /// Checks the exports themselves, then `default`, then every other
    /// property in export order. Returns the property path (if any) and the value.
    pub fn locate<'a>(&self, exports: &'a Value) -> Option<(Option<&'a str>, &'a Value)> {
        if self.matches(exports) {
            return Some((None, exports));
        }

        let Value::Object(map) = exports else {
            return None;
        };

        if let Some((key, value)) = map.get_key_value("default") {
            if self.matches(value) {
                return Some((Some(key.as_str()), value));
            }
        }

        map.iter()
            .filter(|(key, _)| key.as_str() != "default")
            .find(|(_, value)| self.matches(value))
            .map(|(key, value)| (Some(key.as_str()), value))
    }
}

impl PartialEq for ExportSignature {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (ExportSignature::Props(a), ExportSignature::Props(b)) => a == b,
            (ExportSignature::Callable, ExportSignature::Callable) => true,
            (ExportSignature::Code(a), ExportSignature::Code(b)) => a == b,
            (ExportSignature::Store(a), ExportSignature::Store(b)) => a == b,
            (
                ExportSignature::Custom { label: la, predicate: pa },
                ExportSignature::Custom { label: lb, predicate: pb },
            ) => la == lb && Arc::ptr_eq(pa, pb),
            _ => false,
        }
    }
}

impl fmt::Display for ExportSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportSignature::Props(props) => write!(f, "props({})", props.join(", ")),
            ExportSignature::Callable => f.write_str("callable"),
            ExportSignature::Code(snippets) => write!(f, "code({:?})", snippets),
            ExportSignature::Store(name) => write!(f, "store({})", name),
            ExportSignature::Custom { label, .. } => write!(f, "custom({})", label),
        }
    }
}

impl fmt::Debug for ExportSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExportSignature::{}", self)
    }
}

/// Either way of recognizing a module.
#[derive(Debug, Clone, PartialEq)]
pub enum Signature {
    /// Matched against module source text.
    Text(TextSignature),
    /// Matched against resolved exports.
    Export(ExportSignature),
}

impl From<TextSignature> for Signature {
    fn from(sig: TextSignature) -> Self {
        Signature::Text(sig)
    }
}

impl From<ExportSignature> for Signature {
    fn from(sig: ExportSignature) -> Self {
        Signature::Export(sig)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Signature::Text(sig) => write!(f, "text{}", sig),
            Signature::Export(sig) => fmt::Display::fmt(sig, f),
        }
    }
}
