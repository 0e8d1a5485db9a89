//! Module bundles: a recorded module graph replayed through a runtime.
//!
//! ```json
//! { "modules": [ { "id": "42", "source": "...", "exports": { "render": { "$fn": "..." } } } ] }
//! ```
//!
//! Bundles stand in for the host when no JavaScript engine is present: each
//! module's exports are given up front and [`BundleHost`] hands them back when
//! the runtime executes that module, keeping the patched source it was given.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::Error;
use crate::hook::{ModuleHost, Requirer};
use crate::runtime::Runtime;
use crate::value::Value;
use crate::Result;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Bundle {
    pub modules: Vec<BundleModule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleModule {
    pub id: String,
    pub source: String,
    #[serde(default)]
    pub exports: JsonValue,
}

impl Bundle {
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Bundle(e.to_string()))
    }

    /// Define every module, in bundle order. Returns how many were new.
    pub fn define_all(&self, runtime: &mut Runtime) -> usize {
        self.modules
            .iter()
            .filter(|module| runtime.define(&module.id, &module.source).is_some())
            .count()
    }

    pub fn host(&self) -> BundleHost {
        let mut exports = HashMap::new();
        for module in &self.modules {
            exports
                .entry(module.id.clone())
                .or_insert_with(|| module.exports.clone());
        }
        BundleHost {
            exports,
            executed: Vec::new(),
        }
    }
}

/// A [`ModuleHost`] serving exports from a bundle.
#[derive(Debug, Default)]
pub struct BundleHost {
    exports: HashMap<String, JsonValue>,
    /// Patched sources in execution order.
    executed: Vec<(String, String)>,
}

impl BundleHost {
    /// `(module id, patched source)` for every module executed so far.
    pub fn executed(&self) -> &[(String, String)] {
        &self.executed
    }
}

impl ModuleHost for BundleHost {
    fn execute(
        &mut self,
        module_id: &str,
        source: &str,
        _deps: &mut Requirer<'_>,
    ) -> std::result::Result<Value, String> {
        let exports = self
            .exports
            .get(module_id)
            .ok_or_else(|| format!("no exports recorded for module {}", module_id))?;
        self.executed.push((module_id.to_string(), source.to_string()));
        Ok(Value::from_json_value(exports.clone()))
    }
}
