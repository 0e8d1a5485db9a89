/// Module registry: executed modules and their exports
///
/// This module handles:
/// - Recording exports once per module id, in load order
/// - Direct lookup by module id
/// - First-match search by export signature
///
/// The registry is append-only. Re-recording an id is ignored so that values
/// already handed out to lazy placeholders can never change underneath them.

use std::collections::HashMap;

use crate::signature::ExportSignature;
use crate::value::Value;

/// A signature match inside the registry
#[derive(Debug, Clone, PartialEq)]
pub struct Found {
    /// Module whose exports matched
    pub module_id: String,
    /// Export property that matched, `None` when the exports value itself did
    pub path: Option<String>,
    /// The matching value
    pub value: Value,
}

impl Found {
    pub(crate) fn locate(signature: &ExportSignature, module_id: &str, exports: &Value) -> Option<Found> {
        signature.locate(exports).map(|(path, value)| Found {
            module_id: module_id.to_string(),
            path: path.map(str::to_string),
            value: value.clone(),
        })
    }
}

/// Registry of executed modules
#[derive(Debug, Default)]
pub struct ModuleRegistry {
    /// Exports in the order modules finished executing
    entries: Vec<(String, Value)>,
    /// Position of each module id in `entries`
    index: HashMap<String, usize>,
}

impl ModuleRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a module's exports.
    ///
    /// Returns false, leaving the existing value in place, if the id was
    /// already recorded.
    pub fn record(&mut self, module_id: impl Into<String>, exports: Value) -> bool {
        let module_id = module_id.into();
        if self.index.contains_key(&module_id) {
            tracing::debug!(module = %module_id, "duplicate record ignored");
            return false;
        }

        self.index.insert(module_id.clone(), self.entries.len());
        self.entries.push((module_id, exports));
        true
    }

    /// Get exports for a module
    pub fn get(&self, module_id: &str) -> Option<&Value> {
        self.index.get(module_id).map(|&i| &self.entries[i].1)
    }

    pub fn contains(&self, module_id: &str) -> bool {
        self.index.contains_key(module_id)
    }

    /// First module, in load order, whose exports satisfy `signature`
    pub fn find(&self, signature: &ExportSignature) -> Option<Found> {
        self.entries
            .iter()
            .find_map(|(id, exports)| Found::locate(signature, id, exports))
    }

    /// Every match, in load order
    pub fn find_all(&self, signature: &ExportSignature) -> Vec<Found> {
        self.entries
            .iter()
            .filter_map(|(id, exports)| Found::locate(signature, id, exports))
            .collect()
    }

    /// Recorded modules in load order, as of this call
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> + '_ {
        self.entries.iter().map(|(id, exports)| (id.as_str(), exports))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn thing(n: f64) -> Value {
        Value::object([("thing", Value::from(n))])
    }

    #[test]
    fn test_first_match_wins_in_load_order() {
        let mut registry = ModuleRegistry::new();
        registry.record("z-a", Value::object([("other", Value::from(1.0))]));
        registry.record("b", thing(2.0));
        registry.record("a", thing(3.0));

        let found = registry.find(&ExportSignature::props(["thing"])).unwrap();
        assert_eq!(found.module_id, "b");
        assert_eq!(found.value, thing(2.0));
        assert_eq!(found.path, None);
    }

    #[test]
    fn test_record_is_append_only() {
        let mut registry = ModuleRegistry::new();
        assert!(registry.record("m", thing(1.0)));
        assert!(!registry.record("m", thing(2.0)));
        assert_eq!(registry.get("m"), Some(&thing(1.0)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_iter_is_in_load_order() {
        let mut registry = ModuleRegistry::new();
        registry.record("2", Value::Null);
        registry.record("1", Value::Null);
        let ids: Vec<&str> = registry.iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec!["2", "1"]);
    }

    #[test]
    fn test_find_all_and_nested_paths() {
        let mut registry = ModuleRegistry::new();
        registry.record("1", Value::object([("Store", thing(1.0))]));
        registry.record("2", thing(2.0));

        let all = registry.find_all(&ExportSignature::props(["thing"]));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path.as_deref(), Some("Store"));
        assert!(registry.find(&ExportSignature::Callable).is_none());
    }
}
