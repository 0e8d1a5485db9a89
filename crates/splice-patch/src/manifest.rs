//! Declarative patch manifests.
//!
//! Plugins that do not want to build rule sets in Rust can describe them as
//! JSON:
//!
//! ```json
//! {
//!   "plugins": [{
//!     "name": "Settings",
//!     "required": true,
//!     "patches": [{
//!       "find": ".versionHash",
//!       "replacement": { "match": { "regex": "copyValue:\\i\\.join\\(\" \"\\)" }, "replace": "$& + $self.getInfoString()" }
//!     }]
//!   }]
//! }
//! ```
//!
//! `find` and `replacement` take either a single entry or a list.

use serde::{Deserialize, Serialize};

use crate::engine::PatchEngine;
use crate::error::{PatchError, Result};
use crate::event::RuleSetId;
use crate::rule::{Anchor, Occurrences, PatchRule, PatchRuleSet};
use crate::signature::{Find, TextSignature};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatchManifest {
    #[serde(default)]
    pub plugins: Vec<PluginPatches>,
}

/// Every patch contributed by one plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginPatches {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Default for patches that do not say otherwise.
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub patches: Vec<PatchDecl>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchDecl {
    pub find: OneOrMany<TextPattern>,
    pub replacement: OneOrMany<ReplacementDecl>,
    #[serde(default)]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacementDecl {
    #[serde(rename = "match")]
    pub anchor: TextPattern,
    pub replace: String,
    /// Exact number of expected occurrences (default 1).
    #[serde(default)]
    pub expected: Option<usize>,
    /// Replace every occurrence, requiring at least one.
    #[serde(default)]
    pub all: bool,
}

/// A literal string or `{ "regex": "..." }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TextPattern {
    Literal(String),
    Regex { regex: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> OneOrMany<T> {
    pub fn as_slice(&self) -> &[T] {
        match self {
            OneOrMany::One(item) => std::slice::from_ref(item),
            OneOrMany::Many(items) => items,
        }
    }
}

impl PatchManifest {
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }

    /// Compile the manifest and register every set, disabling the sets of
    /// disabled plugins.
    pub fn register(&self, engine: &mut PatchEngine) -> Result<Vec<RuleSetId>> {
        let mut ids = Vec::new();
        let mut errors = Vec::new();

        for plugin in &self.plugins {
            for decl in &plugin.patches {
                let registered = decl
                    .compile(&plugin.name, plugin.required)
                    .and_then(|set| engine.register(set))
                    .and_then(|id| engine.set_enabled(id, plugin.enabled).map(|_| id));
                match registered {
                    Ok(id) => ids.push(id),
                    Err(e) => errors.push(e),
                }
            }
        }

        match errors.len() {
            0 => Ok(ids),
            1 => Err(errors.remove(0)),
            _ => Err(PatchError::Multiple(errors)),
        }
    }
}

impl PatchDecl {
    /// Build the rule set this declaration describes.
    pub fn compile(&self, owner: &str, plugin_required: bool) -> Result<PatchRuleSet> {
        let finds = self
            .find
            .as_slice()
            .iter()
            .map(|find| match find {
                TextPattern::Literal(text) => Ok(Find::literal(text.as_str())),
                TextPattern::Regex { regex } => Find::pattern(regex),
            })
            .collect::<Result<Vec<_>>>()?;

        let mut set = PatchRuleSet::new(owner, TextSignature::new(finds))
            .required(self.required.unwrap_or(plugin_required));

        for decl in self.replacement.as_slice() {
            let anchor = match &decl.anchor {
                TextPattern::Literal(text) => Anchor::literal(text.as_str()),
                TextPattern::Regex { regex } => Anchor::pattern(regex)?,
            };
            let occurrences = if decl.all {
                Occurrences::AtLeastOne
            } else {
                Occurrences::Exactly(decl.expected.unwrap_or(1))
            };
            set = set.rule(PatchRule::new(anchor, decl.replace.as_str()).occurrences(occurrences));
        }

        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineOptions;

    const MANIFEST: &str = r#"{
        "plugins": [
            {
                "name": "Settings",
                "required": true,
                "patches": [
                    {
                        "find": ".versionHash",
                        "replacement": [
                            { "match": { "regex": "copyValue:(\\i)\\.join\\(\\)" }, "replace": "$&+$self.info($1)" },
                            { "match": "x", "replace": "y", "all": true }
                        ]
                    }
                ]
            },
            {
                "name": "Off",
                "enabled": false,
                "patches": [
                    { "find": ["a", "b"], "replacement": { "match": "a", "replace": "c" } }
                ]
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_register() {
        let manifest = PatchManifest::from_json(MANIFEST).unwrap();
        let mut engine = PatchEngine::new(EngineOptions::new());
        let ids = manifest.register(&mut engine).unwrap();

        assert_eq!(ids.len(), 2);
        assert!(engine.is_enabled(ids[0]));
        assert!(!engine.is_enabled(ids[1]));

        let set = engine.rule_set(ids[0]).unwrap();
        assert!(set.required);
        assert_eq!(set.rules.len(), 2);
        assert_eq!(set.rules[1].occurrences, Occurrences::AtLeastOne);
    }

    #[test]
    fn test_registered_manifest_patches_module() {
        let manifest = PatchManifest::from_json(MANIFEST).unwrap();
        let mut engine = PatchEngine::new(EngineOptions::new());
        manifest.register(&mut engine).unwrap();

        let out = engine.apply("1", "e.versionHash;copyValue:t.join();x;x");
        assert_eq!(
            out.text,
            r#"e.versionHash;copyValue:t.join()+Splice.plugins["Settings"].info(t);y;y"#
        );
    }

    #[test]
    fn test_bad_regex_is_reported() {
        let manifest = PatchManifest::from_json(
            r#"{"plugins":[{"name":"Bad","patches":[{"find":{"regex":"("},"replacement":{"match":"a","replace":"b"}}]}]}"#,
        )
        .unwrap();
        let mut engine = PatchEngine::new(EngineOptions::new());
        assert!(matches!(
            manifest.register(&mut engine),
            Err(PatchError::InvalidPattern { .. })
        ));
    }

    #[test]
    fn test_lookbehind_anchor_from_manifest() {
        let manifest = PatchManifest::from_json(
            r#"{"plugins":[{"name":"ShowName","required":true,"patches":[{
                "find": "?\"@\":\"\"",
                "replacement": {
                    "match": { "regex": "(?<=onContextMenu:\\i,children:).*?\\)}" },
                    "replace": "$self.renderUsername(arguments[0])}"
                }
            }]}]}"#,
        )
        .unwrap();
        let mut engine = PatchEngine::new(EngineOptions::new());
        manifest.register(&mut engine).unwrap();

        let out = engine.apply("9", r#"n?"@":"";x({onContextMenu:e,children:r(t)})"#);
        assert_eq!(
            out.text,
            r#"n?"@":"";x({onContextMenu:e,children:Splice.plugins["ShowName"].renderUsername(arguments[0])})"#
        );
        assert!(out.failures.is_empty());
    }
}
