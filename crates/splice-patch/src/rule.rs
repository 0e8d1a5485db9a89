//! Patch rules and rule sets.
//!
//! A [`PatchRule`] is one declarative rewrite: an anchor to look for, how many
//! times it must occur, and what to put in its place. Rules are grouped into a
//! [`PatchRuleSet`] that owns the [`TextSignature`] used to pick candidate
//! modules.

use std::fmt;
use std::sync::Arc;

use crate::canonical::{self, Pattern};
use crate::error::{PatchError, Result};
use crate::signature::TextSignature;

/// Replacement callback: receives the match and returns the new text.
pub type ReplaceFn = Arc<dyn Fn(&Captured<'_>) -> String + Send + Sync>;

/// Guard evaluated before a rule runs.
pub type PredicateFn = Arc<dyn Fn(&PatchContext<'_>) -> bool + Send + Sync>;

/// What a rule looks for in the current module text.
#[derive(Debug, Clone)]
pub enum Anchor {
    Literal(String),
    Pattern(Pattern),
}

impl Anchor {
    pub fn literal(text: impl Into<String>) -> Self {
        Anchor::Literal(text.into())
    }

    /// Compile a regex anchor, expanding `\i` wildcards.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Anchor::Pattern(canonical::compile(pattern)?))
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Anchor::Literal(text) => text.is_empty(),
            Anchor::Pattern(re) => re.as_str().is_empty(),
        }
    }

    /// Locate every non-overlapping occurrence in `text`, left to right.
    pub(crate) fn locate(&self, text: &str) -> Vec<Span> {
        match self {
            Anchor::Literal(needle) => text
                .match_indices(needle.as_str())
                .map(|(start, m)| Span {
                    start,
                    end: start + m.len(),
                    groups: Vec::new(),
                })
                .collect(),
            Anchor::Pattern(re) => re.spans(text),
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::Literal(text) => write!(f, "{:?}", text),
            Anchor::Pattern(re) => write!(f, "{}", re),
        }
    }
}

/// Byte offsets of one anchor occurrence and its capture groups.
#[derive(Debug, Clone)]
pub(crate) struct Span {
    pub start: usize,
    pub end: usize,
    pub groups: Vec<Option<(usize, usize)>>,
}

impl Span {
    pub(crate) fn captured<'a>(&self, text: &'a str, self_ref: &'a str) -> Captured<'a> {
        Captured {
            matched: &text[self.start..self.end],
            groups: self
                .groups
                .iter()
                .map(|g| g.map(|(s, e)| &text[s..e]))
                .collect(),
            self_ref,
        }
    }
}

/// The matched text handed to a replacement.
#[derive(Debug, Clone)]
pub struct Captured<'a> {
    /// The whole match (`$&`).
    pub matched: &'a str,
    /// Capture groups in order (`$1`, `$2`, ...). Unmatched groups are `None`.
    pub groups: Vec<Option<&'a str>>,
    /// Expression referring to the owning plugin (`$self`).
    pub self_ref: &'a str,
}

impl Captured<'_> {
    /// Capture group by 1-based index, empty when absent.
    pub fn group(&self, index: usize) -> &str {
        index
            .checked_sub(1)
            .and_then(|i| self.groups.get(i).copied().flatten())
            .unwrap_or("")
    }
}

/// Module context visible to a rule predicate.
#[derive(Debug, Clone, Copy)]
pub struct PatchContext<'a> {
    pub module_id: &'a str,
    /// Current text, including edits made by earlier rules.
    pub text: &'a str,
}

/// How a rule produces its replacement text.
#[derive(Clone)]
pub enum Replacement {
    /// Template supporting `$&`, `$1`..`$99`, `$self` and `$$`.
    Template(String),
    Function(ReplaceFn),
}

impl Replacement {
    pub fn template(text: impl Into<String>) -> Self {
        Replacement::Template(text.into())
    }

    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Captured<'_>) -> String + Send + Sync + 'static,
    {
        Replacement::Function(Arc::new(f))
    }

    pub(crate) fn render(&self, captured: &Captured<'_>) -> String {
        match self {
            Replacement::Template(template) => expand_template(template, captured),
            Replacement::Function(f) => f(captured),
        }
    }
}

impl fmt::Debug for Replacement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Replacement::Template(t) => f.debug_tuple("Template").field(t).finish(),
            Replacement::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl From<&str> for Replacement {
    fn from(text: &str) -> Self {
        Replacement::template(text)
    }
}

impl From<String> for Replacement {
    fn from(text: String) -> Self {
        Replacement::Template(text)
    }
}

/// Expand a replacement template against a match.
pub fn expand_template(template: &str, captured: &Captured<'_>) -> String {
    let bytes = template.as_bytes();
    let mut out = String::with_capacity(template.len());
    let mut i = 0;
    let mut literal_start = 0;

    while i < bytes.len() {
        if bytes[i] != b'$' || i + 1 >= bytes.len() {
            i += 1;
            continue;
        }
        out.push_str(&template[literal_start..i]);
        let rest = &template[i + 1..];

        let consumed = if rest.starts_with('$') {
            out.push('$');
            1
        } else if rest.starts_with('&') {
            out.push_str(captured.matched);
            1
        } else if rest.starts_with("self") {
            out.push_str(captured.self_ref);
            4
        } else if let Some(digits) = group_reference(rest, captured.groups.len()) {
            let index: usize = rest[..digits].parse().unwrap_or(0);
            out.push_str(captured.group(index));
            digits
        } else {
            out.push('$');
            0
        };

        i += 1 + consumed;
        literal_start = i;
    }

    out.push_str(&template[literal_start..]);
    out
}

/// Length of the group number at the start of `rest`, preferring two digits
/// when that group exists.
fn group_reference(rest: &str, group_count: usize) -> Option<usize> {
    let digits = rest.bytes().take(2).take_while(u8::is_ascii_digit).count();
    if digits == 2 && rest[..2].parse::<usize>().is_ok_and(|n| n >= 1 && n <= group_count) {
        return Some(2);
    }
    if digits >= 1 && rest[..1].parse::<usize>().is_ok_and(|n| n >= 1) {
        return Some(1);
    }
    None
}

/// Number of anchor occurrences a rule expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Occurrences {
    /// Exactly this many; every one is replaced.
    Exactly(usize),
    /// One or more; every one is replaced.
    AtLeastOne,
}

impl Occurrences {
    pub fn accepts(&self, found: usize) -> bool {
        match self {
            Occurrences::Exactly(n) => found == *n,
            Occurrences::AtLeastOne => found >= 1,
        }
    }
}

impl Default for Occurrences {
    fn default() -> Self {
        Occurrences::Exactly(1)
    }
}

impl fmt::Display for Occurrences {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Occurrences::Exactly(n) => write!(f, "{}", n),
            Occurrences::AtLeastOne => f.write_str("at least 1"),
        }
    }
}

/// A single declarative rewrite.
#[derive(Clone)]
pub struct PatchRule {
    pub anchor: Anchor,
    pub replacement: Replacement,
    pub occurrences: Occurrences,
    pub predicate: Option<PredicateFn>,
}

impl PatchRule {
    pub fn new(anchor: Anchor, replacement: impl Into<Replacement>) -> Self {
        Self {
            anchor,
            replacement: replacement.into(),
            occurrences: Occurrences::default(),
            predicate: None,
        }
    }

    /// Literal anchor with a template replacement.
    pub fn literal(anchor: impl Into<String>, replacement: impl Into<Replacement>) -> Self {
        Self::new(Anchor::literal(anchor), replacement)
    }

    /// Regex anchor (with `\i` wildcards).
    pub fn pattern(anchor: &str, replacement: impl Into<Replacement>) -> Result<Self> {
        Ok(Self::new(Anchor::pattern(anchor)?, replacement))
    }

    pub fn occurrences(mut self, occurrences: Occurrences) -> Self {
        self.occurrences = occurrences;
        self
    }

    pub fn when<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&PatchContext<'_>) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub(crate) fn permits(&self, ctx: &PatchContext<'_>) -> bool {
        self.predicate.as_ref().map_or(true, |p| p(ctx))
    }
}

impl fmt::Debug for PatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchRule")
            .field("anchor", &self.anchor)
            .field("replacement", &self.replacement)
            .field("occurrences", &self.occurrences)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// Rules contributed by one plugin for the modules matching one signature.
#[derive(Debug, Clone)]
pub struct PatchRuleSet {
    pub owner: String,
    pub signature: TextSignature,
    pub rules: Vec<PatchRule>,
    pub required: bool,
}

impl PatchRuleSet {
    pub fn new(owner: impl Into<String>, signature: impl Into<TextSignature>) -> Self {
        Self {
            owner: owner.into(),
            signature: signature.into(),
            rules: Vec::new(),
            required: false,
        }
    }

    pub fn rule(mut self, rule: PatchRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Reject sets that could never apply meaningfully.
    pub fn validate(&self) -> Result<()> {
        if self.signature.is_empty() {
            return Err(PatchError::EmptySignature {
                owner: self.owner.clone(),
            });
        }
        if self.rules.is_empty() {
            return Err(PatchError::NoRules {
                owner: self.owner.clone(),
            });
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.anchor.is_empty() {
                return Err(PatchError::EmptyAnchor {
                    owner: self.owner.clone(),
                    rule: index,
                });
            }
            if rule.occurrences == Occurrences::Exactly(0) {
                return Err(PatchError::ZeroOccurrences {
                    owner: self.owner.clone(),
                    rule: index,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn captured<'a>(matched: &'a str, groups: Vec<Option<&'a str>>) -> Captured<'a> {
        Captured {
            matched,
            groups,
            self_ref: "Splice.plugins[\"Demo\"]",
        }
    }

    #[test]
    fn test_template_tokens() {
        let c = captured("f(a,b)", vec![Some("a"), Some("b")]);
        assert_eq!(expand_template("$&;$2$1", &c), "f(a,b);ba");
        assert_eq!(expand_template("$self.x($1)", &c), "Splice.plugins[\"Demo\"].x(a)");
        assert_eq!(expand_template("cost: $$5", &c), "cost: $5");
    }

    #[test]
    fn test_template_unknown_tokens_are_literal() {
        let c = captured("m", vec![]);
        assert_eq!(expand_template("$x $ end$", &c), "$x $ end$");
        assert_eq!(expand_template("$0", &c), "$0");
    }

    #[test]
    fn test_template_missing_group_is_empty() {
        let c = captured("m", vec![None]);
        assert_eq!(expand_template("[$1][$3]", &c), "[][]");
    }

    #[test]
    fn test_two_digit_group_only_when_present() {
        let groups: Vec<Option<&str>> = (0..12).map(|_| Some("g")).collect();
        let mut c = captured("m", groups);
        c.groups[11] = Some("twelve");
        assert_eq!(expand_template("$12", &c), "twelve");

        let c = captured("m", vec![Some("one")]);
        assert_eq!(expand_template("$12", &c), "one2");
    }

    #[test]
    fn test_literal_anchor_locates_all() {
        let spans = Anchor::literal("ab").locate("ab-ab-a");
        assert_eq!(spans.len(), 2);
        assert_eq!((spans[1].start, spans[1].end), (3, 5));
    }

    #[test]
    fn test_validate_rejects_empty_sets() {
        let set = PatchRuleSet::new("Demo", "marker");
        assert!(matches!(set.validate(), Err(PatchError::NoRules { .. })));

        let set = PatchRuleSet::new("Demo", "").rule(PatchRule::literal("a", "b"));
        assert!(matches!(set.validate(), Err(PatchError::EmptySignature { .. })));

        let set = PatchRuleSet::new("Demo", "marker")
            .rule(PatchRule::literal("a", "b").occurrences(Occurrences::Exactly(0)));
        assert!(matches!(set.validate(), Err(PatchError::ZeroOccurrences { .. })));
    }
}
