//! Text signatures: cheap checks that decide whether a module is a candidate
//! for a rule set before any rule runs.

use std::fmt;

use crate::canonical::{self, Pattern};
use crate::error::Result;

/// One required piece of a [`TextSignature`].
#[derive(Debug, Clone)]
pub enum Find {
    /// A plain substring.
    Literal(String),
    /// A canonicalized regex.
    Pattern(Pattern),
}

impl Find {
    pub fn literal(text: impl Into<String>) -> Self {
        Find::Literal(text.into())
    }

    /// Compile a regex find, expanding `\i` wildcards.
    pub fn pattern(pattern: &str) -> Result<Self> {
        Ok(Find::Pattern(canonical::compile(pattern)?))
    }

    pub fn is_match(&self, source: &str) -> bool {
        match self {
            Find::Literal(text) => source.contains(text.as_str()),
            Find::Pattern(re) => re.is_match(source),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        match self {
            Find::Literal(text) => text.is_empty(),
            Find::Pattern(re) => re.as_str().is_empty(),
        }
    }
}

impl PartialEq for Find {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Find::Literal(a), Find::Literal(b)) => a == b,
            (Find::Pattern(a), Find::Pattern(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl fmt::Display for Find {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Find::Literal(text) => write!(f, "{:?}", text),
            Find::Pattern(re) => write!(f, "{}", re),
        }
    }
}

/// All of the contained finds must be present for a module to be a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct TextSignature {
    finds: Vec<Find>,
}

impl TextSignature {
    pub fn new(finds: Vec<Find>) -> Self {
        Self { finds }
    }

    /// Signature made of plain substrings.
    pub fn literals<I, S>(texts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(texts.into_iter().map(Find::literal).collect())
    }

    pub fn finds(&self) -> &[Find] {
        &self.finds
    }

    pub fn is_empty(&self) -> bool {
        self.finds.is_empty() || self.finds.iter().all(Find::is_empty)
    }

    pub fn matches(&self, source: &str) -> bool {
        !self.is_empty() && self.finds.iter().all(|find| find.is_match(source))
    }
}

impl fmt::Display for TextSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.finds.iter().map(|find| find.to_string()).collect();
        write!(f, "[{}]", parts.join(", "))
    }
}

impl From<&str> for TextSignature {
    fn from(text: &str) -> Self {
        Self::literals([text])
    }
}
