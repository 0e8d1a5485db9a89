//! Pattern canonicalization.
//!
//! Minified host code renames every identifier, so patterns written by plugin
//! authors use `\i` as a stand-in for "any identifier". Before compilation the
//! token is expanded into a real regex fragment.
//!
//! Patterns compile with `regex` when they can. Look-around and backreferences,
//! which plugin patterns use to pin a match between minified names, fall back
//! to `fancy-regex`. A leading variable-length look-behind `(?<=X)Y` that the
//! backtracking engine rejects is matched as `X` followed by an empty marker
//! group, and the match is reported from the marker on.

use std::fmt;

use crate::error::{PatchError, Result};
use crate::rule::Span;

/// Regex fragment matching one JavaScript-style identifier.
pub const IDENTIFIER: &str = r"(?:[A-Za-z_$][\w$]*)";

/// Name of the marker group standing in for a leading look-behind.
const KEEP_GROUP: &str = "splice_keep";

/// Expand every `\i` token in `pattern` into [`IDENTIFIER`].
///
/// Escaped backslashes (`\\i`) are left untouched.
pub fn canonicalize(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('i') => out.push_str(IDENTIFIER),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }

    out
}

/// A compiled, canonicalized pattern.
#[derive(Debug, Clone)]
pub enum Pattern {
    /// Linear-time engine.
    Plain(regex::Regex),
    /// Backtracking engine, for look-around and backreferences.
    Fancy {
        re: fancy_regex::Regex,
        /// Index of the marker group replacing a leading look-behind.
        keep: Option<usize>,
    },
}

impl Pattern {
    /// The compiled pattern text.
    pub fn as_str(&self) -> &str {
        match self {
            Pattern::Plain(re) => re.as_str(),
            Pattern::Fancy { re, .. } => re.as_str(),
        }
    }

    pub fn is_fancy(&self) -> bool {
        matches!(self, Pattern::Fancy { .. })
    }

    /// Whether the pattern occurs in `text`.
    ///
    /// A backtracking pattern that exceeds its step limit counts as no match.
    pub fn is_match(&self, text: &str) -> bool {
        match self {
            Pattern::Plain(re) => re.is_match(text),
            Pattern::Fancy { re, .. } => re.is_match(text).unwrap_or_else(|e| {
                tracing::warn!(pattern = %re.as_str(), error = %e, "pattern match aborted");
                false
            }),
        }
    }

    /// Every non-overlapping match, left to right, with its capture groups.
    pub(crate) fn spans(&self, text: &str) -> Vec<Span> {
        match self {
            Pattern::Plain(re) => re
                .captures_iter(text)
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    Some(Span {
                        start: whole.start(),
                        end: whole.end(),
                        groups: caps.iter().skip(1).map(|g| g.map(|g| (g.start(), g.end()))).collect(),
                    })
                })
                .collect(),
            Pattern::Fancy { re, keep } => re
                .captures_iter(text)
                .map_while(|caps| match caps {
                    Ok(caps) => Some(caps),
                    Err(e) => {
                        tracing::warn!(pattern = %re.as_str(), error = %e, "pattern match aborted");
                        None
                    }
                })
                .filter_map(|caps| {
                    let whole = caps.get(0)?;
                    let start = keep
                        .and_then(|k| caps.get(k))
                        .map_or(whole.start(), |m| m.start());
                    let groups = caps
                        .iter()
                        .enumerate()
                        .skip(1)
                        .filter(|(i, _)| Some(*i) != *keep)
                        .map(|(_, g)| g.map(|g| (g.start(), g.end())))
                        .collect();
                    Some(Span {
                        start,
                        end: whole.end(),
                        groups,
                    })
                })
                .collect(),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/", self.as_str())
    }
}

/// Canonicalize and compile a pattern.
pub fn compile(pattern: &str) -> Result<Pattern> {
    let canonical = canonicalize(pattern);
    if let Ok(re) = regex::Regex::new(&canonical) {
        return Ok(Pattern::Plain(re));
    }

    match fancy_regex::Regex::new(&canonical) {
        Ok(re) => Ok(Pattern::Fancy { re, keep: None }),
        Err(e) => {
            compile_leading_lookbehind(&canonical).ok_or_else(|| PatchError::invalid_pattern(pattern, e))
        }
    }
}

/// Compile `(?<=X)Y` as `(?:X)(?P<keep>)Y`.
fn compile_leading_lookbehind(canonical: &str) -> Option<Pattern> {
    let (behind, rest) = split_leading_lookbehind(canonical)?;
    let keep = count_groups(behind) + 1;
    let rewritten = format!("(?:{})(?P<{}>){}", behind, KEEP_GROUP, shift_backrefs(rest, keep));
    let re = fancy_regex::Regex::new(&rewritten).ok()?;
    tracing::debug!(pattern = %canonical, "leading look-behind matched through marker group");
    Some(Pattern::Fancy { re, keep: Some(keep) })
}

/// Split `(?<=X)Y` into `X` and `Y`.
fn split_leading_lookbehind(pattern: &str) -> Option<(&str, &str)> {
    let body = pattern.strip_prefix("(?<=")?;
    let mut depth = 0usize;
    let mut in_class = false;
    let mut escaped = false;

    for (i, c) in body.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => {
                if depth == 0 {
                    return Some((&body[..i], &body[i + 1..]));
                }
                depth -= 1;
            }
            _ => {}
        }
    }
    None
}

/// Number of capturing groups opened in `pattern`.
fn count_groups(pattern: &str) -> usize {
    let bytes = pattern.as_bytes();
    let mut count = 0;
    let mut in_class = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 2;
                continue;
            }
            b'[' if !in_class => in_class = true,
            b']' if in_class => in_class = false,
            b'(' if !in_class => {
                let rest = &pattern[i + 1..];
                let named = rest.starts_with("?P<")
                    || (rest.starts_with("?<") && !rest.starts_with("?<=") && !rest.starts_with("?<!"));
                if !rest.starts_with('?') || named {
                    count += 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    count
}

/// Renumber single-digit backreferences `\n` with `n >= from` to `\n+1`.
fn shift_backrefs(pattern: &str, from: usize) -> String {
    let mut out = String::with_capacity(pattern.len() + 2);
    let mut chars = pattern.chars();

    while let Some(c) = chars.next() {
        out.push(c);
        if c != '\\' {
            continue;
        }
        match chars.next() {
            Some(d @ '1'..='9') => {
                let n = d as usize - '0' as usize;
                if n >= from {
                    out.push_str(&(n + 1).to_string());
                } else {
                    out.push(d);
                }
            }
            Some(other) => out.push(other),
            None => {}
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expands_identifier_token() {
        assert_eq!(canonicalize(r"\i\.foo"), format!(r"{}\.foo", IDENTIFIER));
    }

    #[test]
    fn test_escaped_backslash_is_kept() {
        assert_eq!(canonicalize(r"a\\i"), r"a\\i");
    }

    #[test]
    fn test_other_escapes_pass_through() {
        assert_eq!(canonicalize(r"\d+\(\)"), r"\d+\(\)");
    }

    #[test]
    fn test_compiled_pattern_matches_minified_names() {
        let re = compile(r"(\i)\.push\((\i)\)").unwrap();
        assert!(!re.is_fancy());
        let text = "x=$e.push(t0)";
        let spans = re.spans(text);
        assert_eq!(spans.len(), 1);
        let caps = spans[0].captured(text, "");
        assert_eq!(caps.group(1), "$e");
        assert_eq!(caps.group(2), "t0");
    }

    #[test]
    fn test_variable_lookbehind_matches_after_prefix() {
        let re = compile(r"(?<=onContextMenu:\i,children:).*?\)}").unwrap();
        assert!(re.is_fancy());
        let text = "{onContextMenu:e,children:r(t)}";
        let spans = re.spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(&text[spans[0].start..spans[0].end], "r(t)}");
        assert!(spans[0].groups.is_empty());
    }

    #[test]
    fn test_lookbehind_groups_keep_their_numbers() {
        let re = compile(r"(?<=function\((\i),\i\)\{)(?=let (\i)=)").unwrap();
        let text = "function(e,t){let n=1";
        let spans = re.spans(text);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, spans[0].end);
        let caps = spans[0].captured(text, "");
        assert_eq!(caps.group(1), "e");
        assert_eq!(caps.group(2), "n");
    }

    #[test]
    fn test_backreference_pattern() {
        let re = compile(r"(\i)=\1").unwrap();
        assert!(re.is_fancy());
        assert!(re.is_match("a=a"));
        assert!(!re.is_match("a=b"));
    }

    #[test]
    fn test_group_helpers() {
        assert_eq!(count_groups(r"(a)(?:b)(?P<n>c)(?<=d)\(e[(]"), 2);
        assert_eq!(shift_backrefs(r"\1\2\d", 2), r"\1\3\d");
        assert_eq!(split_leading_lookbehind(r"(?<=a(b)\))c"), Some((r"a(b)\)", "c")));
        assert_eq!(split_leading_lookbehind("abc"), None);
    }

    #[test]
    fn test_invalid_pattern_reports_original_text() {
        let err = compile(r"(\i").unwrap_err();
        assert!(err.to_string().contains(r"(\i"));
    }
}
