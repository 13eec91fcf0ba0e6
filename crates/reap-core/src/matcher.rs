//! Tag pattern matching for `delete-tags` and `exclude-tags`.
//!
//! A pattern list is a comma-separated set of globs (`*` = any run of
//! characters, `?` = exactly one) that are OR-ed together. With regex mode
//! enabled each entry is instead a regular expression that must match the
//! whole tag.

use glob::Pattern;
use regex::Regex;
use thiserror::Error;

/// A pattern in the list failed to compile.
#[derive(Error, Debug)]
pub enum MatcherError {
    #[error("Invalid glob pattern '{pattern}': {source}")]
    Glob {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("Invalid regular expression '{pattern}': {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
enum Rule {
    Glob(Pattern),
    Regex(Regex),
}

impl Rule {
    fn matches(&self, tag: &str) -> bool {
        match self {
            Self::Glob(p) => p.matches(tag),
            Self::Regex(r) => r.is_match(tag),
        }
    }
}

/// A compiled comma-separated pattern list.
#[derive(Debug, Clone, Default)]
pub struct TagMatcher {
    rules: Vec<Rule>,
}

impl TagMatcher {
    /// Compile `patterns` as globs, or as anchored regular expressions when
    /// `use_regex` is set. Blank entries are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MatcherError`] naming the first pattern that fails to compile.
    pub fn new(patterns: &str, use_regex: bool) -> Result<Self, MatcherError> {
        let rules = split_patterns(patterns)
            .map(|pattern| {
                if use_regex {
                    Regex::new(&format!("^(?:{pattern})$"))
                        .map(Rule::Regex)
                        .map_err(|source| MatcherError::Regex {
                            pattern: pattern.to_string(),
                            source,
                        })
                } else {
                    Pattern::new(pattern)
                        .map(Rule::Glob)
                        .map_err(|source| MatcherError::Glob {
                            pattern: pattern.to_string(),
                            source,
                        })
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// A matcher that matches nothing.
    pub fn none() -> Self {
        Self::default()
    }

    /// Whether the list holds no patterns (and therefore matches nothing).
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Whether any pattern matches `tag`.
    pub fn matches(&self, tag: &str) -> bool {
        self.rules.iter().any(|r| r.matches(tag))
    }
}

fn split_patterns(patterns: &str) -> impl Iterator<Item = &str> {
    patterns.split(',').map(str::trim).filter(|p| !p.is_empty())
}

/// One-shot glob match of a comma-separated pattern list against `tag`.
///
/// Patterns that fail to compile never match.
///
/// ```
/// use reap_core::matcher::matches;
///
/// assert!(matches("v1.*,latest", "v1.2"));
/// assert!(!matches("", "latest"));
/// ```
pub fn matches(patterns: &str, tag: &str) -> bool {
    split_patterns(patterns).any(|p| Pattern::new(p).is_ok_and(|p| p.matches(tag)))
}
