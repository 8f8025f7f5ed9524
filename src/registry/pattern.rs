//! Match patterns over application identity.

use std::fmt;

/// Wildcard accepting any identity.
pub const ANY: &str = "*";

/// Predicate restricting which applications may bind to a service.
///
/// Matching rules:
/// - `*` matches every application
/// - `prefix.*` matches identities starting with `prefix.`
/// - anything else is an exact identity match
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum MatchPattern {
    #[default]
    Any,
    Prefix(String),
    Exact(String),
}

impl MatchPattern {
    /// Parse a pattern string. Returns `None` for an empty pattern.
    pub fn parse(pattern: &str) -> Option<Self> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return None;
        }
        if pattern == ANY {
            return Some(Self::Any);
        }
        match pattern.strip_suffix(".*") {
            Some(prefix) if !prefix.is_empty() => Some(Self::Prefix(format!("{prefix}."))),
            _ => Some(Self::Exact(pattern.to_string())),
        }
    }

    pub fn matches(&self, application_id: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Prefix(prefix) => application_id.starts_with(prefix.as_str()),
            Self::Exact(id) => id == application_id,
        }
    }
}

impl fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str(ANY),
            Self::Prefix(prefix) => write!(f, "{prefix}*"),
            Self::Exact(id) => f.write_str(id),
        }
    }
}
