//! QueueGroup identifiers: `[<kind>:]<queue>[,<queue>]*`.
//!
//! A QueueGroup is stored and compared verbatim as a string; the master never
//! parses queue semantics beyond splitting off an optional leading
//! `<kind>:` prefix to select a worker variant (§6).

// Layer 1: Standard library imports
use std::fmt;

// Layer 2: Third-party crate imports
use serde::{Deserialize, Serialize};

// Layer 3: Internal module imports
// (none)

/// Opaque queue-group identifier, used verbatim as a map key everywhere in
/// the core (Registry, Configuration, BackoffState).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueGroup(String);

impl QueueGroup {
    /// Wrap a raw queue-group string verbatim. No validation is performed
    /// here; `kind()` simply returns `None` for strings that don't contain a
    /// syntactically valid `<kind>:` prefix.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The string as it appears in configuration and logs.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split off the `<kind>:` prefix, if present and syntactically valid
    /// (`^[A-Za-z_][A-Za-z0-9_]*`). Returns `None` for the default kind.
    pub fn kind(&self) -> Option<&str> {
        let (prefix, rest) = self.0.split_once(':')?;
        if rest.is_empty() || !is_valid_kind(prefix) {
            return None;
        }
        Some(prefix)
    }

    /// The queue list portion, with any `<kind>:` prefix stripped.
    pub fn queues(&self) -> &str {
        match self.kind() {
            Some(kind) => &self.0[kind.len() + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for QueueGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for QueueGroup {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for QueueGroup {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

fn is_valid_kind(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
