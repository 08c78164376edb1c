//! Dot-namespaced capability scopes.
//!
//! A scope names one class of operation on one slice of the vault, e.g.
//! `vault.write.food` or the wildcard form `vault.read.*`. Scopes are parsed
//! into a value type at the boundary so the matching rule lives in exactly
//! one function instead of scattered string comparisons.

use std::fmt;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ScopeError;

/// A parsed capability scope: namespace segments plus an optional trailing
/// wildcard.
///
/// `vault.write.food` → segments `["vault", "write", "food"]`, no wildcard.
/// `vault.read.*` → segments `["vault", "read"]`, wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Scope {
    segments: Vec<String>,
    wildcard: bool,
}

impl Scope {
    /// Parse a scope string.
    ///
    /// Rules: at least one segment; segments are non-empty and contain no
    /// whitespace; `*` may appear only as the final segment.
    ///
    /// # Errors
    ///
    /// Returns [`ScopeError::Invalid`] for empty scopes, empty segments,
    /// embedded wildcards, or a bare `*`.
    pub fn parse(raw: &str) -> Result<Self, ScopeError> {
        let invalid = |reason: &str| ScopeError::Invalid {
            scope: raw.to_owned(),
            reason: reason.to_owned(),
        };

        if raw.is_empty() {
            return Err(invalid("scope is empty"));
        }

        let mut parts: Vec<&str> = raw.split('.').collect();
        let wildcard = parts.last() == Some(&"*");
        if wildcard {
            parts.pop();
            if parts.is_empty() {
                return Err(invalid("bare wildcard grants everything"));
            }
        }

        let mut segments = Vec::with_capacity(parts.len());
        for part in parts {
            if part.is_empty() {
                return Err(invalid("empty segment"));
            }
            if part.contains('*') {
                return Err(invalid("wildcard only allowed as the final segment"));
            }
            if part.chars().any(char::is_whitespace) {
                return Err(invalid("whitespace in segment"));
            }
            segments.push(part.to_owned());
        }

        Ok(Self { segments, wildcard })
    }

    /// Whether this scope ends in a wildcard.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    /// The namespace segments (wildcard excluded).
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Does a token carrying this scope satisfy `requested`?
    ///
    /// The single matching rule:
    /// - exact scopes match byte-for-byte;
    /// - a wildcard grant `a.b.*` satisfies any requested scope whose
    ///   segments strictly extend the prefix `a.b`, and any requested
    ///   wildcard at or below that prefix;
    /// - a wildcard never satisfies a request *outside* its prefix, and an
    ///   exact grant never satisfies a wildcard request.
    #[must_use]
    pub fn satisfies(&self, requested: &Scope) -> bool {
        if self.wildcard {
            if requested.segments.len() < self.segments.len() {
                return false;
            }
            if !requested.wildcard && requested.segments.len() == self.segments.len() {
                // `a.b.*` does not grant the bare `a.b` operation itself.
                return false;
            }
            requested
                .segments
                .iter()
                .zip(&self.segments)
                .all(|(r, s)| r == s)
        } else {
            !requested.wildcard && self.segments == requested.segments
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))?;
        if self.wildcard {
            write!(f, ".*")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for Scope {
    type Err = ScopeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

// Scopes serialize as their string form so token payloads and stored
// records stay human-readable.
impl Serialize for Scope {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Scope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Scope::parse(&raw).map_err(DeError::custom)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn s(raw: &str) -> Scope {
        Scope::parse(raw).unwrap()
    }

    #[test]
    fn parse_exact_scope() {
        let scope = s("vault.write.food");
        assert!(!scope.is_wildcard());
        assert_eq!(scope.segments(), ["vault", "write", "food"]);
    }

    #[test]
    fn parse_wildcard_scope() {
        let scope = s("vault.read.*");
        assert!(scope.is_wildcard());
        assert_eq!(scope.segments(), ["vault", "read"]);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(Scope::parse("").is_err());
        assert!(Scope::parse("*").is_err());
        assert!(Scope::parse("vault..food").is_err());
        assert!(Scope::parse("vault.re*ad.food").is_err());
        assert!(Scope::parse("vault.*.food").is_err());
        assert!(Scope::parse("vault.read.").is_err());
        assert!(Scope::parse("vault. read").is_err());
    }

    #[test]
    fn exact_matches_only_itself() {
        let grant = s("vault.write.food");
        assert!(grant.satisfies(&s("vault.write.food")));
        assert!(!grant.satisfies(&s("vault.write.health")));
        assert!(!grant.satisfies(&s("vault.read.food")));
        assert!(!grant.satisfies(&s("vault.write.food.extra")));
        assert!(!grant.satisfies(&s("vault.write.*")));
    }

    #[test]
    fn wildcard_matches_prefix_extensions() {
        let grant = s("vault.read.*");
        assert!(grant.satisfies(&s("vault.read.food")));
        assert!(grant.satisfies(&s("vault.read.food.history")));
        assert!(!grant.satisfies(&s("vault.write.food")));
        assert!(!grant.satisfies(&s("vault.read")));
        assert!(!grant.satisfies(&s("payments.read.food")));
    }

    #[test]
    fn wildcard_request_needs_equal_or_wider_wildcard_grant() {
        assert!(s("vault.read.*").satisfies(&s("vault.read.*")));
        assert!(s("vault.*").satisfies(&s("vault.read.*")));
        assert!(!s("vault.read.*").satisfies(&s("vault.*")));
        assert!(!s("vault.read.food").satisfies(&s("vault.read.*")));
    }

    #[test]
    fn display_roundtrips() {
        for raw in ["vault.write.food", "vault.read.*", "session"] {
            assert_eq!(s(raw).to_string(), raw);
        }
    }

    #[test]
    fn serde_uses_string_form() {
        let scope = s("vault.read.*");
        let json = serde_json::to_string(&scope).unwrap();
        assert_eq!(json, "\"vault.read.*\"");
        let back: Scope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, scope);
        assert!(serde_json::from_str::<Scope>("\"*\"").is_err());
    }
}
