//! Capability model - enumerable capability classes and sets.
//!
//! Arms declare what they can do, actions derive what they need, and tokens
//! carry what was granted. All three are [`CapabilitySet`]s, and every
//! authorization decision is a coverage check between two sets.
//!
//! # Wire format
//! ```text
//! fs:read            read files inside the sandbox root
//! fs:write           create or overwrite files inside the sandbox root
//! process:exec       spawn a process in the sandbox (needs fs:read and fs:write too)
//! net:api.example.com  reach exactly that host
//! net:*.example.com    reach any subdomain of example.com (declarations only)
//! net:*                reach any host (declarations only)
//! skill:planning     arm-level specialty tag
//! planning           shorthand for skill:planning
//! ```

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A single capability class.
///
/// # Invariants
/// - `Network` hosts are lowercase and non-empty
/// - `Skill` names are non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Capability {
    /// Read-only filesystem access
    FsRead,
    /// Write filesystem access (does not imply read)
    FsWrite,
    /// Process spawning
    ProcessExec,
    /// Network access to a host pattern
    Network(String),
    /// Arm specialty (e.g. "planning", "code_generation")
    Skill(String),
}

impl Capability {
    /// Create a network capability for a host (normalized to lowercase).
    pub fn network(host: impl AsRef<str>) -> Self {
        Self::Network(host.as_ref().trim().to_ascii_lowercase())
    }

    /// Create a skill capability.
    pub fn skill(name: impl Into<String>) -> Self {
        Self::Skill(name.into())
    }

    /// Whether this capability is a wildcard network pattern.
    pub fn is_wildcard(&self) -> bool {
        matches!(self, Self::Network(host) if host.starts_with('*'))
    }

    /// Check whether holding `self` authorizes `required`.
    ///
    /// # Property
    /// `a.covers(a)` for all `a`; wildcards only ever widen network hosts.
    pub fn covers(&self, required: &Capability) -> bool {
        if self == required {
            return true;
        }
        match (self, required) {
            (Self::Network(pattern), Self::Network(host)) => host_matches(pattern, host),
            _ => false,
        }
    }
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host
            .strip_suffix(suffix)
            .map(|rest| rest.ends_with('.') && rest.len() > 1)
            .unwrap_or(false),
        None => pattern == host,
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FsRead => write!(f, "fs:read"),
            Self::FsWrite => write!(f, "fs:write"),
            Self::ProcessExec => write!(f, "process:exec"),
            Self::Network(host) => write!(f, "net:{}", host),
            Self::Skill(name) => write!(f, "skill:{}", name),
        }
    }
}

/// Error parsing a capability string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CapabilityParseError {
    #[error("Capability string is empty")]
    Empty,

    #[error("Unknown capability class '{0}'")]
    UnknownClass(String),

    #[error("Capability '{0}' is missing its argument")]
    MissingArgument(String),
}

impl FromStr for Capability {
    type Err = CapabilityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(CapabilityParseError::Empty);
        }
        let Some((class, arg)) = s.split_once(':') else {
            return Ok(Self::Skill(s.to_string()));
        };
        match (class, arg.trim()) {
            ("fs", "read") => Ok(Self::FsRead),
            ("fs", "write") => Ok(Self::FsWrite),
            ("process", "exec") => Ok(Self::ProcessExec),
            ("net", "") | ("skill", "") => Err(CapabilityParseError::MissingArgument(s.to_string())),
            ("net", host) => Ok(Self::network(host)),
            ("skill", name) => Ok(Self::Skill(name.to_string())),
            _ => Err(CapabilityParseError::UnknownClass(s.to_string())),
        }
    }
}

impl TryFrom<String> for Capability {
    type Error = CapabilityParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Capability> for String {
    fn from(value: Capability) -> Self {
        value.to_string()
    }
}

/// An ordered set of capabilities.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet(BTreeSet<Capability>);

impl CapabilitySet {
    pub fn new() -> Self {
        Self(BTreeSet::new())
    }

    /// Parse a list of capability strings.
    pub fn parse<I, S>(items: I) -> Result<Self, CapabilityParseError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        items
            .into_iter()
            .map(|s| s.as_ref().parse::<Capability>())
            .collect::<Result<BTreeSet<_>, _>>()
            .map(Self)
    }

    pub fn insert(&mut self, capability: Capability) -> bool {
        self.0.insert(capability)
    }

    pub fn contains(&self, capability: &Capability) -> bool {
        self.0.contains(capability)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Capability> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check that every capability in `required` is covered by some member.
    pub fn covers(&self, required: &CapabilitySet) -> bool {
        required.iter().all(|r| self.covers_one(r))
    }

    /// Check a single requirement.
    pub fn covers_one(&self, required: &Capability) -> bool {
        self.0.contains(required) || self.0.iter().any(|held| held.covers(required))
    }

    /// Requirements in `required` that this set does not cover.
    pub fn uncovered(&self, required: &CapabilitySet) -> CapabilitySet {
        required
            .iter()
            .filter(|r| !self.covers_one(r))
            .cloned()
            .collect()
    }

    /// Whether every requirement appears literally (no wildcard coverage).
    pub fn contains_all(&self, required: &CapabilitySet) -> bool {
        required.0.is_subset(&self.0)
    }

    pub fn union(&self, other: &CapabilitySet) -> CapabilitySet {
        Self(self.0.union(&other.0).cloned().collect())
    }

    /// Capability strings, for claims and logs.
    pub fn to_strings(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a CapabilitySet {
    type Item = &'a Capability;
    type IntoIter = std::collections::btree_set::Iter<'a, Capability>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}}}", self.to_strings().join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(items: &[&str]) -> CapabilitySet {
        CapabilitySet::parse(items).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        assert_eq!("fs:read".parse::<Capability>().unwrap(), Capability::FsRead);
        assert_eq!(
            "net:API.Example.com".parse::<Capability>().unwrap(),
            Capability::Network("api.example.com".to_string())
        );
        assert_eq!(
            "planning".parse::<Capability>().unwrap(),
            Capability::skill("planning")
        );
        assert_eq!(Capability::ProcessExec.to_string(), "process:exec");
        assert!("fs:execute".parse::<Capability>().is_err());
        assert!("net:".parse::<Capability>().is_err());
    }

    #[test]
    fn test_read_does_not_cover_write() {
        let read_only = set(&["fs:read"]);
        assert!(!read_only.covers(&set(&["fs:write"])));
        assert!(!set(&["fs:write"]).covers(&set(&["fs:read"])));
    }

    #[test]
    fn test_network_wildcards() {
        let any = Capability::network("*");
        let sub = Capability::network("*.example.com");
        assert!(any.covers(&Capability::network("foo.org")));
        assert!(sub.covers(&Capability::network("api.example.com")));
        assert!(!sub.covers(&Capability::network("example.com")));
        assert!(!sub.covers(&Capability::network("evilexample.com")));
        assert!(!Capability::network("api.example.com").covers(&sub));
    }

    #[test]
    fn test_uncovered_reports_missing() {
        let declared = set(&["fs:read", "net:*.example.com", "skill:search"]);
        let required = set(&["fs:read", "fs:write", "net:api.example.com"]);
        assert_eq!(declared.uncovered(&required), set(&["fs:write"]));
        assert!(!declared.contains_all(&set(&["net:api.example.com"])));
    }

    #[test]
    fn test_serde_as_strings() {
        let caps = set(&["fs:read", "skill:coder"]);
        let json = serde_json::to_string(&caps).unwrap();
        assert_eq!(json, r#"["fs:read","skill:coder"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, caps);
    }
}
