use crate::error::{SwitchyardError, SwitchyardResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// A kind of work a worker can perform.
///
/// Tags are a closed set so that a misspelled capability fails at decode
/// time instead of silently producing an unroutable task.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Writing or editing source code.
    Code,
    /// Reviewing changes.
    Review,
    /// Running test suites.
    Test,
    /// Compiling and packaging artifacts.
    Build,
    /// Shipping artifacts to a target environment.
    Deploy,
    /// Conversing on a chat platform.
    Chat,
    /// Publishing posts or announcements.
    Post,
    /// Sending OSC control messages.
    Osc,
    /// Acting inside a virtual-world platform.
    World,
    /// Producing or transforming media.
    Media,
    /// Gathering information.
    Research,
    /// Analysing data or logs.
    Analysis,
}

impl Capability {
    /// Every known tag, in declaration order.
    pub const ALL: [Capability; 12] = [
        Capability::Code,
        Capability::Review,
        Capability::Test,
        Capability::Build,
        Capability::Deploy,
        Capability::Chat,
        Capability::Post,
        Capability::Osc,
        Capability::World,
        Capability::Media,
        Capability::Research,
        Capability::Analysis,
    ];

    /// Wire name of the tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Code => "code",
            Capability::Review => "review",
            Capability::Test => "test",
            Capability::Build => "build",
            Capability::Deploy => "deploy",
            Capability::Chat => "chat",
            Capability::Post => "post",
            Capability::Osc => "osc",
            Capability::World => "world",
            Capability::Media => "media",
            Capability::Research => "research",
            Capability::Analysis => "analysis",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = SwitchyardError;

    fn from_str(s: &str) -> SwitchyardResult<Self> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| SwitchyardError::Protocol(format!("Unknown capability '{s}'")))
    }
}

/// An ordered set of capability tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilitySet {
    tags: BTreeSet<Capability>,
}

impl CapabilitySet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a tag.
    pub fn insert(&mut self, cap: Capability) {
        self.tags.insert(cap);
    }

    /// Removes a tag.
    pub fn remove(&mut self, cap: Capability) {
        self.tags.remove(&cap);
    }

    /// Returns `true` if the tag is present.
    pub fn contains(&self, cap: Capability) -> bool {
        self.tags.contains(&cap)
    }

    /// Returns `true` if every tag in `required` is also in `self`.
    ///
    /// An empty `required` set is trivially satisfied; callers that treat
    /// empty requirements as unroutable must check that separately.
    pub fn is_superset_of(&self, required: &CapabilitySet) -> bool {
        self.tags.is_superset(&required.tags)
    }

    /// Returns `true` if the set holds no tags.
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }

    /// Number of tags.
    pub fn len(&self) -> usize {
        self.tags.len()
    }

    /// Iterates over tags in order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        self.tags.iter().copied()
    }

    /// Parses a list of tag names, failing on the first unknown one.
    pub fn parse<I, S>(names: I) -> SwitchyardResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .map(|n| n.as_ref().parse::<Capability>())
            .collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<T: IntoIterator<Item = Capability>>(iter: T) -> Self {
        Self {
            tags: iter.into_iter().collect(),
        }
    }
}

impl<const N: usize> From<[Capability; N]> for CapabilitySet {
    fn from(caps: [Capability; N]) -> Self {
        caps.into_iter().collect()
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.tags.iter().map(Capability::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_superset_check() {
        let worker = CapabilitySet::from([Capability::Code, Capability::Test, Capability::Build]);
        let task = CapabilitySet::from([Capability::Code, Capability::Test]);
        assert!(worker.is_superset_of(&task));
        assert!(!task.is_superset_of(&worker));
    }

    #[test]
    fn test_disjoint_sets_do_not_match() {
        let worker = CapabilitySet::from([Capability::Chat]);
        let task = CapabilitySet::from([Capability::Deploy]);
        assert!(!worker.is_superset_of(&task));
    }

    #[test]
    fn test_parse_rejects_typo() {
        assert!(CapabilitySet::parse(["code", "tset"]).is_err());
        let set = CapabilitySet::parse(["osc", "world"]).unwrap();
        assert!(set.contains(Capability::Osc));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_serializes_as_sorted_list() {
        let set = CapabilitySet::from([Capability::Test, Capability::Code]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["code","test"]"#);
    }

    #[test]
    fn test_deserialize_unknown_tag_fails() {
        let parsed: Result<CapabilitySet, _> = serde_json::from_str(r#"["code","teleport"]"#);
        assert!(parsed.is_err());
    }

    #[test]
    fn test_display() {
        let set = CapabilitySet::from([Capability::Deploy, Capability::Build]);
        assert_eq!(set.to_string(), "[build, deploy]");
    }
}
