//! Capability model.
//!
//! Every backend declares the set of [`Capability`] tags it supports when it
//! is constructed. Callers (and the UI) branch on membership in that set
//! instead of on the concrete backend type.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A named feature a provider either supports or does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    List,
    Read,
    Write,
    Delete,
    Mkdir,
    Rmdir,
    Copy,
    Move,
    /// Copy performed by the backend without routing bytes through the client.
    ServerSideCopy,
    Download,
    Upload,
    /// Ranged reads, used to resume interrupted downloads.
    Resume,
    Versioning,
    Metadata,
    /// Entries carry POSIX permission bits, owner and group.
    Permissions,
    /// Symlinks are reported as such, with their target.
    Symlinks,
    /// Entries report their hard link count.
    Hardlinks,
    PresignedUrls,
    BatchDelete,
    ExtendedAttrs,
    /// The backend exposes top-level containers (buckets).
    Containers,
    FileLocking,
    Delegations,
    /// The backend holds a live session that can drop and reconnect.
    Connection,
}

impl Capability {
    /// Every capability, in declaration order.
    pub const ALL: [Capability; 24] = [
        Capability::List,
        Capability::Read,
        Capability::Write,
        Capability::Delete,
        Capability::Mkdir,
        Capability::Rmdir,
        Capability::Copy,
        Capability::Move,
        Capability::ServerSideCopy,
        Capability::Download,
        Capability::Upload,
        Capability::Resume,
        Capability::Versioning,
        Capability::Metadata,
        Capability::Permissions,
        Capability::Symlinks,
        Capability::Hardlinks,
        Capability::PresignedUrls,
        Capability::BatchDelete,
        Capability::ExtendedAttrs,
        Capability::Containers,
        Capability::FileLocking,
        Capability::Delegations,
        Capability::Connection,
    ];

    /// The wire tag for this capability.
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::List => "list",
            Capability::Read => "read",
            Capability::Write => "write",
            Capability::Delete => "delete",
            Capability::Mkdir => "mkdir",
            Capability::Rmdir => "rmdir",
            Capability::Copy => "copy",
            Capability::Move => "move",
            Capability::ServerSideCopy => "server_side_copy",
            Capability::Download => "download",
            Capability::Upload => "upload",
            Capability::Resume => "resume",
            Capability::Versioning => "versioning",
            Capability::Metadata => "metadata",
            Capability::Permissions => "permissions",
            Capability::Symlinks => "symlinks",
            Capability::Hardlinks => "hardlinks",
            Capability::PresignedUrls => "presigned_urls",
            Capability::BatchDelete => "batch_delete",
            Capability::ExtendedAttrs => "extended_attrs",
            Capability::Containers => "containers",
            Capability::FileLocking => "file_locking",
            Capability::Delegations => "delegations",
            Capability::Connection => "connection",
        }
    }

    const fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Capability::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| format!("Unknown capability: {}", s))
    }
}

/// An immutable set of capabilities.
///
/// Sets are plain values: a provider copies its set out at construction time
/// and never exposes a way to mutate it afterwards.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CapabilitySet(u32);

impl CapabilitySet {
    /// The empty set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Build a set from a slice of capabilities.
    pub const fn of(capabilities: &[Capability]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < capabilities.len() {
            bits |= capabilities[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Return a new set that also contains `capability`.
    pub const fn with(self, capability: Capability) -> Self {
        Self(self.0 | capability.bit())
    }

    /// Return a new set without `capability`.
    pub const fn without(self, capability: Capability) -> Self {
        Self(self.0 & !capability.bit())
    }

    /// Union of two sets.
    pub const fn union(self, other: CapabilitySet) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn contains(&self, capability: Capability) -> bool {
        self.0 & capability.bit() != 0
    }

    pub fn contains_all(&self, capabilities: &[Capability]) -> bool {
        capabilities.iter().all(|c| self.contains(*c))
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Iterate members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = Capability> + '_ {
        Capability::ALL.into_iter().filter(|c| self.contains(*c))
    }

    pub fn to_vec(&self) -> Vec<Capability> {
        self.iter().collect()
    }
}

impl FromIterator<Capability> for CapabilitySet {
    fn from_iter<I: IntoIterator<Item = Capability>>(iter: I) -> Self {
        iter.into_iter()
            .fold(CapabilitySet::empty(), |set, c| set.with(c))
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for CapabilitySet {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for CapabilitySet {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let tags = Vec::<Capability>::deserialize(deserializer)?;
        Ok(tags.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_membership() {
        let set = CapabilitySet::of(&[Capability::List, Capability::Read]);
        assert!(set.contains(Capability::List));
        assert!(set.contains(Capability::Read));
        assert!(!set.contains(Capability::Write));
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_with_returns_new_set() {
        let base = CapabilitySet::of(&[Capability::List]);
        let extended = base.with(Capability::Connection);
        assert!(!base.contains(Capability::Connection));
        assert!(extended.contains(Capability::Connection));
        assert!(!extended.without(Capability::List).contains(Capability::List));
    }

    #[test]
    fn test_all_tags_round_trip_through_str() {
        for capability in Capability::ALL {
            assert_eq!(capability.as_str().parse::<Capability>(), Ok(capability));
        }
        assert!("teleport".parse::<Capability>().is_err());
    }

    #[test]
    fn test_serializes_as_tag_list() {
        let set = CapabilitySet::of(&[Capability::ServerSideCopy, Capability::List]);
        let json = serde_json::to_string(&set).unwrap();
        assert_eq!(json, r#"["list","server_side_copy"]"#);
        let back: CapabilitySet = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
