//! Consistent hashing with virtual nodes.
//!
//! Each member is placed on the ring `vnodes_per_member` times. A ring is
//! built in one go from a member list and never mutated afterwards; the
//! membership ring publishes a fresh one on every rebuild.

use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use twox_hash::XxHash64;

/// An immutable consistent-hash ring over member names.
#[derive(Debug, Clone, Default)]
pub struct HashRing {
    /// Ring position to index into `members`.
    vnodes: BTreeMap<u64, usize>,

    /// Sorted, deduplicated member names.
    members: Vec<String>,

    vnodes_per_member: usize,
}

impl HashRing {
    /// Build a ring. Duplicate names are placed once.
    ///
    /// Placement depends only on the member set, not on iteration order: on a
    /// position collision the lexicographically smaller name keeps the slot.
    pub fn build<I, S>(members: I, vnodes_per_member: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut members: Vec<String> = members.into_iter().map(Into::into).collect();
        members.sort_unstable();
        members.dedup();

        let mut vnodes = BTreeMap::new();
        for (idx, member) in members.iter().enumerate() {
            for i in 0..vnodes_per_member {
                let vnode_key = format!("{}:{}", member, i);
                vnodes.entry(Self::hash_key(vnode_key.as_bytes())).or_insert(idx);
            }
        }

        Self {
            vnodes,
            members,
            vnodes_per_member,
        }
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[String] {
        &self.members
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.binary_search_by(|m| m.as_str().cmp(member)).is_ok()
    }

    pub fn vnodes_per_member(&self) -> usize {
        self.vnodes_per_member
    }

    /// The member owning `key`, or `None` on an empty ring.
    pub fn owner(&self, key: &[u8]) -> Option<&str> {
        let hash = Self::hash_key(key);
        self.vnodes
            .range(hash..)
            .next()
            .or_else(|| self.vnodes.iter().next())
            .map(|(_, &idx)| self.members[idx].as_str())
    }

    /// Up to `count` distinct members for `key`, walking clockwise from its
    /// position. The first is the owner.
    pub fn owners(&self, key: &[u8], count: usize) -> Vec<&str> {
        let want = count.min(self.members.len());
        let mut owners: Vec<&str> = Vec::with_capacity(want);
        if want == 0 {
            return owners;
        }

        let hash = Self::hash_key(key);
        for (_, &idx) in self.vnodes.range(hash..).chain(self.vnodes.iter()) {
            let member = self.members[idx].as_str();
            if !owners.contains(&member) {
                owners.push(member);
                if owners.len() >= want {
                    break;
                }
            }
        }
        owners
    }

    /// Owner counts for `sample_size` synthetic keys.
    pub fn distribution(&self, sample_size: usize) -> HashMap<String, usize> {
        let mut distribution = HashMap::new();
        for i in 0..sample_size {
            let key = format!("sample_key_{}", i);
            if let Some(owner) = self.owner(key.as_bytes()) {
                *distribution.entry(owner.to_string()).or_insert(0) += 1;
            }
        }
        distribution
    }

    fn hash_key(key: &[u8]) -> u64 {
        let mut hasher = XxHash64::with_seed(0);
        key.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ring(names: &[&str]) -> HashRing {
        HashRing::build(names.iter().copied(), 100)
    }

    #[test]
    fn test_empty_ring() {
        let ring = HashRing::build(Vec::<String>::new(), 100);
        assert!(ring.is_empty());
        assert!(ring.owner(b"key").is_none());
        assert!(ring.owners(b"key", 3).is_empty());
    }

    #[test]
    fn test_single_member() {
        let ring = ring(&["a"]);
        assert_eq!(ring.owner(b"key"), Some("a"));
        assert_eq!(ring.owners(b"key", 3), vec!["a"]);
    }

    #[test]
    fn test_owners_distinct() {
        let ring = ring(&["a", "b", "c"]);
        let owners = ring.owners(b"key", 2);
        assert_eq!(owners.len(), 2);
        assert_ne!(owners[0], owners[1]);
        assert_eq!(Some(owners[0]), ring.owner(b"key"));
    }

    #[test]
    fn test_duplicates_and_order_ignored() {
        let a = ring(&["c", "a", "b", "a"]);
        let b = ring(&["a", "b", "c"]);
        assert_eq!(a.len(), 3);
        assert!(a.contains("b"));
        assert!(!a.contains("d"));
        for i in 0..500 {
            let key = format!("abc{i:02x}");
            assert_eq!(a.owner(key.as_bytes()), b.owner(key.as_bytes()));
        }
    }

    #[test]
    fn test_deterministic() {
        let ring = ring(&["n1", "n2", "n3"]);
        let first = ring.owner(b"abcde").map(str::to_string);
        for _ in 0..100 {
            assert_eq!(ring.owner(b"abcde").map(str::to_string), first);
        }
    }

    #[test]
    fn test_distribution() {
        let ring = ring(&["n1", "n2", "n3"]);
        let distribution = ring.distribution(10000);
        for member in ring.members() {
            let count = distribution.get(member).copied().unwrap_or(0);
            assert!(count > 2300 && count < 4500, "{member} has {count} keys");
        }
    }

    #[test]
    fn test_adding_member_moves_few_keys() {
        let before = ring(&["n1", "n2", "n3", "n4"]);
        let after = ring(&["n1", "n2", "n3", "n4", "n5"]);
        let total = 10000;
        let mut moved = 0;
        for i in 0..total {
            let key = format!("{i:05x}");
            let (b, a) = (before.owner(key.as_bytes()), after.owner(key.as_bytes()));
            if b != a {
                assert_eq!(a, Some("n5"), "keys only move to the new member");
                moved += 1;
            }
        }
        // ideal is total / 5
        assert!(moved < total * 3 / 10, "{moved} of {total} keys moved");
    }
}
