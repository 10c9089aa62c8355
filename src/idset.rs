use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Ordered set of overlay ranks.
///
/// On the wire an idset is the canonical range-list string (`"0-3,7,9-11"`):
/// ranks in ascending order, runs of two or more collapsed to `lo-hi`, and
/// the empty set encoded as the empty string. `Display` always produces the
/// canonical form, so equal sets encode identically.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct IdSet {
    ids: BTreeSet<u32>,
}

impl IdSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(rank: u32) -> Self {
        let mut ids = BTreeSet::new();
        ids.insert(rank);
        Self { ids }
    }

    pub fn insert(&mut self, rank: u32) -> bool {
        self.ids.insert(rank)
    }

    pub fn remove(&mut self, rank: u32) -> bool {
        self.ids.remove(&rank)
    }

    pub fn contains(&self, rank: u32) -> bool {
        self.ids.contains(&rank)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Lowest rank in the set.
    pub fn first(&self) -> Option<u32> {
        self.ids.iter().next().copied()
    }

    /// Ranks in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.ids.iter().copied()
    }

    /// Union `other` into this set.
    pub fn extend_from(&mut self, other: &IdSet) {
        self.ids.extend(other.ids.iter().copied());
    }

    pub fn intersection(&self, other: &IdSet) -> IdSet {
        IdSet {
            ids: self.ids.intersection(&other.ids).copied().collect(),
        }
    }

    pub fn difference(&self, other: &IdSet) -> IdSet {
        IdSet {
            ids: self.ids.difference(&other.ids).copied().collect(),
        }
    }

    pub fn intersects(&self, other: &IdSet) -> bool {
        self.ids.intersection(&other.ids).next().is_some()
    }

    pub fn is_subset(&self, other: &IdSet) -> bool {
        self.ids.is_subset(&other.ids)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

impl FromIterator<u32> for IdSet {
    fn from_iter<T: IntoIterator<Item = u32>>(iter: T) -> Self {
        Self {
            ids: iter.into_iter().collect(),
        }
    }
}

impl fmt::Display for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut iter = self.ids.iter().copied().peekable();
        let mut first = true;
        while let Some(lo) = iter.next() {
            let mut hi = lo;
            while iter.peek().copied() == hi.checked_add(1) {
                hi += 1;
                iter.next();
            }
            if !first {
                write!(f, ",")?;
            }
            first = false;
            if hi > lo {
                write!(f, "{lo}-{hi}")?;
            } else {
                write!(f, "{lo}")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for IdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdSet(\"{self}\")")
    }
}

impl FromStr for IdSet {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let mut ids = BTreeSet::new();
        if s.is_empty() {
            return Ok(Self { ids });
        }
        for part in s.split(',') {
            let part = part.trim();
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: u32 = lo.trim().parse().map_err(|_| malformed(s))?;
                let hi: u32 = hi.trim().parse().map_err(|_| malformed(s))?;
                if lo > hi {
                    return Err(malformed(s));
                }
                ids.extend(lo..=hi);
            } else {
                ids.insert(part.parse().map_err(|_| malformed(s))?);
            }
        }
        Ok(Self { ids })
    }
}

fn malformed(s: &str) -> Error {
    Error::Protocol(format!("malformed idset \"{s}\""))
}

impl Serialize for IdSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IdSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
