use serde::Deserialize;

use crate::error::{Error, Result};
use crate::idset::IdSet;

/// Static tree overlay: a rank with an ordered list of child subtrees.
///
/// Every rank is reachable along exactly one path from the root. The tree
/// is fixed for the lifetime of an instance; each rank loads the full
/// topology and locates its own subtree once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    pub rank: u32,
    #[serde(default)]
    pub children: Vec<Topology>,
}

impl Topology {
    /// A one-rank overlay.
    pub fn single(rank: u32) -> Self {
        Self {
            rank,
            children: Vec::new(),
        }
    }

    /// Rank 0 with ranks `1..size` as direct children.
    pub fn flat(size: u32) -> Self {
        Self {
            rank: 0,
            children: (1..size).map(Topology::single).collect(),
        }
    }

    /// Parse a topology document, e.g. `{"rank":0,"children":[{"rank":1}]}`.
    pub fn from_json(s: &str) -> Result<Self> {
        let topology: Topology = serde_json::from_str(s)
            .map_err(|err| Error::Protocol(format!("malformed topology: {err}")))?;
        topology.validate()?;
        Ok(topology)
    }

    /// The subtree rooted at `rank`, if present.
    pub fn find(&self, rank: u32) -> Option<&Topology> {
        if self.rank == rank {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(rank))
    }

    /// All ranks in this subtree, including this node.
    pub fn subtree_ranks(&self) -> IdSet {
        let mut ids = IdSet::single(self.rank);
        for child in &self.children {
            ids.extend_from(&child.subtree_ranks());
        }
        ids
    }

    fn validate(&self) -> Result<()> {
        let mut seen = IdSet::new();
        self.check_unique(&mut seen)
    }

    fn check_unique(&self, seen: &mut IdSet) -> Result<()> {
        if !seen.insert(self.rank) {
            return Err(Error::Protocol(format!(
                "rank {} appears twice in topology",
                self.rank
            )));
        }
        for child in &self.children {
            child.check_unique(seen)?;
        }
        Ok(())
    }
}
