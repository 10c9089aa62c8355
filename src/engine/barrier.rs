use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::idset::IdSet;

/// Envelope retained for a downstream barrier-enter awaiting completion.
pub type ReplySender = oneshot::Sender<Result<()>>;

/// Distributed barrier state for one job on one rank.
///
/// Barriers are sequenced: the sequence starts at 0 and advances on every
/// completion, so a late `barrier-enter` for an already-completed cycle is
/// rejected instead of corrupting the next one.
#[derive(Default)]
pub struct Barrier {
    sequence: u64,
    ranks: IdSet,
    pending: Vec<ReplySender>,
}

impl Barrier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Subtree ranks that have entered the current cycle.
    pub fn ranks(&self) -> &IdSet {
        &self.ranks
    }

    /// Record subtree ranks entering via a downstream notify.
    pub fn enter(&mut self, ranks: &IdSet, sequence: u64) -> Result<()> {
        if sequence != self.sequence {
            return Err(Error::BarrierMismatch {
                got: sequence,
                expected: self.sequence,
            });
        }
        self.ranks.extend_from(ranks);
        Ok(())
    }

    /// Record the local shell entering.
    pub fn enter_local(&mut self, rank: u32) {
        self.ranks.insert(rank);
    }

    /// Retain a downstream envelope to answer at completion.
    pub fn retain(&mut self, reply: ReplySender) {
        self.pending.push(reply);
    }

    /// Answer every retained envelope with `result` and advance to the
    /// next cycle.
    pub fn complete(&mut self, result: &Result<()>) {
        for reply in self.pending.drain(..) {
            let _ = reply.send(result.clone());
        }
        self.sequence += 1;
        self.ranks.clear();
    }
}
