use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::idset::IdSet;
use crate::topology::Topology;

use super::hello::Update;

/// One element of a child's hello stream.
#[derive(Debug, Clone)]
pub struct Frame {
    pub kind: String,
    pub idset: IdSet,
    pub data: serde_json::Value,
}

/// Route handle for responses to a connected child.
pub type FrameSink = mpsc::UnboundedSender<Frame>;

/// Connection state for one immediate child of this rank.
pub struct Peer {
    pub rank: u32,
    /// All ranks reachable through this child.
    pub subtree: IdSet,
    sink: Option<FrameSink>,
    pending: VecDeque<Arc<Update>>,
    epoch: u64,
}

impl Peer {
    fn new(rank: u32, subtree: IdSet) -> Self {
        Self {
            rank,
            subtree,
            sink: None,
            pending: VecDeque::new(),
            epoch: 0,
        }
    }

    pub fn connected(&self) -> bool {
        self.sink.is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send one update restricted to this child's subtree. A failed send
    /// means the stream went away; the peer drops to disconnected.
    fn respond(&mut self, update: &Arc<Update>) -> bool {
        let frame = Frame {
            kind: update.kind.clone(),
            idset: update.idset.intersection(&self.subtree),
            data: update.data.clone(),
        };
        match &self.sink {
            Some(sink) if sink.send(frame).is_ok() => true,
            _ => {
                self.sink = None;
                false
            }
        }
    }

    /// Replay queued updates in arrival order. Stops at the first failed
    /// send so nothing is lost if the stream drops again mid-replay.
    fn process_pending(&mut self) {
        while self.connected() {
            let Some(update) = self.pending.front().cloned() else {
                break;
            };
            if !self.respond(&update) {
                break;
            }
            self.pending.pop_front();
        }
    }
}

/// All immediate children of a rank, built once from the topology.
pub struct PeerTable {
    children: Vec<Peer>,
    idset: IdSet,
}

impl PeerTable {
    /// `topology` is the subtree rooted at the owning rank.
    pub fn new(topology: &Topology) -> Self {
        let mut children = Vec::with_capacity(topology.children.len());
        let mut idset = IdSet::new();
        for child in &topology.children {
            let subtree = child.subtree_ranks();
            idset.extend_from(&subtree);
            children.push(Peer::new(child.rank, subtree));
        }
        Self { children, idset }
    }

    /// Union of all child subtrees: the owning rank's subtree minus itself.
    pub fn idset(&self) -> &IdSet {
        &self.idset
    }

    pub fn get(&self, rank: u32) -> Option<&Peer> {
        self.children.iter().find(|peer| peer.rank == rank)
    }

    /// Attach a child's hello stream and replay anything queued while it
    /// was away. Returns the connection epoch used to guard stale
    /// disconnect notifications.
    pub fn connect(&mut self, rank: u32, sink: FrameSink) -> Result<u64> {
        let peer = self
            .children
            .iter_mut()
            .find(|peer| peer.rank == rank)
            .ok_or(Error::UnknownPeer(rank))?;
        peer.epoch += 1;
        peer.sink = Some(sink);
        peer.process_pending();
        Ok(peer.epoch)
    }

    /// Drop a child's stream, unless it already reconnected under a newer
    /// epoch.
    pub fn disconnect(&mut self, rank: u32, epoch: u64) {
        if let Some(peer) = self.children.iter_mut().find(|peer| peer.rank == rank) {
            if peer.epoch == epoch && peer.sink.take().is_some() {
                tracing::debug!(rank, "peer disconnected");
            }
        }
    }

    /// Fan an update out to every child whose subtree intersects its
    /// target set. Disconnected children queue a shared reference for
    /// replay on reconnect.
    pub fn forward(&mut self, update: &Arc<Update>) {
        for peer in &mut self.children {
            if !peer.subtree.intersects(&update.idset) {
                continue;
            }
            if !peer.connected() || !peer.respond(update) {
                peer.pending.push_back(Arc::clone(update));
            }
        }
    }
}
