use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{Error, Result};
use crate::idset::IdSet;
use crate::shell::ShellHandle;

use super::barrier::Barrier;

/// One frame streamed back to the client that started a job.
#[derive(Debug, Clone)]
pub struct ExecFrame {
    pub id: u64,
    pub kind: String,
    pub data: Value,
}

/// Route handle for responses to the originating client request.
pub type ExecSink = mpsc::UnboundedSender<ExecFrame>;

/// Distributed job record as seen from one rank.
pub struct Job {
    pub id: u64,
    pub userid: u32,
    /// Every rank the job runs on, cluster-wide.
    pub ranks: IdSet,
    /// The part of `ranks` this rank is responsible for.
    pub subtree_ranks: IdSet,
    pub start_ranks: IdSet,
    pub finish_ranks: IdSet,
    pub release_ranks: IdSet,
    pub barrier: Barrier,
    /// Highest wait status observed within `subtree_ranks`.
    pub status: i32,
    pub shell: Option<ShellHandle>,
    /// Originating client request envelope; present on the root only.
    pub request: Option<ExecSink>,
    /// Watcher task noticing a client that walked away; aborted once the
    /// request is answered, so the client stream can end.
    pub cancel_watch: Option<tokio::task::AbortHandle>,
    pub created_at: DateTime<Utc>,
}

impl Job {
    pub fn new(id: u64, userid: u32, ranks: IdSet, subtree_ranks: IdSet) -> Self {
        Self {
            id,
            userid,
            ranks,
            subtree_ranks,
            start_ranks: IdSet::new(),
            finish_ranks: IdSet::new(),
            release_ranks: IdSet::new(),
            barrier: Barrier::new(),
            status: 0,
            shell: None,
            request: None,
            cancel_watch: None,
            created_at: Utc::now(),
        }
    }

    /// True when this rank's subtree covers the whole job, i.e. this rank
    /// is the lowest common ancestor of the job's rank set.
    pub fn is_lca(&self) -> bool {
        self.subtree_ranks == self.ranks
    }

    /// Stream a frame to the originating client, if this rank holds the
    /// request.
    pub fn client_respond(&self, kind: &str, data: Value) {
        if let Some(request) = &self.request {
            let _ = request.send(ExecFrame {
                id: self.id,
                kind: kind.to_string(),
                data,
            });
        }
    }
}

/// All jobs known to a rank, keyed by id.
#[derive(Default)]
pub struct JobTable {
    jobs: HashMap<u64, Job>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, job: Job) -> Result<()> {
        if self.jobs.contains_key(&job.id) {
            return Err(Error::JobExists(job.id));
        }
        self.jobs.insert(job.id, job);
        Ok(())
    }

    pub fn contains(&self, id: u64) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn get(&self, id: u64) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn lookup_mut(&mut self, id: u64) -> Result<&mut Job> {
        self.jobs.get_mut(&id).ok_or(Error::JobNotFound(id))
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Handles of every locally running shell.
    pub fn shells(&self) -> impl Iterator<Item = &ShellHandle> {
        self.jobs.values().filter_map(|job| job.shell.as_ref())
    }
}
