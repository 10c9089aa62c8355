use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::idset::IdSet;

/// A type-tagged payload fanned out downstream over hello channels.
///
/// One update may sit in several children's pending queues at once, so it
/// is shared by reference and never mutated after construction.
#[derive(Debug)]
pub struct Update {
    pub kind: String,
    pub idset: IdSet,
    pub data: Value,
}

impl Update {
    pub fn new(kind: &str, idset: IdSet, data: Value) -> Arc<Self> {
        Arc::new(Self {
            kind: kind.to_string(),
            idset,
            data,
        })
    }
}

/// One record inside a batched state-update payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JobRecord {
    pub id: u64,
    pub userid: u32,
    #[serde(rename = "type")]
    pub kind: String,
    pub ranks: IdSet,
}

/// Accumulates per-rank job additions and emits them as one batched
/// `state-update`. A short coalescing timer pops the accumulator, so a
/// burst of additions costs a single fan-out.
#[derive(Debug, Default)]
pub struct HelloResponder {
    jobs: Vec<JobRecord>,
    ranks: IdSet,
}

impl HelloResponder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, kind: &str, id: u64, userid: u32, ranks: &IdSet) {
        self.jobs.push(JobRecord {
            id,
            userid,
            kind: kind.to_string(),
            ranks: ranks.clone(),
        });
        self.ranks.extend_from(ranks);
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Emit the batch accumulated so far and reset.
    pub fn pop(&mut self) -> Option<Arc<Update>> {
        if self.jobs.is_empty() {
            return None;
        }
        let jobs = std::mem::take(&mut self.jobs);
        let ranks = std::mem::take(&mut self.ranks);
        Some(Update::new("state-update", ranks, json!({ "jobs": jobs })))
    }
}
