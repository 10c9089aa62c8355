//! Reachability sweep over the hierarchical fabric.
//!
//! A ping fans out to a target rank set like any other action; each rank
//! records itself when addressed, aggregates `ping-reply` idsets from its
//! children, and reports upstream once its expected set is complete. The
//! root answers the client with the full reply set.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::idset::IdSet;

use super::{Engine, Notice, Router};

#[derive(Debug, Serialize, Deserialize)]
struct ReplyPayload {
    ranks: IdSet,
}

/// Per-rank ping state. One sweep may be in flight at a time.
#[derive(Default)]
pub(crate) struct Ping {
    /// Client reply envelope; present on the rank that took the request.
    request: Option<oneshot::Sender<Result<IdSet>>>,
    /// Ranks this sweep expects to hear from, while one is in flight.
    targets: Option<IdSet>,
    replies: IdSet,
}

impl Ping {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> bool {
        self.request.is_some() || self.targets.is_some()
    }
}

pub(crate) fn register(router: &mut Router) -> Result<()> {
    router.register_action("ping", action)?;
    router.register_notify("ping-reply", reply)?;
    Ok(())
}

/// Client `ping` request: validate the target set, then fan out.
pub(crate) fn client_ping(
    engine: &mut Engine,
    ranks: &str,
    data: Value,
    reply: oneshot::Sender<Result<IdSet>>,
) {
    let targets = match ranks.parse::<IdSet>() {
        Ok(targets) if !targets.is_empty() => targets,
        Ok(_) => {
            let _ = reply.send(Err(Error::Protocol("empty ping rank set".to_string())));
            return;
        }
        Err(err) => {
            let _ = reply.send(Err(err));
            return;
        }
    };
    if engine.ping.active() {
        let _ = reply.send(Err(Error::Busy("ping")));
        return;
    }
    if !targets.is_subset(&engine.subtree) {
        let unreachable = targets.difference(&engine.subtree);
        let _ = reply.send(Err(Error::UnreachableRanks(unreachable)));
        return;
    }

    tracing::debug!(ranks = %targets, "starting ping");
    engine.ping.request = Some(reply);
    if let Err(err) = engine.forward("ping", &targets, data) {
        tracing::error!(error = %err, "ping forward failed");
        if let Some(reply) = engine.ping.request.take() {
            let _ = reply.send(Err(err));
        }
        engine.ping.targets = None;
        engine.ping.replies.clear();
    }
}

/// Downstream `ping` action: begin this rank's share of the sweep.
fn action(engine: &mut Engine, idset: &IdSet, _data: &Value) -> Result<()> {
    tracing::debug!(ranks = %idset, "ping");
    engine.ping.targets = Some(idset.clone());
    engine.ping.replies.clear();
    if idset.contains(engine.rank) {
        engine.ping.replies.insert(engine.rank);
    }
    try_response(engine);
    Ok(())
}

/// Upstream `ping-reply` notify: fold a child's replies in.
fn reply(engine: &mut Engine, notice: &mut Notice) -> Result<()> {
    let payload: ReplyPayload = super::payload(&notice.data)?;
    if engine.ping.targets.is_none() {
        tracing::debug!(ranks = %payload.ranks, "ping-reply with no sweep in flight, ignoring");
        return Ok(());
    }
    engine.ping.replies.extend_from(&payload.ranks);
    tracing::debug!(ranks = %payload.ranks, total = %engine.ping.replies, "ping-reply");
    try_response(engine);
    Ok(())
}

/// Once every expected rank has replied, answer the client or report
/// upstream.
fn try_response(engine: &mut Engine) {
    let done = matches!(&engine.ping.targets, Some(targets) if *targets == engine.ping.replies);
    if !done {
        return;
    }
    let replies = std::mem::take(&mut engine.ping.replies);
    engine.ping.targets = None;
    if let Some(reply) = engine.ping.request.take() {
        tracing::debug!(ranks = %replies, "ping complete");
        let _ = reply.send(Ok(replies));
    } else {
        tracing::debug!(ranks = %replies, "ping subtree complete, notifying upstream");
        let data = serde_json::json!({ "ranks": replies });
        engine.notify_upstream("ping-reply", data);
    }
}
