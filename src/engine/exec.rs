//! Distributed job execution service.
//!
//! Drives the per-job state machine on each rank: applies `state-update`
//! batches, spawns the local job shell, aggregates start/finish/barrier
//! events from the subtree, and converges them toward the root.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::idset::IdSet;
use crate::shell::{spawn_failure_status, ShellEvent, ShellSpec};

use super::hello::JobRecord;
use super::job::{ExecSink, Job};
use super::{Engine, Event, Notice, Router};

#[derive(Debug, Deserialize)]
struct StateUpdate {
    jobs: Vec<JobRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StartPayload {
    id: u64,
    ranks: IdSet,
}

#[derive(Debug, Serialize, Deserialize)]
struct FinishPayload {
    id: u64,
    ranks: IdSet,
    status: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct BarrierPayload {
    id: u64,
    ranks: IdSet,
    seq: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct KillPayload {
    id: u64,
    signal: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct ExceptionPayload {
    id: u64,
    severity: i32,
    #[serde(rename = "type")]
    kind: String,
    note: String,
}

pub(crate) fn register(router: &mut Router) -> Result<()> {
    router.register_action("state-update", state_update)?;
    router.register_action("kill", kill_action)?;
    router.register_notify("start", started)?;
    router.register_notify("barrier-enter", barrier_enter)?;
    router.register_notify("finish", finished)?;
    router.register_notify("release", released)?;
    router.register_notify("exception", exception)?;
    Ok(())
}

/// Client `exec.start`: create the job here, attach the request envelope,
/// and let the batched state-update carry it to the rest of the tree.
pub(crate) fn client_start(
    engine: &mut Engine,
    id: u64,
    userid: u32,
    ranks: &str,
    sink: ExecSink,
) -> Result<()> {
    let ranks: IdSet = ranks.parse()?;
    if ranks.is_empty() {
        return Err(Error::Protocol("empty job rank set".to_string()));
    }
    if !ranks.is_subset(&engine.subtree) {
        return Err(Error::UnreachableRanks(ranks.difference(&engine.subtree)));
    }
    if engine.jobs.contains(id) {
        return Err(Error::JobExists(id));
    }
    tracing::debug!(id, ranks = %ranks, "start request");

    // Unless the job targets only this rank, queue an add record for the
    // coalesced downstream fan-out.
    if ranks.len() > 1 || ranks.first() != Some(engine.rank) {
        engine.responder.push("add", id, userid, &ranks);
        if engine.responder.len() == 1 {
            engine.schedule_flush();
        }
    }

    let watcher = sink.clone();
    add_job(engine, id, userid, ranks, Some(sink))?;

    // A client that walks away cancels the job.
    let events = engine.events.clone();
    let watch = tokio::spawn(async move {
        watcher.closed().await;
        let _ = events.send(Event::ClientGone { id }).await;
    });
    if let Some(job) = engine.jobs.get_mut(id) {
        if job.request.is_some() {
            job.cancel_watch = Some(watch.abort_handle());
        } else {
            // already answered (e.g. the local spawn failed)
            watch.abort();
        }
    }
    Ok(())
}

/// The client dropped its start stream before the job finished: end the
/// request and terminate the job.
pub(crate) fn client_gone(engine: &mut Engine, id: u64) {
    let Some(job) = engine.jobs.get_mut(id) else {
        return;
    };
    if job.request.take().is_none() {
        return;
    }
    job.cancel_watch = None;
    tracing::warn!(id, "client went away, terminating job");
    let ranks = job.ranks.clone();
    if let Err(err) = engine.forward(
        "kill",
        &ranks,
        json!({ "id": id, "signal": libc::SIGTERM }),
    ) {
        tracing::error!(id, error = %err, "cancel kill fanout failed");
    }
}

/// Client `exec.kill`: fan a kill action out at the addressed ranks.
pub(crate) fn client_kill(engine: &mut Engine, id: u64, ranks: &str, signum: i32) -> Result<()> {
    let ranks: IdSet = ranks.parse()?;
    tracing::debug!(id, ranks = %ranks, signum, "kill request");
    engine.forward("kill", &ranks, json!({ "id": id, "signal": signum }))
}

/// Downstream `state-update` action: apply each record.
fn state_update(engine: &mut Engine, _idset: &IdSet, data: &Value) -> Result<()> {
    let update: StateUpdate = super::payload(data)?;
    for record in update.jobs {
        if record.kind != "add" {
            tracing::warn!(id = record.id, kind = %record.kind, "unknown state-update record, ignoring");
            continue;
        }
        // Adds are idempotent: a replayed batch must not fail the rest.
        match add_job(engine, record.id, record.userid, record.ranks, None) {
            Ok(()) => {}
            Err(Error::JobExists(id)) => tracing::debug!(id, "duplicate add ignored"),
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Downstream `kill` action: deliver the signal to the local shell when
/// this rank is addressed.
fn kill_action(engine: &mut Engine, idset: &IdSet, data: &Value) -> Result<()> {
    let payload: KillPayload = super::payload(data)?;
    if !idset.contains(engine.rank) {
        return Ok(());
    }
    tracing::debug!(id = payload.id, signal = payload.signal, "kill");
    let job = engine.jobs.lookup_mut(payload.id)?;
    if let Some(shell) = &job.shell {
        shell.signal(payload.signal);
    }
    Ok(())
}

/// Create the local job record and spawn the shell if this rank is a
/// target. `request` is the client envelope on the originating rank.
fn add_job(
    engine: &mut Engine,
    id: u64,
    userid: u32,
    ranks: IdSet,
    request: Option<ExecSink>,
) -> Result<()> {
    if engine.jobs.contains(id) {
        return Err(Error::JobExists(id));
    }
    let subtree_ranks = ranks.intersection(&engine.subtree);
    let local = ranks.contains(engine.rank);
    let mut job = Job::new(id, userid, ranks, subtree_ranks);
    job.request = request;
    engine.jobs.insert(job)?;
    tracing::debug!(id, rank = engine.rank, "job added");
    if local {
        spawn_shell(engine, id);
    }
    Ok(())
}

fn spawn_shell(engine: &mut Engine, id: u64) {
    let spec = {
        let Some(job) = engine.jobs.get(id) else {
            return;
        };
        ShellSpec {
            id,
            userid: job.userid,
            rank: engine.rank,
            shell_path: engine.shell_path.clone(),
            namespace: format!("job-{id}"),
            barrier: job.ranks.len() > 1,
        }
    };
    tracing::debug!(id, "starting job shell");
    match engine.spawner.spawn(&spec, engine.shells.clone()) {
        Ok(handle) => {
            if let Some(job) = engine.jobs.get_mut(id) {
                job.shell = Some(handle);
            }
        }
        Err(err) => {
            tracing::error!(id, error = %err, "job shell spawn failed");
            let status = spawn_failure_status(&err);
            let rank = engine.rank;
            if let Some(job) = engine.jobs.get_mut(id) {
                if status > job.status {
                    job.status = status;
                }
                job.finish_ranks.insert(rank);
            }
            check_finish(engine, id);
        }
    }
}

/// Local shell lifecycle events.
pub(crate) fn shell_event(engine: &mut Engine, id: u64, event: ShellEvent) {
    let rank = engine.rank;
    match event {
        ShellEvent::Running => {
            let Some(job) = engine.jobs.get_mut(id) else {
                return;
            };
            tracing::debug!(id, "job shell running");
            job.start_ranks.insert(rank);
            check_start(engine, id);
        }
        ShellEvent::BarrierEnter => {
            let Some(job) = engine.jobs.get_mut(id) else {
                return;
            };
            job.barrier.enter_local(rank);
            tracing::debug!(id, seq = job.barrier.sequence(), "local shell entered barrier");
            check_barrier(engine, id);
        }
        ShellEvent::Exited { status } => {
            let Some(job) = engine.jobs.get_mut(id) else {
                return;
            };
            tracing::debug!(id, status, "job shell exited");
            if status > job.status {
                job.status = status;
            }
            job.finish_ranks.insert(rank);
            job.shell = None;
            check_finish(engine, id);
        }
    }
}

/// Upstream `start` notify from a descendant.
fn started(engine: &mut Engine, notice: &mut Notice) -> Result<()> {
    let payload: StartPayload = super::payload(&notice.data)?;
    let job = engine.jobs.lookup_mut(payload.id)?;
    let ranks = payload.ranks.intersection(&job.subtree_ranks);
    job.start_ranks.extend_from(&ranks);
    check_start(engine, payload.id);
    Ok(())
}

/// Upstream `finish` notify from a descendant.
fn finished(engine: &mut Engine, notice: &mut Notice) -> Result<()> {
    let payload: FinishPayload = super::payload(&notice.data)?;
    tracing::debug!(id = payload.id, ranks = %payload.ranks, status = payload.status, "finish");
    let job = engine.jobs.lookup_mut(payload.id)?;
    let ranks = payload.ranks.intersection(&job.subtree_ranks);
    job.finish_ranks.extend_from(&ranks);
    if payload.status > job.status {
        job.status = payload.status;
    }
    check_finish(engine, payload.id);
    Ok(())
}

/// Upstream `barrier-enter` notify from a descendant. The envelope is
/// retained and answered when the barrier completes.
fn barrier_enter(engine: &mut Engine, notice: &mut Notice) -> Result<()> {
    let payload: BarrierPayload = super::payload(&notice.data)?;
    let job = engine.jobs.lookup_mut(payload.id)?;
    let ranks = payload.ranks.intersection(&job.subtree_ranks);
    tracing::debug!(id = payload.id, ranks = %ranks, seq = payload.seq, "barrier enter");
    job.barrier.enter(&ranks, payload.seq)?;
    if let Some(reply) = notice.reply.take() {
        job.barrier.retain(reply);
    }
    check_barrier(engine, payload.id);
    Ok(())
}

/// Upstream `release` notify. The lifecycle termination this would drive
/// is not implemented; the sender gets told so.
fn released(_engine: &mut Engine, _notice: &mut Notice) -> Result<()> {
    Err(Error::Unsupported("release"))
}

/// Upstream `exception` notify. Non-root ranks relay toward the root;
/// rank 0 answers the client and, for severity 0, kills the job.
fn exception(engine: &mut Engine, notice: &mut Notice) -> Result<()> {
    let payload: ExceptionPayload = super::payload(&notice.data)?;
    if engine.rank != 0 {
        engine.notify_upstream("exception", notice.data.clone());
        return Ok(());
    }
    handle_exception(engine, payload)
}

fn handle_exception(engine: &mut Engine, payload: ExceptionPayload) -> Result<()> {
    tracing::debug!(
        id = payload.id,
        severity = payload.severity,
        kind = %payload.kind,
        note = %payload.note,
        "exception"
    );
    let Some(job) = engine.jobs.get_mut(payload.id) else {
        tracing::error!(id = payload.id, "exception for unknown job");
        return Err(Error::JobNotFound(payload.id));
    };
    job.client_respond(
        "exception",
        json!({
            "severity": payload.severity,
            "type": payload.kind,
            "note": payload.note,
        }),
    );
    let ranks = job.ranks.clone();
    if payload.severity == 0 {
        if let Err(err) = engine.forward(
            "kill",
            &ranks,
            json!({ "id": payload.id, "signal": libc::SIGTERM }),
        ) {
            tracing::error!(id = payload.id, error = %err, "exception kill fanout failed");
        }
    }
    Ok(())
}

/// Raise a job exception from this rank.
fn raise_exception(engine: &mut Engine, id: u64, severity: i32, kind: &str, note: &str) {
    let data = json!({ "id": id, "severity": severity, "type": kind, "note": note });
    if engine.rank == 0 {
        let payload = ExceptionPayload {
            id,
            severity,
            kind: kind.to_string(),
            note: note.to_string(),
        };
        if let Err(err) = handle_exception(engine, payload) {
            tracing::error!(id, error = %err, "local exception handling failed");
        }
    } else {
        engine.notify_upstream("exception", data);
    }
}

/// Start convergence: once every subtree rank has started, answer the
/// client or report upstream.
fn check_start(engine: &mut Engine, id: u64) {
    let Some(job) = engine.jobs.get_mut(id) else {
        return;
    };
    if job.start_ranks != job.subtree_ranks {
        return;
    }
    tracing::debug!(id, ranks = %job.start_ranks, "subtree started");
    if job.request.is_some() {
        job.client_respond("start", json!({}));
        return;
    }
    let data = json!({ "id": id, "ranks": job.start_ranks });
    engine.notify_upstream("start", data);
}

/// Finish convergence, folding the max wait status upward. The client
/// stream ends after its finish frame.
fn check_finish(engine: &mut Engine, id: u64) {
    let Some(job) = engine.jobs.get_mut(id) else {
        return;
    };
    if job.finish_ranks != job.subtree_ranks {
        return;
    }
    let status = job.status;
    if job.request.is_some() {
        tracing::debug!(id, status, "job finished");
        job.client_respond("finish", json!({ "status": status }));
        job.request = None;
        if let Some(watch) = job.cancel_watch.take() {
            watch.abort();
        }
        return;
    }
    tracing::debug!(id, ranks = %job.finish_ranks, status, "subtree finished");
    let data = json!({ "id": id, "ranks": job.finish_ranks, "status": status });
    engine.notify_upstream("finish", data);
}

/// Barrier convergence: when the whole subtree has entered, complete at
/// the LCA or enter upstream and complete on the reply.
fn check_barrier(engine: &mut Engine, id: u64) {
    let events = engine.events.clone();
    let uplink = engine.uplink.clone();
    let Some(job) = engine.jobs.get_mut(id) else {
        return;
    };
    if *job.barrier.ranks() != job.subtree_ranks {
        return;
    }
    if job.is_lca() {
        tracing::debug!(id, seq = job.barrier.sequence(), "barrier complete at LCA");
        complete_barrier(engine, id, Ok(()));
        return;
    }
    let seq = job.barrier.sequence();
    let ranks = job.barrier.ranks().clone();
    tracing::debug!(id, seq, "barrier full in subtree, entering upstream");
    let Some(uplink) = uplink else {
        tracing::error!(id, "no upstream for barrier-enter");
        return;
    };
    let data = json!({ "id": id, "ranks": ranks, "seq": seq });
    tokio::spawn(async move {
        let result = uplink.notify_wait("barrier-enter", data).await;
        let _ = events.send(Event::BarrierSettled { id, result }).await;
    });
}

/// Continuation of an upstream barrier-enter.
pub(crate) fn barrier_settled(engine: &mut Engine, id: u64, result: Result<()>) {
    if let Err(err) = &result {
        tracing::error!(id, error = %err, "barrier failed upstream");
        raise_exception(engine, id, 0, "exec", &format!("barrier failure: {err}"));
    }
    complete_barrier(engine, id, result);
}

/// Answer queued subtree envelopes, release the local shell on success,
/// and advance the sequence.
fn complete_barrier(engine: &mut Engine, id: u64, result: Result<()>) {
    let Some(job) = engine.jobs.get_mut(id) else {
        return;
    };
    tracing::debug!(id, seq = job.barrier.sequence(), ok = result.is_ok(), "barrier complete");
    job.barrier.complete(&result);
    if result.is_ok() {
        if let Some(shell) = &job.shell {
            shell.release();
        }
    }
}
