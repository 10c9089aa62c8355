//! Per-rank execution engine.
//!
//! Every rank of the overlay runs one [`Engine`], a single task owning all
//! mutable state: the peer table, the hello responder, the job table, and
//! the handler registry. Events arrive on one channel and run to
//! completion before the next, so there is no locking within a rank.
//! Anything that must wait (an upstream barrier-enter, the coalescing
//! timer, shell IO) is a spawned task that posts a continuation event back
//! into the channel.

mod barrier;
mod exec;
mod hello;
mod job;
mod peer;
mod ping;
mod router;

pub use barrier::Barrier;
pub use hello::{HelloResponder, Update};
pub use job::{ExecFrame, ExecSink, Job, JobTable};
pub use peer::{Frame, FrameSink, Peer, PeerTable};
pub use router::{ActionFn, NotifyFn, Router};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::idset::IdSet;
use crate::shell::{ShellEvent, ShellSink, Spawner};
use crate::uplink::Uplink;

/// An upstream notify envelope as received from a descendant.
///
/// `reply` is the route handle back to the sender. Most handlers leave it
/// in place and the dispatcher answers with the handler's result; the
/// barrier handler takes it and answers at completion.
pub struct Notice {
    pub kind: String,
    pub data: Value,
    pub reply: Option<oneshot::Sender<Result<()>>>,
}

/// Events driving a rank's engine.
pub enum Event {
    /// Client `exec.start` request.
    Start {
        id: u64,
        userid: u32,
        ranks: String,
        sink: ExecSink,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Client `exec.kill` request.
    Kill {
        id: u64,
        ranks: String,
        signum: i32,
        ack: oneshot::Sender<Result<()>>,
    },
    /// Client `ping` request.
    Ping {
        ranks: String,
        data: Value,
        reply: oneshot::Sender<Result<IdSet>>,
    },
    /// A child attached its hello stream.
    Hello {
        rank: u32,
        sink: FrameSink,
        ack: oneshot::Sender<Result<()>>,
    },
    /// A child's hello stream went away.
    Disconnect { rank: u32, epoch: u64 },
    /// Typed payload from a descendant.
    Notify(Notice),
    /// Frame received from the parent's hello stream.
    Downstream(Frame),
    /// Local shell lifecycle event.
    Shell { id: u64, event: ShellEvent },
    /// The hello coalescing timer fired.
    Flush,
    /// Continuation of an upstream barrier-enter.
    BarrierSettled { id: u64, result: Result<()> },
    /// The client dropped its start stream.
    ClientGone { id: u64 },
}

/// Cloneable handle used by services, uplinks, and tests to talk to an
/// engine.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Event>,
}

impl EngineHandle {
    /// Start a job; the returned stream carries `start`, `exception`, and
    /// `finish` frames and ends after `finish`.
    pub async fn start(
        &self,
        id: u64,
        userid: u32,
        ranks: &str,
    ) -> Result<mpsc::UnboundedReceiver<ExecFrame>> {
        let (sink, stream) = mpsc::unbounded_channel();
        let (ack, rx) = oneshot::channel();
        self.send(Event::Start {
            id,
            userid,
            ranks: ranks.to_string(),
            sink,
            ack,
        })
        .await?;
        rx.await.map_err(|_| Error::Unavailable)??;
        Ok(stream)
    }

    pub async fn kill(&self, id: u64, ranks: &str, signum: i32) -> Result<()> {
        let (ack, rx) = oneshot::channel();
        self.send(Event::Kill {
            id,
            ranks: ranks.to_string(),
            signum,
            ack,
        })
        .await?;
        rx.await.map_err(|_| Error::Unavailable)?
    }

    /// Ping the addressed ranks; resolves once every one of them replied.
    pub async fn ping(&self, ranks: &str, data: Value) -> Result<IdSet> {
        let (reply, rx) = oneshot::channel();
        self.send(Event::Ping {
            ranks: ranks.to_string(),
            data,
            reply,
        })
        .await?;
        rx.await.map_err(|_| Error::Unavailable)?
    }

    /// Attach a child's hello stream.
    pub async fn hello(&self, rank: u32) -> Result<mpsc::UnboundedReceiver<Frame>> {
        let (sink, stream) = mpsc::unbounded_channel();
        let (ack, rx) = oneshot::channel();
        self.send(Event::Hello { rank, sink, ack }).await?;
        rx.await.map_err(|_| Error::Unavailable)??;
        Ok(stream)
    }

    /// Deliver an upstream notify envelope.
    pub async fn notify(&self, notice: Notice) -> Result<()> {
        self.send(Event::Notify(notice)).await
    }

    /// Deliver an upstream notify and wait for the engine's verdict.
    pub async fn notify_wait(&self, kind: &str, data: Value) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Notify(Notice {
            kind: kind.to_string(),
            data,
            reply: Some(tx),
        }))
        .await?;
        rx.await.map_err(|_| Error::Unavailable)?
    }

    /// Deliver a frame received from the parent.
    pub async fn downstream(&self, frame: Frame) -> Result<()> {
        self.send(Event::Downstream(frame)).await
    }

    async fn send(&self, event: Event) -> Result<()> {
        self.tx.send(event).await.map_err(|_| Error::Unavailable)
    }
}

/// Per-rank execution context.
pub struct Engine {
    pub(crate) rank: u32,
    /// This rank plus all descendants.
    pub(crate) subtree: IdSet,
    pub(crate) peers: PeerTable,
    pub(crate) responder: HelloResponder,
    pub(crate) router: Router,
    pub(crate) jobs: JobTable,
    pub(crate) ping: ping::Ping,
    pub(crate) uplink: Option<Arc<dyn Uplink>>,
    pub(crate) spawner: Arc<dyn Spawner>,
    pub(crate) shell_path: PathBuf,
    flush_interval: Duration,
    pub(crate) events: mpsc::Sender<Event>,
    pub(crate) shells: ShellSink,
}

impl Engine {
    /// Build an engine for `config.rank`. Registers the exec and ping
    /// services and wires the shell event pump; the caller drives the
    /// returned receiver through [`Engine::run`].
    pub fn new(
        config: &NodeConfig,
        spawner: Arc<dyn Spawner>,
        uplink: Option<Arc<dyn Uplink>>,
    ) -> Result<(Self, EngineHandle, mpsc::Receiver<Event>)> {
        let subtree_topology = config.topology.find(config.rank).ok_or_else(|| {
            Error::Protocol(format!("rank {} not present in topology", config.rank))
        })?;
        let subtree = subtree_topology.subtree_ranks();
        let peers = PeerTable::new(subtree_topology);

        let (events_tx, events_rx) = mpsc::channel(256);
        let (shells_tx, mut shells_rx) = mpsc::unbounded_channel();
        {
            // Shell events re-enter the engine through the main channel so
            // they serialize with everything else.
            let events = events_tx.clone();
            tokio::spawn(async move {
                while let Some((id, event)) = shells_rx.recv().await {
                    if events.send(Event::Shell { id, event }).await.is_err() {
                        break;
                    }
                }
            });
        }

        let mut router = Router::new();
        exec::register(&mut router)?;
        ping::register(&mut router)?;

        let engine = Engine {
            rank: config.rank,
            subtree,
            peers,
            responder: HelloResponder::new(),
            router,
            jobs: JobTable::new(),
            ping: ping::Ping::new(),
            uplink,
            spawner,
            shell_path: config.shell_path.clone(),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
            events: events_tx.clone(),
            shells: shells_tx,
        };
        let handle = EngineHandle { tx: events_tx };
        Ok((engine, handle, events_rx))
    }

    /// Drive the engine until shutdown or until every handle is dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>, shutdown: CancellationToken) {
        tracing::info!(rank = self.rank, subtree = %self.subtree, "engine running");
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.dispatch(event),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        self.drain();
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Start {
                id,
                userid,
                ranks,
                sink,
                ack,
            } => {
                let result = exec::client_start(self, id, userid, &ranks, sink);
                let _ = ack.send(result);
            }
            Event::Kill {
                id,
                ranks,
                signum,
                ack,
            } => {
                let _ = ack.send(exec::client_kill(self, id, &ranks, signum));
            }
            Event::Ping { ranks, data, reply } => ping::client_ping(self, &ranks, data, reply),
            Event::Hello { rank, sink, ack } => {
                let _ = ack.send(self.child_hello(rank, sink));
            }
            Event::Disconnect { rank, epoch } => self.peers.disconnect(rank, epoch),
            Event::Notify(notice) => self.on_notify(notice),
            Event::Downstream(frame) => self.on_downstream(frame),
            Event::Shell { id, event } => exec::shell_event(self, id, event),
            Event::Flush => self.flush_updates(),
            Event::BarrierSettled { id, result } => exec::barrier_settled(self, id, result),
            Event::ClientGone { id } => exec::client_gone(self, id),
        }
    }

    /// Fan a typed payload out toward the target ranks.
    ///
    /// On rank 0 the registered action also runs locally, so the root can
    /// address itself and its descendants with one call; internal ranks
    /// already dispatched the type when it arrived from their own parent.
    pub(crate) fn forward(&mut self, kind: &str, ranks: &IdSet, data: Value) -> Result<()> {
        let update = Update::new(kind, ranks.clone(), data);
        self.peers.forward(&update);
        if self.rank == 0 {
            if let Some(action) = self.router.action(kind) {
                action(self, &update.idset, &update.data)?;
            }
        }
        Ok(())
    }

    /// Frame from the parent: forward it further downstream, then run the
    /// local action.
    fn on_downstream(&mut self, frame: Frame) {
        if let Err(err) = self.forward(&frame.kind, &frame.idset, frame.data.clone()) {
            tracing::error!(kind = %frame.kind, error = %err, "downstream forward failed");
            return;
        }
        match self.router.action(&frame.kind) {
            Some(action) => {
                if let Err(err) = action(self, &frame.idset, &frame.data) {
                    tracing::error!(kind = %frame.kind, error = %err, "action failed");
                }
            }
            None => tracing::error!(kind = %frame.kind, "no handler for hello frame, ignoring"),
        }
    }

    fn on_notify(&mut self, mut notice: Notice) {
        let result = match self.router.notify(&notice.kind) {
            Some(handler) => handler(self, &mut notice),
            None => {
                tracing::error!(kind = %notice.kind, "no handler for notify, ignoring");
                Err(Error::Protocol(format!(
                    "unknown notify type \"{}\"",
                    notice.kind
                )))
            }
        };
        if let Err(err) = &result {
            tracing::debug!(kind = %notice.kind, error = %err, "notify failed");
        }
        if let Some(reply) = notice.reply.take() {
            let _ = reply.send(result);
        }
    }

    fn child_hello(&mut self, rank: u32, sink: FrameSink) -> Result<()> {
        let watcher = sink.clone();
        let epoch = self.peers.connect(rank, sink)?;
        if let Some(peer) = self.peers.get(rank) {
            tracing::debug!(rank, subtree = %peer.subtree, "connection from peer");
        }
        let events = self.events.clone();
        tokio::spawn(async move {
            watcher.closed().await;
            let _ = events.send(Event::Disconnect { rank, epoch }).await;
        });
        Ok(())
    }

    /// Arm the coalescing timer for the responder's first queued record.
    pub(crate) fn schedule_flush(&self) {
        let events = self.events.clone();
        let delay = self.flush_interval;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(Event::Flush).await;
        });
    }

    fn flush_updates(&mut self) {
        let count = self.responder.len();
        if let Some(update) = self.responder.pop() {
            tracing::debug!(count, ranks = %update.idset, "flushing state updates");
            self.peers.forward(&update);
        }
    }

    /// Fire-and-forget notify toward the parent.
    pub(crate) fn notify_upstream(&self, kind: &'static str, data: Value) {
        match &self.uplink {
            Some(uplink) => {
                let uplink = Arc::clone(uplink);
                tokio::spawn(async move {
                    if let Err(err) = uplink.notify(kind, data).await {
                        tracing::warn!(kind, error = %err, "upstream notify failed");
                    }
                });
            }
            None => tracing::warn!(kind, "no upstream for notify"),
        }
    }

    fn drain(&mut self) {
        tracing::info!(rank = self.rank, "engine draining");
        for shell in self.jobs.shells() {
            shell.signal(libc::SIGTERM);
        }
    }
}

/// Decode a typed payload out of an opaque data document.
pub(crate) fn payload<T: serde::de::DeserializeOwned>(data: &Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|err| Error::Protocol(err.to_string()))
}
