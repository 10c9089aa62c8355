//! Parent-link contract.
//!
//! A non-root rank talks to its parent through an [`Uplink`]: attach the
//! hello stream, send upstream notifies, and (for barrier-enter) wait for
//! the parent's verdict. [`crate::grpc::GrpcUplink`] implements it over
//! the Overlay service; [`LocalUplink`] wires two engines together in one
//! process for tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::engine::{EngineHandle, Frame, Notice};
use crate::error::Result;

#[tonic::async_trait]
pub trait Uplink: Send + Sync {
    /// Attach to the parent and receive its stream of hello frames.
    async fn hello(&self, rank: u32) -> Result<mpsc::UnboundedReceiver<Frame>>;

    /// Send a typed payload upstream without waiting for a verdict.
    async fn notify(&self, kind: &str, data: Value) -> Result<()>;

    /// Send a typed payload upstream and wait for the parent's verdict.
    async fn notify_wait(&self, kind: &str, data: Value) -> Result<()>;
}

/// Uplink wired directly to a parent engine in the same process.
pub struct LocalUplink {
    parent: EngineHandle,
}

impl LocalUplink {
    pub fn new(parent: EngineHandle) -> Self {
        Self { parent }
    }
}

#[tonic::async_trait]
impl Uplink for LocalUplink {
    async fn hello(&self, rank: u32) -> Result<mpsc::UnboundedReceiver<Frame>> {
        self.parent.hello(rank).await
    }

    async fn notify(&self, kind: &str, data: Value) -> Result<()> {
        self.parent
            .notify(Notice {
                kind: kind.to_string(),
                data,
                reply: None,
            })
            .await
    }

    async fn notify_wait(&self, kind: &str, data: Value) -> Result<()> {
        self.parent.notify_wait(kind, data).await
    }
}

/// Drive the hello stream from the parent: attach, feed frames into the
/// engine, and reconnect with backoff when the stream drops. Pending
/// updates queued by the parent replay on each reattach.
pub async fn run_uplink(
    uplink: Arc<dyn Uplink>,
    rank: u32,
    engine: EngineHandle,
    reconnect_delay: Duration,
    shutdown: CancellationToken,
) {
    loop {
        match uplink.hello(rank).await {
            Ok(mut frames) => {
                tracing::info!(rank, "attached to parent");
                loop {
                    tokio::select! {
                        frame = frames.recv() => match frame {
                            Some(frame) => {
                                if engine.downstream(frame).await.is_err() {
                                    return;
                                }
                            }
                            None => break,
                        },
                        _ = shutdown.cancelled() => return,
                    }
                }
                tracing::warn!(rank, "hello stream from parent ended");
            }
            Err(err) => tracing::warn!(rank, error = %err, "hello to parent failed"),
        }
        tokio::select! {
            _ = tokio::time::sleep(reconnect_delay) => {}
            _ = shutdown.cancelled() => return,
        }
    }
}
