use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::engine::{Engine, EngineHandle};
use crate::error::{Error, Result};
use crate::grpc::{GrpcServer, GrpcUplink};
use crate::shell::Spawner;
use crate::uplink::{run_uplink, Uplink};

/// One rank of the overlay: the engine task, the uplink to the parent,
/// and the gRPC server.
pub struct Node {
    config: NodeConfig,
    handle: EngineHandle,
    engine_task: JoinHandle<()>,
    uplink_task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl Node {
    /// Start the engine and uplink tasks. The caller drives the gRPC
    /// server via [`Node::serve`].
    pub fn start(
        config: NodeConfig,
        spawner: Arc<dyn Spawner>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let uplink: Option<Arc<dyn Uplink>> = match (&config.parent_addr, config.rank) {
            (Some(_), 0) => {
                return Err(Error::Protocol("rank 0 has no parent".to_string()));
            }
            (None, rank) if rank != 0 => {
                return Err(Error::Protocol(format!(
                    "rank {rank} requires a parent address"
                )));
            }
            (Some(addr), _) => Some(Arc::new(GrpcUplink::connect(addr)?)),
            (None, _) => None,
        };

        let (engine, handle, events) = Engine::new(&config, spawner, uplink.clone())?;
        let engine_task = tokio::spawn(engine.run(events, shutdown.clone()));
        let uplink_task = uplink.map(|uplink| {
            tokio::spawn(run_uplink(
                uplink,
                config.rank,
                handle.clone(),
                Duration::from_millis(config.reconnect_delay_ms),
                shutdown.clone(),
            ))
        });

        Ok(Self {
            config,
            handle,
            engine_task,
            uplink_task,
            shutdown,
        })
    }

    pub fn handle(&self) -> EngineHandle {
        self.handle.clone()
    }

    /// Serve the Overlay and Exec services until shutdown, then wait for
    /// the engine to drain.
    pub async fn serve(self) -> Result<()> {
        let server = GrpcServer::new(self.config.listen_addr, self.handle.clone());
        server
            .run(self.shutdown.clone())
            .await
            .map_err(|err| Error::Transport(err.to_string()))?;

        self.shutdown.cancel();
        if let Some(task) = self.uplink_task {
            let _ = task.await;
        }
        let _ = self.engine_task.await;
        Ok(())
    }
}
