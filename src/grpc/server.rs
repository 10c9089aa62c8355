use std::net::SocketAddr;

use tokio_util::sync::CancellationToken;
use tonic::transport::Server;

use crate::engine::EngineHandle;
use crate::grpc::client_service::ClientService;
use crate::grpc::overlay_service::OverlayService;
use crate::proto::exec_server::ExecServer;
use crate::proto::overlay_server::OverlayServer;

/// Serves the Overlay and Exec services for one rank.
pub struct GrpcServer {
    addr: SocketAddr,
    engine: EngineHandle,
}

impl GrpcServer {
    pub fn new(addr: SocketAddr, engine: EngineHandle) -> Self {
        Self { addr, engine }
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<(), tonic::transport::Error> {
        tracing::info!(addr = %self.addr, "starting gRPC server");
        Server::builder()
            .add_service(OverlayServer::new(OverlayService::new(self.engine.clone())))
            .add_service(ExecServer::new(ClientService::new(self.engine)))
            .serve_with_shutdown(self.addr, shutdown.cancelled_owned())
            .await
    }
}
