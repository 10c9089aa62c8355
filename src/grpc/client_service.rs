use std::pin::Pin;

use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::engine::EngineHandle;
use crate::proto::exec_server::Exec;
use crate::proto::{
    ExecFrame as ProtoExecFrame, KillReply, KillRequest, PingReply, PingRequest, StartRequest,
};

/// Client-facing gRPC service, normally driven on rank 0.
pub struct ClientService {
    engine: EngineHandle,
}

impl ClientService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl Exec for ClientService {
    type StartStream = Pin<Box<dyn Stream<Item = Result<ProtoExecFrame, Status>> + Send>>;

    async fn start(
        &self,
        request: Request<StartRequest>,
    ) -> Result<Response<Self::StartStream>, Status> {
        let req = request.into_inner();
        let frames = self
            .engine
            .start(req.id, req.userid, &req.ranks)
            .await
            .map_err(Status::from)?;
        let stream = UnboundedReceiverStream::new(frames).map(|frame| {
            Ok(ProtoExecFrame {
                id: frame.id,
                r#type: frame.kind,
                data: frame.data.to_string(),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<KillReply>, Status> {
        let req = request.into_inner();
        self.engine
            .kill(req.id, &req.ranks, req.signum)
            .await
            .map_err(Status::from)?;
        Ok(Response::new(KillReply {}))
    }

    async fn ping(&self, request: Request<PingRequest>) -> Result<Response<PingReply>, Status> {
        let req = request.into_inner();
        let data = if req.data.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_str(&req.data)
                .map_err(|err| Status::invalid_argument(format!("malformed ping payload: {err}")))?
        };
        let ranks = self.engine.ping(&req.ranks, data).await.map_err(Status::from)?;
        Ok(Response::new(PingReply {
            ranks: ranks.to_string(),
        }))
    }
}
