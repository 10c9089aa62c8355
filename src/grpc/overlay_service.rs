use std::pin::Pin;

use futures::Stream;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};

use crate::engine::{EngineHandle, Notice};
use crate::error::Error;
use crate::proto::overlay_server::Overlay;
use crate::proto::{HelloFrame, HelloRequest, NotifyReply, NotifyRequest};

/// Overlay-facing gRPC service: children attach their hello streams here
/// and send upstream notifies.
pub struct OverlayService {
    engine: EngineHandle,
}

impl OverlayService {
    pub fn new(engine: EngineHandle) -> Self {
        Self { engine }
    }
}

#[tonic::async_trait]
impl Overlay for OverlayService {
    type HelloStream = Pin<Box<dyn Stream<Item = Result<HelloFrame, Status>> + Send>>;

    async fn hello(
        &self,
        request: Request<HelloRequest>,
    ) -> Result<Response<Self::HelloStream>, Status> {
        let rank = request.into_inner().rank;
        let frames = self.engine.hello(rank).await.map_err(Status::from)?;
        tracing::debug!(rank, "hello stream attached");
        let stream = UnboundedReceiverStream::new(frames).map(|frame| {
            Ok(HelloFrame {
                r#type: frame.kind,
                idset: frame.idset.to_string(),
                data: frame.data.to_string(),
            })
        });
        Ok(Response::new(Box::pin(stream)))
    }

    async fn notify(
        &self,
        request: Request<NotifyRequest>,
    ) -> Result<Response<NotifyReply>, Status> {
        let req = request.into_inner();
        let data = serde_json::from_str(&req.data)
            .map_err(|err| Status::invalid_argument(format!("malformed notify payload: {err}")))?;
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.engine
            .notify(Notice {
                kind: req.r#type,
                data,
                reply: Some(tx),
            })
            .await
            .map_err(Status::from)?;
        match rx.await {
            Ok(Ok(())) => Ok(Response::new(NotifyReply {})),
            Ok(Err(err)) => Err(err.into()),
            Err(_) => Err(Status::from(Error::Unavailable)),
        }
    }
}
