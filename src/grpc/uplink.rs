use serde_json::Value;
use tokio::sync::mpsc;
use tonic::transport::{Channel, Endpoint};

use crate::engine::Frame;
use crate::error::{Error, Result};
use crate::proto::overlay_client::OverlayClient;
use crate::proto::{HelloRequest, NotifyRequest};
use crate::uplink::Uplink;

/// Uplink to a parent rank over its Overlay gRPC service. The channel
/// connects lazily and re-establishes itself between calls, so a parent
/// that is not up yet just makes the first calls fail and retry.
pub struct GrpcUplink {
    channel: Channel,
}

impl GrpcUplink {
    pub fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))
            .map_err(|err| Error::Transport(err.to_string()))?;
        Ok(Self {
            channel: endpoint.connect_lazy(),
        })
    }

    fn client(&self) -> OverlayClient<Channel> {
        OverlayClient::new(self.channel.clone())
    }
}

#[tonic::async_trait]
impl Uplink for GrpcUplink {
    async fn hello(&self, rank: u32) -> Result<mpsc::UnboundedReceiver<Frame>> {
        let mut stream = self
            .client()
            .hello(HelloRequest { rank })
            .await?
            .into_inner();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match stream.message().await {
                    Ok(Some(frame)) => {
                        // Malformed frames are logged and dropped; the
                        // stream itself stays up.
                        let idset = match frame.idset.parse() {
                            Ok(idset) => idset,
                            Err(err) => {
                                tracing::error!(error = %err, "bad idset in hello frame, dropping");
                                continue;
                            }
                        };
                        let data = match serde_json::from_str(&frame.data) {
                            Ok(data) => data,
                            Err(err) => {
                                tracing::error!(error = %err, "bad payload in hello frame, dropping");
                                continue;
                            }
                        };
                        let frame = Frame {
                            kind: frame.r#type,
                            idset,
                            data,
                        };
                        if tx.send(frame).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "hello stream error");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn notify(&self, kind: &str, data: Value) -> Result<()> {
        self.notify_wait(kind, data).await
    }

    async fn notify_wait(&self, kind: &str, data: Value) -> Result<()> {
        self.client()
            .notify(NotifyRequest {
                r#type: kind.to_string(),
                data: data.to_string(),
            })
            .await?;
        Ok(())
    }
}
