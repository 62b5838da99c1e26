//! WebSocket link.
//!
//! One connection attempt per [`connect`] call. The task reports back over
//! an event channel; every event carries the generation of the attempt so
//! the driver can ignore stragglers from a connection it already replaced.
//!
//! A writer task forwards the link's channel to the socket while the
//! connection task reads. The writer sits in a `JoinSet` owned by the
//! connection task, so aborting the returned handle tears both down.

use futures_util::{SinkExt, StreamExt};
use tessera_engine::{Link, LinkError};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Outbound half handed to the engine.
#[derive(Debug, Clone)]
pub struct ChannelLink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelLink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl Link for ChannelLink {
    fn send(&mut self, frame: String) -> std::result::Result<(), LinkError> {
        self.tx.send(frame).map_err(|_| LinkError::Closed)
    }
}

/// What a connection task reports to the driver.
#[derive(Debug)]
pub enum LinkEvent {
    Opened { generation: u64, link: ChannelLink },
    Frame { generation: u64, text: String },
    Closed { generation: u64 },
    Failed { generation: u64, reason: String },
}

impl LinkEvent {
    pub fn generation(&self) -> u64 {
        match self {
            LinkEvent::Opened { generation, .. }
            | LinkEvent::Frame { generation, .. }
            | LinkEvent::Closed { generation }
            | LinkEvent::Failed { generation, .. } => *generation,
        }
    }
}

/// Upgrade request for the configured endpoint.
pub fn request(
    config: &ClientConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request> {
    let mut request = config
        .endpoint()?
        .into_client_request()
        .map_err(|e| ClientError::Endpoint(e.to_string()))?;

    if let Some(token) = &config.token {
        let value = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ClientError::Endpoint(e.to_string()))?;
        request.headers_mut().insert("Authorization", value);
    }

    Ok(request)
}

/// Spawn one connection attempt.
pub fn connect(
    config: &ClientConfig,
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    let request = request(config);

    tokio::spawn(async move {
        let request = match request {
            Ok(request) => request,
            Err(e) => {
                let _ = events.send(LinkEvent::Failed {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let stream = match tokio_tungstenite::connect_async(request).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                tracing::warn!(generation, error = %e, "connect failed");
                let _ = events.send(LinkEvent::Failed {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        let mut tasks = JoinSet::new();
        tasks.spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(frame.into())).await {
                    tracing::warn!(error = %e, "failed to write frame");
                    break;
                }
            }
            // Link dropped by the engine: close our side.
            let _ = sink.close().await;
        });

        if events
            .send(LinkEvent::Opened {
                generation,
                link: ChannelLink::new(out_tx),
            })
            .is_err()
        {
            return;
        }

        let last = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => {
                    let text = text.as_str().to_owned();
                    if events.send(LinkEvent::Frame { generation, text }).is_err() {
                        return;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break LinkEvent::Closed { generation },
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    break LinkEvent::Failed {
                        generation,
                        reason: e.to_string(),
                    }
                }
            }
        };

        tasks.abort_all();
        let _ = events.send(last);
    })
}
