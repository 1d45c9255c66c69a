//! tokio-tungstenite-backed [`SocketConnector`].

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use picamera_core::SignalingError;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};
use url::Url;

use crate::websocket::{SocketConnector, SocketEvent, SocketLink, SocketRequest};

#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl SocketConnector for TungsteniteConnector {
    async fn open(&self, url: &Url) -> Result<SocketLink, SignalingError> {
        let (stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed {
                reason: e.to_string(),
            })?;
        let (mut write, mut read) = stream.split();

        let (request_tx, mut request_rx) = mpsc::unbounded_channel::<SocketRequest>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Writer: forwards requests until Close or the adapter goes away.
        tokio::spawn(async move {
            while let Some(request) = request_rx.recv().await {
                match request {
                    SocketRequest::Text(text) => {
                        if let Err(e) = write.send(Message::Text(text)).await {
                            warn!("WebSocket write failed: {}", e);
                            return;
                        }
                    }
                    SocketRequest::Close => break,
                }
            }
            if let Err(e) = write.send(Message::Close(None)).await {
                debug!("WebSocket close: {}", e);
            }
        });

        // Reader
        tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if event_tx.send(SocketEvent::Text(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| f.reason.to_string())
                            .filter(|reason| !reason.is_empty());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("WebSocket error: {}", e);
                        break Some(e.to_string());
                    }
                    None => break None,
                }
            };
            let _ = event_tx.send(SocketEvent::Closed { reason });
        });

        Ok(SocketLink {
            requests: request_tx,
            events: event_rx,
        })
    }
}
