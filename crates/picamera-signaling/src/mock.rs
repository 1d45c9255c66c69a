//! In-memory broker and socket doubles. Each hands the test the far end of
//! the link: inject inbound traffic, drain what the adapter sent.

use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use picamera_core::SignalingError;
use tokio::sync::mpsc;
use url::Url;

use crate::mqtt::{BrokerConnector, BrokerEvent, BrokerLink, BrokerRequest, BrokerSettings};
use crate::websocket::{Envelope, SocketConnector, SocketEvent, SocketLink, SocketRequest};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type Far<E, R> = (mpsc::UnboundedSender<E>, mpsc::UnboundedReceiver<R>);

// MARK: - MockBroker

#[derive(Default)]
pub struct MockBroker {
    opened: Mutex<Option<(BrokerSettings, Vec<String>)>>,
    link: Mutex<Option<Far<BrokerEvent, BrokerRequest>>>,
    refuse: bool,
}

impl MockBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A broker whose `open` fails.
    pub fn refusing() -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            ..Self::default()
        })
    }

    /// Settings and subscriptions of the last `open`.
    pub fn opened(&self) -> Option<(BrokerSettings, Vec<String>)> {
        lock(&self.opened).clone()
    }

    pub fn emit(&self, event: BrokerEvent) {
        if let Some((tx, _)) = lock(&self.link).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Report CONNACK.
    pub fn accept(&self) {
        self.emit(BrokerEvent::Connected);
    }

    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) {
        self.emit(BrokerEvent::Publish {
            topic: topic.to_owned(),
            payload: payload.into(),
        });
    }

    /// Drain every request the adapter made so far.
    pub fn requests(&self) -> Vec<BrokerRequest> {
        let mut out = Vec::new();
        if let Some((_, rx)) = lock(&self.link).as_mut() {
            while let Ok(request) = rx.try_recv() {
                out.push(request);
            }
        }
        out
    }
}

#[async_trait]
impl BrokerConnector for MockBroker {
    async fn open(
        &self,
        settings: &BrokerSettings,
        topics: &[String],
    ) -> Result<BrokerLink, SignalingError> {
        if self.refuse {
            return Err(SignalingError::ConnectionFailed {
                reason: "connection refused".to_owned(),
            });
        }
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *lock(&self.opened) = Some((settings.clone(), topics.to_vec()));
        *lock(&self.link) = Some((event_tx, request_rx));
        Ok(BrokerLink {
            requests: request_tx,
            events: event_rx,
        })
    }
}

// MARK: - MockSocket

#[derive(Default)]
pub struct MockSocket {
    url: Mutex<Option<Url>>,
    link: Mutex<Option<Far<SocketEvent, SocketRequest>>>,
}

impl MockSocket {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn url(&self) -> Option<Url> {
        lock(&self.url).clone()
    }

    pub fn emit(&self, event: SocketEvent) {
        if let Some((tx, _)) = lock(&self.link).as_ref() {
            let _ = tx.send(event);
        }
    }

    /// Deliver `{"action": action, "message": message}`.
    pub fn push(&self, action: &str, message: &str) {
        let text = serde_json::json!({ "action": action, "message": message }).to_string();
        self.emit(SocketEvent::Text(text));
    }

    pub fn close(&self, reason: Option<&str>) {
        self.emit(SocketEvent::Closed {
            reason: reason.map(str::to_owned),
        });
    }

    /// Drain every request the adapter made so far.
    pub fn requests(&self) -> Vec<SocketRequest> {
        let mut out = Vec::new();
        if let Some((_, rx)) = lock(&self.link).as_mut() {
            while let Ok(request) = rx.try_recv() {
                out.push(request);
            }
        }
        out
    }

    /// Drain the text frames sent so far, decoded as envelopes.
    pub fn sent(&self) -> Vec<Envelope> {
        self.requests()
            .into_iter()
            .filter_map(|request| match request {
                SocketRequest::Text(text) => serde_json::from_str(&text).ok(),
                SocketRequest::Close => None,
            })
            .collect()
    }
}

#[async_trait]
impl SocketConnector for MockSocket {
    async fn open(&self, url: &Url) -> Result<SocketLink, SignalingError> {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        *lock(&self.url) = Some(url.clone());
        *lock(&self.link) = Some((event_tx, request_rx));
        Ok(SocketLink {
            requests: request_tx,
            events: event_rx,
        })
    }
}
