//! Direct-topology signaling over an MQTT broker.
//!
//! Every session picks a random client id so concurrent viewers of the same
//! camera never see each other's negotiation:
//!
//! ```text
//! subscribe   {deviceUid}/sdp/{clientId}         answer from the camera
//!             {deviceUid}/ice/{clientId}         camera candidates
//! publish     {deviceUid}/sdp/{clientId}/offer   our offer
//!             {deviceUid}/ice/{clientId}/offer   our candidates
//! ```
//!
//! The broker client itself sits behind [`BrokerConnector`]; the rumqttc
//! implementation lives in [`crate::broker`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use picamera_core::{
    IceCandidateInit, MqttProtocol, PiCameraOptions, SdpType, SessionDescription, SessionRole,
    SignalingError,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapter::{OutboundSignal, SignalMessage, SignalingAdapter, SignalingEvent, SignalingEventSender};

pub const KEEP_ALIVE: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Sdp,
    Ice,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sdp => write!(f, "sdp"),
            Self::Ice => write!(f, "ice"),
        }
    }
}

// ── Broker link ──────────────────────────────────────────────────────────────

/// Everything a broker client needs to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub client_id: String,
    pub host: String,
    pub port: Option<u16>,
    pub path: String,
    pub protocol: MqttProtocol,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
}

impl BrokerSettings {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// `ws[s]://host:port/path`, used when the broker is reached over
    /// websockets.
    pub fn websocket_url(&self) -> String {
        let path = if self.path.is_empty() || self.path.starts_with('/') {
            self.path.clone()
        } else {
            format!("/{}", self.path)
        };
        format!("{}://{}:{}{}", self.protocol.scheme(), self.host, self.port(), path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerRequest {
    Publish { topic: String, payload: Bytes },
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    Connected,
    Publish { topic: String, payload: Bytes },
    Disconnected { reason: Option<String> },
}

pub struct BrokerLink {
    pub requests: mpsc::UnboundedSender<BrokerRequest>,
    pub events: mpsc::UnboundedReceiver<BrokerEvent>,
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    /// Queue subscriptions to `topics`, then start connecting. The link
    /// reports `Connected` once the broker accepts the session.
    async fn open(
        &self,
        settings: &BrokerSettings,
        topics: &[String],
    ) -> Result<BrokerLink, SignalingError>;
}

// ── MqttSignaling ────────────────────────────────────────────────────────────

pub struct MqttSignaling {
    connector: Arc<dyn BrokerConnector>,
    settings: BrokerSettings,
    device_uid: String,
    connected: Arc<AtomicBool>,
    requests: Option<mpsc::UnboundedSender<BrokerRequest>>,
    pump: Option<JoinHandle<()>>,
}

impl MqttSignaling {
    pub fn new(
        options: &PiCameraOptions,
        connector: Arc<dyn BrokerConnector>,
    ) -> Result<Self, SignalingError> {
        let device_uid = required(&options.device_uid, "device uid")?;
        let host = required(&options.mqtt_host, "mqtt host")?;
        let settings = BrokerSettings {
            client_id: Uuid::new_v4().to_string(),
            host,
            port: options.mqtt_port,
            path: options.mqtt_path.clone(),
            protocol: options.mqtt_protocol,
            username: options.mqtt_username.clone(),
            password: options.mqtt_password.clone(),
            keep_alive: KEEP_ALIVE,
        };
        Ok(Self {
            connector,
            settings,
            device_uid,
            connected: Arc::new(AtomicBool::new(false)),
            requests: None,
            pump: None,
        })
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// The topic this session subscribes to.
    pub fn topic(&self, topic: Topic) -> String {
        format!("{}/{}/{}", self.device_uid, topic, self.settings.client_id)
    }

    fn publish(&self, topic: Topic, payload: Vec<u8>) -> Result<(), SignalingError> {
        let requests = match &self.requests {
            Some(tx) if self.is_connected() => tx,
            _ => return Err(SignalingError::NotConnected),
        };
        let destination = format!("{}/offer", self.topic(topic));
        debug!("Publishing {} bytes to {}", payload.len(), destination);
        requests
            .send(BrokerRequest::Publish {
                topic: destination,
                payload: Bytes::from(payload),
            })
            .map_err(|_| SignalingError::SendFailed {
                reason: "broker link closed".to_owned(),
            })
    }
}

fn required(value: &Option<String>, what: &str) -> Result<String, SignalingError> {
    match value.as_deref().map(str::trim) {
        Some(v) if !v.is_empty() => Ok(v.to_owned()),
        _ => Err(SignalingError::ConnectionFailed {
            reason: format!("{what} is not configured"),
        }),
    }
}

#[async_trait]
impl SignalingAdapter for MqttSignaling {
    async fn connect(&mut self, events: SignalingEventSender) -> Result<(), SignalingError> {
        if self.requests.is_some() {
            debug!("MQTT connect ignored: already started");
            return Ok(());
        }
        let sdp_topic = self.topic(Topic::Sdp);
        let ice_topic = self.topic(Topic::Ice);
        let link = self
            .connector
            .open(&self.settings, &[sdp_topic.clone(), ice_topic.clone()])
            .await?;
        info!(
            "MQTT connecting to {}:{} for \"{}\" ({})",
            self.settings.host,
            self.settings.port(),
            self.device_uid,
            self.settings.client_id
        );

        self.requests = Some(link.requests);
        self.pump = Some(tokio::spawn(pump(
            link.events,
            events,
            self.connected.clone(),
            sdp_topic,
            ice_topic,
        )));
        Ok(())
    }

    async fn disconnect(&mut self) {
        let Some(requests) = self.requests.take() else {
            return;
        };
        debug!("Terminating \"{}\" MQTT connection", self.device_uid);
        let _ = requests.send(BrokerRequest::Unsubscribe(self.topic(Topic::Sdp)));
        let _ = requests.send(BrokerRequest::Unsubscribe(self.topic(Topic::Ice)));
        let _ = requests.send(BrokerRequest::Disconnect);
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send(&mut self, signal: OutboundSignal) -> Result<(), SignalingError> {
        match signal {
            OutboundSignal::Offer(offer) => self.publish(Topic::Sdp, serde_json::to_vec(&offer)?),
            OutboundSignal::Candidate { candidate, .. } => {
                self.publish(Topic::Ice, serde_json::to_vec(&candidate)?)
            }
            OutboundSignal::Answer(_) => Err(SignalingError::InvalidMessage {
                reason: "the broker only carries offers from this side".to_owned(),
            }),
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn pump(
    mut link: mpsc::UnboundedReceiver<BrokerEvent>,
    events: SignalingEventSender,
    connected: Arc<AtomicBool>,
    sdp_topic: String,
    ice_topic: String,
) {
    let mut ready = false;
    while let Some(event) = link.recv().await {
        match event {
            BrokerEvent::Connected => {
                connected.store(true, Ordering::SeqCst);
                if !ready {
                    ready = true;
                    info!("MQTT connection established");
                    let _ = events.send(SignalingEvent::Ready);
                }
            }
            BrokerEvent::Publish { topic, payload } => {
                debug!("Received message on topic \"{}\"", topic);
                match decode(&topic, &payload, &sdp_topic, &ice_topic) {
                    Ok(message) => {
                        let _ = events.send(SignalingEvent::Message(message));
                    }
                    Err(e) => warn!("Dropping broker message on {}: {}", topic, e),
                }
            }
            BrokerEvent::Disconnected { reason } => {
                connected.store(false, Ordering::SeqCst);
                let _ = events.send(SignalingEvent::Closed { reason });
                return;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(SignalingEvent::Closed { reason: None });
}

fn decode(
    topic: &str,
    payload: &[u8],
    sdp_topic: &str,
    ice_topic: &str,
) -> Result<SignalMessage, SignalingError> {
    if topic == sdp_topic {
        let desc: SessionDescription = serde_json::from_slice(payload)?;
        return Ok(match desc.sdp_type {
            SdpType::Offer => SignalMessage::Offer(desc),
            _ => SignalMessage::Answer(desc),
        });
    }
    if topic == ice_topic {
        let candidate: IceCandidateInit = serde_json::from_slice(payload)?;
        return Ok(SignalMessage::RemoteCandidate {
            target: SessionRole::Commander,
            candidate,
        });
    }
    Err(SignalingError::InvalidMessage {
        reason: format!("unknown topic {topic}"),
    })
}
