//! SFU-topology signaling over the relay's WebSocket proxy.
//!
//! # Envelope
//!
//! Every frame is a JSON text message `{"action": "...", "message": "..."}`.
//! `message` is itself a string: raw SDP for `offer`/`answer`, a candidate
//! string for `tricklePublisher`/`trickleSubscriber`, and JSON for the room
//! notifications.
//!
//! # Lifecycle
//!
//! ```text
//! 1. connect()          → GET {websocketUrl}/rtc?apiKey=..&userId=..&roomId=..
//! 2. ← join             → ICE server for both legs; keep-alive ping every 5 s
//! 3. → offer            ← answer        (publisher leg)
//!    ← offer            → answer        (subscriber leg)
//!    ← trickle {target, candidateInit}  → tricklePublisher / trickleSubscriber
//! 4. ← leave            → keep-alive stops
//! 5. disconnect()       → leave, then close
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use picamera_core::{
    IceCandidateInit, IceServer, PiCameraOptions, SessionDescription, SessionRole, SignalingError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval};
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::adapter::{OutboundSignal, SignalMessage, SignalingAdapter, SignalingEvent, SignalingEventSender};

pub const PING_INTERVAL: Duration = Duration::from_secs(5);

// ── Envelope ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Action {
    Join,
    Offer,
    Answer,
    Trickle,
    AddVideoTrack,
    AddAudioTrack,
    TrackPublished,
    Leave,
    Close,
    Ping,
    TricklePublisher,
    TrickleSubscriber,
    RoomInfo,
    Quality,
    Speaking,
    Participant,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub action: Action,
    #[serde(default)]
    pub message: String,
}

impl Envelope {
    pub fn new(action: Action, message: impl Into<String>) -> Self {
        Self {
            action,
            message: message.into(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum TrickleTarget {
    Publisher,
    Subscriber,
}

/// `candidateInit` arrives either as an object or as a JSON-encoded string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CandidateField {
    Object(IceCandidateInit),
    Encoded(String),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Trickle {
    target: TrickleTarget,
    candidate_init: CandidateField,
}

fn parse_trickle(message: &str) -> Result<SignalMessage, SignalingError> {
    let trickle: Trickle = serde_json::from_str(message)?;
    let candidate = match trickle.candidate_init {
        CandidateField::Object(candidate) => candidate,
        CandidateField::Encoded(json) => serde_json::from_str(&json)?,
    };
    let target = match trickle.target {
        TrickleTarget::Publisher => SessionRole::Publisher,
        TrickleTarget::Subscriber => SessionRole::Subscriber,
    };
    Ok(SignalMessage::RemoteCandidate { target, candidate })
}

/// Map one inbound envelope to a signal. `Ok(None)` for actions that carry
/// nothing for the orchestrator (ping replies and the like).
pub fn decode(envelope: &Envelope) -> Result<Option<SignalMessage>, SignalingError> {
    let message = envelope.message.as_str();
    let signal = match envelope.action {
        Action::Join => SignalMessage::Join(serde_json::from_str::<IceServer>(message)?),
        Action::Offer => SignalMessage::Offer(SessionDescription::offer(message)),
        Action::Answer => SignalMessage::Answer(SessionDescription::answer(message)),
        Action::Trickle => parse_trickle(message)?,
        Action::TrackPublished => SignalMessage::TrackPublished,
        Action::RoomInfo => SignalMessage::RoomInfo(serde_json::from_str(message)?),
        Action::Quality => SignalMessage::Quality(serde_json::from_str(message)?),
        Action::Speaking => SignalMessage::Speaking(serde_json::from_str(message)?),
        Action::Participant => SignalMessage::Participants(serde_json::from_str(message)?),
        Action::Leave => SignalMessage::Leave,
        Action::Error => SignalMessage::Error(envelope.message.clone()),
        Action::Info => SignalMessage::Info(envelope.message.clone()),
        Action::Ping
        | Action::Close
        | Action::AddVideoTrack
        | Action::AddAudioTrack
        | Action::TricklePublisher
        | Action::TrickleSubscriber => return Ok(None),
    };
    Ok(Some(signal))
}

// ── Socket link ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketRequest {
    Text(String),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed { reason: Option<String> },
}

pub struct SocketLink {
    pub requests: mpsc::UnboundedSender<SocketRequest>,
    pub events: mpsc::UnboundedReceiver<SocketEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    /// Complete the websocket handshake with `url`.
    async fn open(&self, url: &Url) -> Result<SocketLink, SignalingError>;
}

// ── WebSocketSignaling ───────────────────────────────────────────────────────

pub struct WebSocketSignaling {
    connector: Arc<dyn SocketConnector>,
    url: Url,
    connected: Arc<AtomicBool>,
    requests: Option<mpsc::UnboundedSender<SocketRequest>>,
    pump: Option<JoinHandle<()>>,
}

impl WebSocketSignaling {
    pub fn new(
        options: &PiCameraOptions,
        connector: Arc<dyn SocketConnector>,
    ) -> Result<Self, SignalingError> {
        let base = options
            .websocket_url
            .as_deref()
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .ok_or_else(|| SignalingError::InvalidUrl("websocket url is not configured".to_owned()))?;
        let user_id = options
            .user_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut url = Url::parse(&format!("{}/rtc", base.trim_end_matches('/')))
            .map_err(|e| SignalingError::InvalidUrl(format!("{base}: {e}")))?;
        url.query_pairs_mut()
            .append_pair("apiKey", options.api_key.as_deref().unwrap_or_default())
            .append_pair("userId", &user_id)
            .append_pair("roomId", options.room_id.as_deref().unwrap_or_default());

        Ok(Self {
            connector,
            url,
            connected: Arc::new(AtomicBool::new(false)),
            requests: None,
            pump: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    fn post(&self, envelope: Envelope) -> Result<(), SignalingError> {
        let requests = match &self.requests {
            Some(tx) if self.is_connected() => tx,
            _ => return Err(SignalingError::NotConnected),
        };
        debug!("→ {:?}", envelope.action);
        let text = serde_json::to_string(&envelope)?;
        requests
            .send(SocketRequest::Text(text))
            .map_err(|_| SignalingError::SendFailed {
                reason: "socket closed".to_owned(),
            })
    }
}

#[async_trait]
impl SignalingAdapter for WebSocketSignaling {
    async fn connect(&mut self, events: SignalingEventSender) -> Result<(), SignalingError> {
        if self.requests.is_some() {
            debug!("WebSocket connect ignored: already started");
            return Ok(());
        }
        let link = self.connector.open(&self.url).await?;
        info!("WebSocket connected to {}", self.url.path());
        self.connected.store(true, Ordering::SeqCst);
        let _ = events.send(SignalingEvent::Ready);

        self.pump = Some(tokio::spawn(pump(
            link.events,
            link.requests.clone(),
            events,
            self.connected.clone(),
        )));
        self.requests = Some(link.requests);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if self.requests.is_none() {
            return;
        }
        if let Err(e) = self.post(Envelope::new(Action::Leave, "")) {
            debug!("leave not sent: {}", e);
        }
        debug!("Terminating websocket connection");
        if let Some(requests) = self.requests.take() {
            let _ = requests.send(SocketRequest::Close);
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn send(&mut self, signal: OutboundSignal) -> Result<(), SignalingError> {
        let envelope = match signal {
            OutboundSignal::Offer(offer) => Envelope::new(Action::Offer, offer.sdp),
            OutboundSignal::Answer(answer) => Envelope::new(Action::Answer, answer.sdp),
            OutboundSignal::Candidate { role, candidate } => {
                let action = match role {
                    SessionRole::Publisher => Action::TricklePublisher,
                    SessionRole::Subscriber => Action::TrickleSubscriber,
                    SessionRole::Commander => {
                        return Err(SignalingError::InvalidMessage {
                            reason: "the relay has no commander leg".to_owned(),
                        })
                    }
                };
                Envelope::new(action, candidate.candidate)
            }
        };
        self.post(envelope)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn tick(ping: &mut Option<Interval>) {
    match ping {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn pump(
    mut link: mpsc::UnboundedReceiver<SocketEvent>,
    requests: mpsc::UnboundedSender<SocketRequest>,
    events: SignalingEventSender,
    connected: Arc<AtomicBool>,
) {
    let mut ping: Option<Interval> = None;
    let reason = loop {
        tokio::select! {
            event = link.recv() => match event {
                Some(SocketEvent::Text(text)) => {
                    let envelope: Envelope = match serde_json::from_str(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            warn!("Dropping malformed envelope: {}", e);
                            continue;
                        }
                    };
                    debug!("← {:?}", envelope.action);
                    match envelope.action {
                        Action::Join => {
                            debug!("start ping interval");
                            ping = Some(time::interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL));
                        }
                        Action::Leave => {
                            debug!("clearing ping interval");
                            ping = None;
                        }
                        _ => {}
                    }
                    match decode(&envelope) {
                        Ok(Some(message)) => {
                            let _ = events.send(SignalingEvent::Message(message));
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping {:?} envelope: {}", envelope.action, e),
                    }
                }
                Some(SocketEvent::Closed { reason }) => break reason,
                None => break None,
            },
            _ = tick(&mut ping) => {
                let Ok(text) = serde_json::to_string(&Envelope::new(Action::Ping, "")) else {
                    continue;
                };
                if requests.send(SocketRequest::Text(text)).is_err() {
                    break None;
                }
            }
        }
    };
    info!("WebSocket disconnected");
    connected.store(false, Ordering::SeqCst);
    let _ = events.send(SignalingEvent::Closed { reason });
}

#[cfg(test)]
mod tests {
    use super::*;
    use picamera_core::ParticipantState;
    use crate::mock::MockSocket;

    fn options() -> PiCameraOptions {
        PiCameraOptions {
            signaling: picamera_core::SignalingKind::Websocket,
            websocket_url: Some("wss://sfu.example/".into()),
            api_key: Some("key".into()),
            user_id: Some("viewer".into()),
            room_id: Some("cam-01".into()),
            ..Default::default()
        }
    }

    async fn connected() -> (
        WebSocketSignaling,
        Arc<MockSocket>,
        mpsc::UnboundedReceiver<SignalingEvent>,
    ) {
        let socket = MockSocket::new();
        let mut signaling = WebSocketSignaling::new(&options(), socket.clone()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        signaling.connect(tx).await.unwrap();
        assert_eq!(rx.recv().await, Some(SignalingEvent::Ready));
        (signaling, socket, rx)
    }

    #[test]
    fn url_carries_room_parameters() {
        let signaling = WebSocketSignaling::new(&options(), MockSocket::new()).unwrap();
        assert_eq!(
            signaling.url().as_str(),
            "wss://sfu.example/rtc?apiKey=key&userId=viewer&roomId=cam-01"
        );
    }

    #[test]
    fn random_user_id_when_unset() {
        let opts = PiCameraOptions {
            user_id: None,
            ..options()
        };
        let signaling = WebSocketSignaling::new(&opts, MockSocket::new()).unwrap();
        let user = signaling
            .url()
            .query_pairs()
            .find(|(k, _)| k == "userId")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        assert!(Uuid::parse_str(&user).is_ok());
    }

    #[test]
    fn trickle_accepts_string_or_object_candidate() {
        let object = r#"{"target":"PUBLISHER","candidateInit":{"candidate":"candidate:1","sdpMid":"0"}}"#;
        let encoded = r#"{"target":"SUBSCRIBER","candidateInit":"{\"candidate\":\"candidate:2\"}"}"#;

        match parse_trickle(object).unwrap() {
            SignalMessage::RemoteCandidate { target, candidate } => {
                assert_eq!(target, SessionRole::Publisher);
                assert_eq!(candidate.sdp_mid.as_deref(), Some("0"));
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse_trickle(encoded).unwrap() {
            SignalMessage::RemoteCandidate { target, candidate } => {
                assert_eq!(target, SessionRole::Subscriber);
                assert_eq!(candidate.candidate, "candidate:2");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn room_notifications_decode() {
        let participants = Envelope::new(
            Action::Participant,
            r#"[{"sid":"PA_1","id":"cam","state":"JOINED"}]"#,
        );
        match decode(&participants).unwrap() {
            Some(SignalMessage::Participants(list)) => {
                assert_eq!(list[0].state, ParticipantState::Joined)
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(decode(&Envelope::new(Action::Ping, "")).unwrap(), None);
        assert!(decode(&Envelope::new(Action::RoomInfo, "{")).is_err());
    }

    #[tokio::test]
    async fn outbound_signals_use_relay_actions() {
        let (mut signaling, socket, _rx) = connected().await;

        signaling
            .send(OutboundSignal::Offer(SessionDescription::offer("v=0 pub")))
            .await
            .unwrap();
        signaling
            .send(OutboundSignal::Candidate {
                role: SessionRole::Subscriber,
                candidate: IceCandidateInit::new("candidate:9"),
            })
            .await
            .unwrap();
        assert!(signaling
            .send(OutboundSignal::Candidate {
                role: SessionRole::Commander,
                candidate: IceCandidateInit::new("candidate:9"),
            })
            .await
            .is_err());

        assert_eq!(
            socket.sent(),
            vec![
                Envelope::new(Action::Offer, "v=0 pub"),
                Envelope::new(Action::TrickleSubscriber, "candidate:9"),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ping_runs_between_join_and_leave() {
        let (_signaling, socket, mut rx) = connected().await;

        socket.push("join", r#"{"urls":["stun:stun.example:3478"]}"#);
        assert!(matches!(
            rx.recv().await,
            Some(SignalingEvent::Message(SignalMessage::Join(server))) if server.urls.len() == 1
        ));

        time::sleep(PING_INTERVAL * 2 + Duration::from_millis(10)).await;
        let pings = socket.sent();
        assert_eq!(pings.len(), 2);
        assert!(pings.iter().all(|e| e.action == Action::Ping));

        socket.push("leave", "");
        assert_eq!(rx.recv().await, Some(SignalingEvent::Message(SignalMessage::Leave)));
        time::sleep(PING_INTERVAL * 3).await;
        assert!(socket.sent().is_empty());
    }

    #[tokio::test]
    async fn disconnect_sends_leave_then_closes() {
        let (mut signaling, socket, _rx) = connected().await;
        signaling.disconnect().await;
        assert!(!signaling.is_connected());

        let requests = socket.requests();
        assert_eq!(requests.len(), 2);
        let leave = match &requests[0] {
            SocketRequest::Text(text) => serde_json::from_str::<Envelope>(text).unwrap(),
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(leave.action, Action::Leave);
        assert_eq!(requests[1], SocketRequest::Close);
    }

    #[tokio::test]
    async fn socket_close_is_reported() {
        let (signaling, socket, mut rx) = connected().await;
        socket.close(Some("going away"));
        assert_eq!(
            rx.recv().await,
            Some(SignalingEvent::Closed {
                reason: Some("going away".into())
            })
        );
        assert!(!signaling.is_connected());
    }
}
