//! The task that owns the signaling adapter and every peer session of one
//! connection attempt.
//!
//! ```text
//!   PiCamera ──Request──────────────┐
//!   adapter  ──SignalingEvent───────┤
//!   peers    ──(SessionRole, PeerEvent)──► Orchestrator::run ──► CameraEvent
//!   watchdog ──deadline─────────────┘                        └──► status watch
//! ```
//!
//! Direct topology: signaling ready → commander offer → answer and trickle
//! over the broker → commander connected → broker released.
//!
//! SFU topology: join → publisher offer / subscriber answer, both legs
//! trickling through the proxy, which stays up for room notifications.

use std::future;

use bytes::Bytes;
use picamera_core::config::ICE_CANDIDATE_POOL_SIZE;
use picamera_core::{
    IceServer, PeerConnectionState, PeerError, PiCameraOptions, PropertyValue,
    SessionDescription, SessionRole, SignalingKind,
};
use picamera_protocol::MetadataSelector;
use picamera_signaling::{OutboundSignal, SignalMessage, SignalingAdapter, SignalingEvent};
use picamera_webrtc::{
    keep_only_codec, PeerConfig, PeerEvent, PeerEventSender, PeerSession, SessionEvent,
    SessionOptions,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::backend::Backend;
use crate::events::CameraEvent;

/// Calls forwarded from the [`crate::PiCamera`] handle.
#[derive(Debug)]
pub(crate) enum Request {
    Snapshot(i32),
    SetCameraProperty { key: u32, value: PropertyValue },
    FetchMetadata(MetadataSelector),
    FetchFile(String),
    SendMessage(Bytes),
    ToggleMic(Option<bool>),
    ToggleSpeaker(Option<bool>),
    Terminate(oneshot::Sender<()>),
}

pub(crate) struct Orchestrator {
    options: PiCameraOptions,
    backend: Backend,
    signaling: Box<dyn SignalingAdapter>,
    peer_tx: mpsc::UnboundedSender<(SessionRole, PeerEvent)>,
    events: mpsc::UnboundedSender<CameraEvent>,
    status: watch::Sender<PeerConnectionState>,

    commander: Option<PeerSession>,
    publisher: Option<PeerSession>,
    subscriber: Option<PeerSession>,

    deadline: Option<Instant>,
    mic_on: bool,
    speaker_on: bool,
    closed: bool,
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}

impl Orchestrator {
    /// Start the orchestrator on an already-connecting adapter. The watchdog
    /// starts now.
    pub(crate) fn spawn(
        options: PiCameraOptions,
        backend: Backend,
        signaling: Box<dyn SignalingAdapter>,
        signals: mpsc::UnboundedReceiver<SignalingEvent>,
        events: mpsc::UnboundedSender<CameraEvent>,
        status: watch::Sender<PeerConnectionState>,
    ) -> (mpsc::UnboundedSender<Request>, JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();
        let orchestrator = Self {
            deadline: options.timeout().map(|timeout| Instant::now() + timeout),
            mic_on: options.is_mic_on,
            speaker_on: options.is_speaker_on,
            options,
            backend,
            signaling,
            peer_tx,
            events,
            status,
            commander: None,
            publisher: None,
            subscriber: None,
            closed: false,
        };
        let task = tokio::spawn(orchestrator.run(request_rx, signals, peer_rx));
        (request_tx, task)
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut signals: mpsc::UnboundedReceiver<SignalingEvent>,
        mut peers: mpsc::UnboundedReceiver<(SessionRole, PeerEvent)>,
    ) {
        while !self.closed {
            let deadline = self.deadline;
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Terminate(done)) => {
                        self.terminate().await;
                        let _ = done.send(());
                    }
                    Some(request) => self.handle_request(request).await,
                    // handle dropped
                    None => self.terminate().await,
                },
                Some(event) = signals.recv() => self.handle_signal(event).await,
                Some((role, event)) = peers.recv() => self.handle_peer(role, event).await,
                _ = watchdog(deadline) => self.on_watchdog().await,
            }
        }
        debug!("Orchestrator stopped");
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn emit(&self, event: CameraEvent) {
        let _ = self.events.send(event);
    }

    fn is_direct(&self) -> bool {
        self.options.signaling == SignalingKind::Mqtt
    }

    /// The session whose state `PiCamera::status` reports.
    fn status_role(&self) -> SessionRole {
        if self.is_direct() {
            SessionRole::Commander
        } else {
            SessionRole::Subscriber
        }
    }

    fn session_mut(&mut self, role: SessionRole) -> Option<&mut PeerSession> {
        match role {
            SessionRole::Commander => self.commander.as_mut(),
            SessionRole::Publisher => self.publisher.as_mut(),
            SessionRole::Subscriber => self.subscriber.as_mut(),
        }
    }

    fn any_connected(&self) -> bool {
        [&self.commander, &self.subscriber, &self.publisher]
            .into_iter()
            .flatten()
            .any(PeerSession::is_connected)
    }

    fn peer_config(&self, ice_servers: Vec<IceServer>) -> PeerConfig {
        PeerConfig {
            ice_servers,
            ice_candidate_pool_size: ICE_CANDIDATE_POOL_SIZE,
        }
    }

    fn peer_events(&self, role: SessionRole) -> PeerEventSender {
        PeerEventSender::new(role, self.peer_tx.clone())
    }

    fn session_options(&self) -> SessionOptions {
        SessionOptions {
            datachannel_only: self.options.datachannel_only,
            ipc_mode: self.options.ipc_mode,
            mic_on: self.mic_on,
            speaker_on: self.speaker_on,
            ..Default::default()
        }
    }

    async fn signal(&mut self, signal: OutboundSignal) {
        let candidate = matches!(signal, OutboundSignal::Candidate { .. });
        if let Err(e) = self.signaling.send(signal).await {
            if candidate {
                debug!("Candidate not signaled: {}", e);
            } else {
                warn!("Description not signaled: {}", e);
            }
        }
    }

    async fn fail(&mut self, role: SessionRole, error: PeerError) {
        warn!("[{}] negotiation failed: {}", role, error);
        self.terminate().await;
    }

    // ── Session setup ────────────────────────────────────────────────────────

    async fn start_direct(&mut self) {
        if self.commander.is_some() {
            return;
        }
        let peers = self.backend.peers.clone();
        let media = self.backend.media.clone();
        let result = PeerSession::commander(
            peers.as_ref(),
            media.as_ref(),
            self.peer_config(self.options.ice_servers()),
            self.peer_events(SessionRole::Commander),
            self.session_options(),
        )
        .await;
        let mut commander = match result {
            Ok(session) => session,
            Err(e) => return self.fail(SessionRole::Commander, e).await,
        };

        let offer = commander.create_offer().await;
        self.commander = Some(commander);
        let offer = match offer {
            Ok(offer) => offer,
            Err(e) => return self.fail(SessionRole::Commander, e).await,
        };
        // only the signaled copy is filtered
        let offer = match self.options.codec {
            Some(codec) => SessionDescription {
                sdp: keep_only_codec(&offer.sdp, codec),
                ..offer
            },
            None => offer,
        };
        self.signal(OutboundSignal::Offer(offer)).await;
    }

    async fn start_relay(&mut self, server: IceServer) {
        if self.publisher.is_some() {
            debug!("Ignoring repeated join");
            return;
        }
        let peers = self.backend.peers.clone();
        let media = self.backend.media.clone();
        let config = self.peer_config(vec![server]);

        let publisher = PeerSession::publisher(
            peers.as_ref(),
            media.as_ref(),
            config.clone(),
            self.peer_events(SessionRole::Publisher),
            self.session_options(),
        )
        .await;
        let mut publisher = match publisher {
            Ok(session) => session,
            Err(e) => return self.fail(SessionRole::Publisher, e).await,
        };
        let subscriber = PeerSession::subscriber(
            peers.as_ref(),
            config,
            self.peer_events(SessionRole::Subscriber),
            self.session_options(),
        )
        .await;

        let offer = publisher.create_offer().await;
        self.publisher = Some(publisher);
        match subscriber {
            Ok(session) => self.subscriber = Some(session),
            Err(e) => return self.fail(SessionRole::Subscriber, e).await,
        }
        match offer {
            Ok(offer) => self.signal(OutboundSignal::Offer(offer)).await,
            Err(e) => self.fail(SessionRole::Publisher, e).await,
        }
    }

    // ── Signaling ────────────────────────────────────────────────────────────

    async fn handle_signal(&mut self, event: SignalingEvent) {
        match event {
            SignalingEvent::Ready if self.is_direct() => {
                debug!("Broker ready");
                self.start_direct().await;
            }
            SignalingEvent::Ready => debug!("Relay proxy ready, waiting for join"),
            SignalingEvent::Message(message) => self.handle_message(message).await,
            SignalingEvent::Closed { reason } => {
                info!("Signaling closed");
                if let Some(reason) = reason {
                    self.emit(CameraEvent::SignalingError(reason));
                }
            }
        }
    }

    async fn handle_message(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::Answer(answer) => {
                let role = if self.is_direct() {
                    SessionRole::Commander
                } else {
                    SessionRole::Publisher
                };
                let Some(session) = self.session_mut(role) else {
                    warn!("Answer without a {} session", role);
                    return;
                };
                if let Err(e) = session.set_remote_description(answer).await {
                    warn!("[{}] remote answer rejected: {}", role, e);
                }
            }
            SignalMessage::Offer(offer) => {
                let Some(subscriber) = self.subscriber.as_mut() else {
                    warn!("Offer without a subscriber session");
                    return;
                };
                let answer = subscriber.create_answer(offer).await;
                match answer {
                    Ok(answer) => self.signal(OutboundSignal::Answer(answer)).await,
                    Err(e) => warn!("[subscriber] answer failed: {}", e),
                }
            }
            SignalMessage::RemoteCandidate { target, candidate } => {
                let Some(session) = self.session_mut(target) else {
                    debug!("Candidate for missing {} session dropped", target);
                    return;
                };
                if let Err(e) = session.add_ice_candidate(candidate).await {
                    warn!("[{}] remote candidate rejected: {}", target, e);
                }
            }
            SignalMessage::Join(server) => self.start_relay(server).await,
            SignalMessage::TrackPublished => debug!("Track published"),
            SignalMessage::RoomInfo(room) => self.emit(CameraEvent::RoomInfo(room)),
            SignalMessage::Quality(quality) => self.emit(CameraEvent::Quality(quality)),
            SignalMessage::Speaking(speaking) => self.emit(CameraEvent::Speaking(speaking)),
            SignalMessage::Participants(list) => self.emit(CameraEvent::Participant(list)),
            SignalMessage::Leave => {
                info!("Relay asked us to leave");
                self.signaling.disconnect().await;
            }
            SignalMessage::Error(message) => {
                warn!("Relay error: {}", message);
                self.emit(CameraEvent::SignalingError(message));
            }
            SignalMessage::Info(message) => self.emit(CameraEvent::Info(message)),
        }
    }

    // ── Peer events ──────────────────────────────────────────────────────────

    async fn handle_peer(&mut self, role: SessionRole, event: PeerEvent) {
        let Some(session) = self.session_mut(role) else {
            return;
        };
        for event in session.handle_event(event) {
            match event {
                SessionEvent::IceCandidate(candidate) => {
                    if candidate.candidate.is_empty() {
                        continue;
                    }
                    self.signal(OutboundSignal::Candidate { role, candidate })
                        .await;
                }
                SessionEvent::ConnectionState(state) => self.on_state(role, state).await,
                other => {
                    if let Some(event) = CameraEvent::from_session(other) {
                        self.emit(event);
                    }
                }
            }
            if self.closed {
                break;
            }
        }
    }

    async fn on_state(&mut self, role: SessionRole, state: PeerConnectionState) {
        if role == self.status_role() {
            self.status.send_replace(state);
            self.emit(CameraEvent::ConnectionState(state));
        }
        match state {
            PeerConnectionState::Connected => {
                self.deadline = None;
                if role == SessionRole::Commander && self.signaling.is_connected() {
                    info!("Commander connected, releasing broker connection");
                    self.signaling.disconnect().await;
                }
            }
            PeerConnectionState::Failed => {
                warn!("[{}] connection failed", role);
                self.terminate().await;
            }
            _ => {}
        }
    }

    async fn on_watchdog(&mut self) {
        self.deadline = None;
        if self.any_connected() {
            return;
        }
        warn!("RTC connection timeout");
        self.emit(CameraEvent::Timeout);
        self.terminate().await;
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    async fn handle_request(&mut self, request: Request) {
        match request {
            Request::Snapshot(quality) => {
                if let Some(commander) = &self.commander {
                    commander.snapshot(quality).await;
                }
            }
            Request::SetCameraProperty { key, value } => {
                if let Some(commander) = &self.commander {
                    commander.set_camera_property(key, value).await;
                }
            }
            Request::FetchMetadata(selector) => {
                if let Some(commander) = &self.commander {
                    commander.fetch_metadata(selector).await;
                }
            }
            Request::FetchFile(path) => {
                if let Some(commander) = &self.commander {
                    commander.fetch_file(&path).await;
                }
            }
            Request::SendMessage(data) => match (&self.commander, &self.publisher) {
                (Some(commander), _) => {
                    commander.send_message(data).await;
                }
                (None, Some(publisher)) => {
                    publisher.publish_message(data).await;
                }
                (None, None) => debug!("No session for custom message"),
            },
            Request::ToggleMic(enabled) => {
                let enabled = enabled.unwrap_or(!self.mic_on);
                self.mic_on = enabled;
                for session in [&mut self.commander, &mut self.publisher, &mut self.subscriber]
                    .into_iter()
                    .flatten()
                {
                    session.toggle_mic(enabled);
                }
            }
            Request::ToggleSpeaker(enabled) => {
                let enabled = enabled.unwrap_or(!self.speaker_on);
                self.speaker_on = enabled;
                for session in [&mut self.commander, &mut self.publisher, &mut self.subscriber]
                    .into_iter()
                    .flatten()
                {
                    session.toggle_speaker(enabled);
                }
            }
            Request::Terminate(done) => {
                self.terminate().await;
                let _ = done.send(());
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Sessions first, then signaling, then the final `closed` state.
    async fn terminate(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.deadline = None;

        for slot in [&mut self.commander, &mut self.subscriber, &mut self.publisher] {
            if let Some(mut session) = slot.take() {
                session.close().await;
            }
        }
        self.signaling.disconnect().await;

        self.status.send_replace(PeerConnectionState::Closed);
        self.emit(CameraEvent::ConnectionState(PeerConnectionState::Closed));
        info!("PiCamera connections terminated");
    }
}
