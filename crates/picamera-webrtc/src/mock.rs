//! In-memory doubles for the capability traits.
//!
//! Every call is recorded so tests can assert on ordering, and the peer can
//! inject backend events (ICE, state changes, channel traffic) on demand.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::Bytes;
use picamera_core::{
    IceCandidateInit, PeerConnectionState, PeerError, SessionDescription, SessionRole, TrackKind,
    TransceiverDirection,
};

use crate::connection::{
    DataChannel, DataChannelInit, MediaSourceProvider, MediaTrack, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender,
};

pub const MOCK_OFFER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock-offer\r\n";
pub const MOCK_ANSWER_SDP: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock-answer\r\n";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// MARK: - MockTrack

#[derive(Debug)]
pub struct MockTrack {
    id: String,
    kind: TrackKind,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl MockTrack {
    pub fn new(id: &str, kind: TrackKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            kind,
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl MediaTrack for MockTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// MARK: - MockMediaSource

#[derive(Debug, Default)]
pub struct MockMediaSource {
    unavailable: AtomicBool,
    issued: Mutex<Vec<Arc<MockTrack>>>,
}

impl MockMediaSource {
    /// A source whose microphone request always fails.
    pub fn unavailable() -> Self {
        Self {
            unavailable: AtomicBool::new(true),
            ..Default::default()
        }
    }

    pub fn issued(&self) -> Vec<Arc<MockTrack>> {
        lock(&self.issued).clone()
    }
}

#[async_trait]
impl MediaSourceProvider for MockMediaSource {
    async fn local_audio(&self) -> Result<Arc<dyn MediaTrack>, PeerError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PeerError::MediaUnavailable {
                reason: "no microphone".to_owned(),
            });
        }
        let mut issued = lock(&self.issued);
        let track = MockTrack::new(&format!("mic-{}", issued.len()), TrackKind::Audio);
        issued.push(track.clone());
        Ok(track)
    }
}

// MARK: - MockDataChannel

#[derive(Debug)]
pub struct MockDataChannel {
    label: String,
    init: DataChannelInit,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<Bytes>>,
}

impl MockDataChannel {
    pub fn new(label: &str, init: DataChannelInit) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_owned(),
            init,
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn init(&self) -> DataChannelInit {
        self.init
    }

    pub fn set_open(&self, open: bool) {
        self.open.store(open, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<Bytes> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && !self.is_closed()
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        if !self.is_open() {
            return Err(PeerError::DataChannel {
                label: self.label.clone(),
                reason: "not open".to_owned(),
            });
        }
        lock(&self.sent).push(data);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// MARK: - MockPeerConnection

/// One recorded call on a [`MockPeerConnection`].
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCall {
    CreateOffer,
    CreateAnswer,
    SetLocalDescription(SessionDescription),
    SetRemoteDescription(SessionDescription),
    AddIceCandidate(IceCandidateInit),
    CreateDataChannel { label: String, init: DataChannelInit },
    AddTransceiver { kind: TrackKind, direction: TransceiverDirection },
    AddTrack { id: String },
    Close,
}

#[derive(Debug)]
pub struct MockPeerConnection {
    config: PeerConfig,
    events: PeerEventSender,
    calls: Mutex<Vec<PeerCall>>,
    channels: Mutex<Vec<Arc<MockDataChannel>>>,
    state: Mutex<PeerConnectionState>,
    has_remote: AtomicBool,
}

impl MockPeerConnection {
    pub fn new(config: PeerConfig, events: PeerEventSender) -> Arc<Self> {
        Arc::new(Self {
            config,
            events,
            calls: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            state: Mutex::new(PeerConnectionState::New),
            has_remote: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PeerConfig {
        &self.config
    }

    pub fn role(&self) -> SessionRole {
        self.events.role()
    }

    pub fn calls(&self) -> Vec<PeerCall> {
        lock(&self.calls).clone()
    }

    /// ICE candidates applied so far, in order.
    pub fn applied_candidates(&self) -> Vec<String> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                PeerCall::AddIceCandidate(init) => Some(init.candidate.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn channel(&self, label: &str) -> Option<Arc<MockDataChannel>> {
        lock(&self.channels).iter().find(|c| c.label() == label).cloned()
    }

    // -- event injection --

    pub fn emit(&self, event: PeerEvent) {
        self.events.send(event);
    }

    pub fn set_state(&self, state: PeerConnectionState) {
        *lock(&self.state) = state;
        self.emit(PeerEvent::ConnectionStateChange(state));
    }

    /// Mark a local channel open and announce it.
    pub fn open_channel(&self, label: &str) {
        if let Some(channel) = self.channel(label) {
            channel.set_open(true);
        }
        self.emit(PeerEvent::DataChannelOpen {
            label: label.to_owned(),
        });
    }

    /// Announce a channel created by the remote side.
    pub fn announce_channel(&self, label: &str, init: DataChannelInit) -> Arc<MockDataChannel> {
        let channel = MockDataChannel::new(label, init);
        channel.set_open(true);
        lock(&self.channels).push(channel.clone());
        self.emit(PeerEvent::DataChannel(channel.clone()));
        channel
    }

    pub fn deliver(&self, label: &str, data: impl Into<Bytes>) {
        self.emit(PeerEvent::DataChannelMessage {
            label: label.to_owned(),
            data: data.into(),
        });
    }

    fn record(&self, call: PeerCall) {
        lock(&self.calls).push(call);
    }
}

#[async_trait]
impl PeerConnection for MockPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.record(PeerCall::CreateOffer);
        Ok(SessionDescription::offer(MOCK_OFFER_SDP))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(PeerError::NegotiationFailed {
                reason: "answer without remote offer".to_owned(),
            });
        }
        self.record(PeerCall::CreateAnswer);
        Ok(SessionDescription::answer(MOCK_ANSWER_SDP))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetLocalDescription(desc));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.record(PeerCall::SetRemoteDescription(desc));
        self.has_remote.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        if !self.has_remote.load(Ordering::SeqCst) {
            return Err(PeerError::InvalidCandidate {
                reason: "remote description not set".to_owned(),
            });
        }
        self.record(PeerCall::AddIceCandidate(candidate));
        Ok(())
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, PeerError> {
        self.record(PeerCall::CreateDataChannel {
            label: label.to_owned(),
            init,
        });
        let channel = MockDataChannel::new(label, init);
        lock(&self.channels).push(channel.clone());
        Ok(channel)
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError> {
        self.record(PeerCall::AddTransceiver { kind, direction });
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        self.record(PeerCall::AddTrack {
            id: track.id().to_owned(),
        });
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        *lock(&self.state)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.record(PeerCall::Close);
        *lock(&self.state) = PeerConnectionState::Closed;
        Ok(())
    }
}

// MARK: - MockPeerFactory

#[derive(Debug, Default)]
pub struct MockPeerFactory {
    peers: Mutex<Vec<Arc<MockPeerConnection>>>,
}

impl MockPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn peers(&self) -> Vec<Arc<MockPeerConnection>> {
        lock(&self.peers).clone()
    }

    /// The most recent peer created for `role`.
    pub fn peer(&self, role: SessionRole) -> Option<Arc<MockPeerConnection>> {
        lock(&self.peers).iter().rev().find(|p| p.role() == role).cloned()
    }
}

#[async_trait]
impl PeerConnectionFactory for MockPeerFactory {
    async fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let peer = MockPeerConnection::new(config, events);
        lock(&self.peers).push(peer.clone());
        Ok(peer)
    }
}
