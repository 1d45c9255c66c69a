//! One peer connection plus everything layered on top of it.
//!
//! # Lifecycle
//!
//! ```text
//! 1. PeerSession::commander | publisher | subscriber   (see role modules)
//! 2. create_offer()            or   create_answer(remote_offer)
//! 3. set_remote_description()  ← flushes candidates queued so far
//! 4. add_ice_candidate() ...   ← queued until 3, applied directly after
//! 5. handle_event(PeerEvent)   → Vec<SessionEvent>  (driven by the owner)
//! 6. close()
//! ```
//!
//! All methods take `&mut self`; the owner drives one session from a single
//! task, so no locking happens here.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::Bytes;
use picamera_core::{
    ChannelId, IceCandidateInit, IpcMode, PeerConnectionState, PeerError, ProtocolError,
    SessionDescription, SessionRole, TrackKind, TransceiverDirection, VideoMetadata,
};
use picamera_protocol::receiver::DEFAULT_MAX_TRANSFER_BYTES;
use picamera_protocol::{unwrap_user, wrap_user, CmdType, Command, DataPacketKind, ReceiverSet, Reply};
use tracing::{debug, info, warn};

use crate::connection::{
    DataChannel, DataChannelInit, MediaSourceProvider, MediaTrack, PeerConnection, PeerEvent,
};
use crate::media::RemoteStreamTable;

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub datachannel_only: bool,
    pub ipc_mode: Option<IpcMode>,
    pub mic_on: bool,
    pub speaker_on: bool,
    pub transfer_limit: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            datachannel_only: false,
            ipc_mode: None,
            mic_on: true,
            speaker_on: true,
            transfer_limit: DEFAULT_MAX_TRANSFER_BYTES,
        }
    }
}

/// How data channel messages are framed on this session's path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    /// Tagged messages straight on the channel.
    Direct,
    /// Tagged messages wrapped in SFU user data packets.
    Relay,
}

impl FrameFormat {
    fn seal(self, id: ChannelId, message: Bytes) -> Bytes {
        match self {
            Self::Direct => message,
            Self::Relay => {
                let kind = match id {
                    ChannelId::Lossy => DataPacketKind::Lossy,
                    _ => DataPacketKind::Reliable,
                };
                wrap_user(kind, &message, None)
            }
        }
    }

    fn open(self, frame: Bytes) -> Result<Option<Bytes>, ProtocolError> {
        match self {
            Self::Direct => Ok(Some(frame)),
            Self::Relay => unwrap_user(&frame),
        }
    }
}

// ── SessionEvent ─────────────────────────────────────────────────────────────

/// What a session reports to its owner after handling a [`PeerEvent`].
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Local candidate to forward over signaling.
    IceCandidate(IceCandidateInit),
    ConnectionState(PeerConnectionState),
    /// The aggregated track set of one remote source.
    Stream {
        source_id: String,
        tracks: Vec<Arc<dyn MediaTrack>>,
    },
    DataChannelOpen(ChannelId),
    Progress {
        received: usize,
        total: usize,
        kind: CmdType,
    },
    /// `data:image/jpeg;base64,...`
    Snapshot(String),
    Metadata(VideoMetadata),
    FileDownloaded(Bytes),
    Message(Bytes),
}

impl From<Reply> for SessionEvent {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Progress {
                kind,
                received,
                total,
            } => Self::Progress {
                received,
                total,
                kind,
            },
            Reply::Snapshot(url) => Self::Snapshot(url),
            Reply::Metadata(meta) => Self::Metadata(meta),
            Reply::File(file) => Self::FileDownloaded(file),
            Reply::Message(msg) => Self::Message(msg),
        }
    }
}

// ── PeerSession ──────────────────────────────────────────────────────────────

pub struct PeerSession {
    role: SessionRole,
    peer: Arc<dyn PeerConnection>,
    options: SessionOptions,
    frames: FrameFormat,
    state: PeerConnectionState,
    channels: HashMap<ChannelId, Arc<dyn DataChannel>>,
    receivers: HashMap<ChannelId, ReceiverSet>,
    local_tracks: Vec<Arc<dyn MediaTrack>>,
    remote_streams: RemoteStreamTable,
    pending_ice: VecDeque<IceCandidateInit>,
    remote_applied: bool,
    closed: bool,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("role", &self.role)
            .field("state", &self.state)
            .field("channels", &self.channels.keys().collect::<Vec<_>>())
            .field("pending_ice", &self.pending_ice.len())
            .field("remote_applied", &self.remote_applied)
            .field("closed", &self.closed)
            .finish()
    }
}

impl PeerSession {
    pub(crate) fn new(
        role: SessionRole,
        peer: Arc<dyn PeerConnection>,
        options: SessionOptions,
        frames: FrameFormat,
    ) -> Self {
        Self {
            role,
            peer,
            options,
            frames,
            state: PeerConnectionState::New,
            channels: HashMap::new(),
            receivers: HashMap::new(),
            local_tracks: Vec::new(),
            remote_streams: RemoteStreamTable::default(),
            pending_ice: VecDeque::new(),
            remote_applied: false,
            closed: false,
        }
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn role(&self) -> SessionRole {
        self.role
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Last state reported by the peer connection.
    pub fn connection_state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == PeerConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn has_channel(&self, id: ChannelId) -> bool {
        self.channels.contains_key(&id)
    }

    pub fn is_channel_open(&self, id: ChannelId) -> bool {
        self.channels.get(&id).is_some_and(|c| c.is_open())
    }

    pub fn remote_streams(&self) -> &RemoteStreamTable {
        &self.remote_streams
    }

    // ── Negotiation ──────────────────────────────────────────────────────────

    /// Create an offer and apply it locally.
    pub async fn create_offer(&mut self) -> Result<SessionDescription, PeerError> {
        let offer = self.peer.create_offer().await?;
        self.peer.set_local_description(offer.clone()).await?;
        debug!("[{}] local offer set", self.role);
        Ok(offer)
    }

    /// Apply a remote offer, then create and apply the answer.
    pub async fn create_answer(
        &mut self,
        remote: SessionDescription,
    ) -> Result<SessionDescription, PeerError> {
        self.set_remote_description(remote).await?;
        let answer = self.peer.create_answer().await?;
        self.peer.set_local_description(answer.clone()).await?;
        debug!("[{}] local answer set", self.role);
        Ok(answer)
    }

    /// Apply the remote description and flush queued candidates in arrival order.
    pub async fn set_remote_description(
        &mut self,
        desc: SessionDescription,
    ) -> Result<(), PeerError> {
        self.peer.set_remote_description(desc).await?;
        self.remote_applied = true;

        if !self.pending_ice.is_empty() {
            debug!(
                "[{}] flushing {} queued ICE candidates",
                self.role,
                self.pending_ice.len()
            );
        }
        while let Some(candidate) = self.pending_ice.pop_front() {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!("[{}] queued ICE candidate rejected: {}", self.role, e);
            }
        }
        Ok(())
    }

    pub async fn add_ice_candidate(&mut self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        if !self.remote_applied {
            self.pending_ice.push_back(candidate);
            return Ok(());
        }
        self.peer.add_ice_candidate(candidate).await
    }

    // ── Media ────────────────────────────────────────────────────────────────

    pub(crate) async fn attach_local_audio(
        &mut self,
        media: &dyn MediaSourceProvider,
    ) -> Result<(), PeerError> {
        let track = media.local_audio().await?;
        track.set_enabled(self.options.mic_on);
        self.peer.add_track(track.clone()).await?;
        self.local_tracks.push(track);
        Ok(())
    }

    pub(crate) async fn add_transceiver(
        &mut self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError> {
        self.peer.add_transceiver(kind, direction).await
    }

    pub fn toggle_mic(&mut self, enabled: bool) {
        self.options.mic_on = enabled;
        for track in self.local_tracks.iter().filter(|t| t.kind() == TrackKind::Audio) {
            track.set_enabled(enabled);
        }
    }

    pub fn toggle_speaker(&mut self, enabled: bool) {
        self.options.speaker_on = enabled;
        self.remote_streams.set_audio_enabled(enabled);
    }

    // ── Data channels ────────────────────────────────────────────────────────

    pub async fn create_data_channel(
        &mut self,
        id: ChannelId,
        init: DataChannelInit,
    ) -> Result<(), PeerError> {
        let channel = self.peer.create_data_channel(id.label(), init).await?;
        self.register_channel(id, channel);
        Ok(())
    }

    fn register_channel(&mut self, id: ChannelId, channel: Arc<dyn DataChannel>) {
        let limit = self.options.transfer_limit;
        self.channels.insert(id, channel);
        self.receivers
            .entry(id)
            .or_insert_with(|| ReceiverSet::with_limit(limit));
    }

    /// Accept a remote-announced channel if its label is known and, for IPC
    /// labels, matches the configured mode.
    fn accept_remote_channel(&mut self, channel: Arc<dyn DataChannel>) -> Option<ChannelId> {
        let Some(id) = ChannelId::from_label(channel.label()) else {
            debug!("[{}] ignoring unknown channel {:?}", self.role, channel.label());
            return None;
        };
        let wanted = match id {
            ChannelId::Command => true,
            ipc => self.options.ipc_mode.map(IpcMode::channel_id) == Some(ipc),
        };
        if !wanted {
            debug!("[{}] ignoring channel {} (ipc mode {:?})", self.role, id, self.options.ipc_mode);
            return None;
        }
        info!("[{}] remote channel {} registered", self.role, id);
        self.register_channel(id, channel);
        Some(id)
    }

    /// Frame and send one tagged message. Returns `false` when the channel is
    /// missing or not open; the message is dropped in that case.
    pub async fn send(&self, id: ChannelId, message: Bytes) -> bool {
        let Some(channel) = self.channels.get(&id).filter(|c| c.is_open()) else {
            debug!("[{}] channel {} not open, dropping message", self.role, id);
            return false;
        };
        match channel.send(self.frames.seal(id, message)).await {
            Ok(()) => true,
            Err(e) => {
                warn!("[{}] send on {} failed: {}", self.role, id, e);
                false
            }
        }
    }

    pub(crate) async fn send_command(&self, command: Command) -> bool {
        debug!("[{}] -> {}", self.role, command.kind());
        self.send(ChannelId::Command, command.to_message()).await
    }

    // ── Event handling ───────────────────────────────────────────────────────

    pub fn handle_event(&mut self, event: PeerEvent) -> Vec<SessionEvent> {
        if self.closed {
            return Vec::new();
        }
        match event {
            PeerEvent::IceCandidate(candidate) => vec![SessionEvent::IceCandidate(candidate)],
            PeerEvent::ConnectionStateChange(state) => {
                info!("[{}] connection state: {}", self.role, state);
                self.state = state;
                vec![SessionEvent::ConnectionState(state)]
            }
            PeerEvent::Track { stream_id, track } => {
                if track.kind() == TrackKind::Audio {
                    track.set_enabled(self.options.speaker_on);
                }
                let source_id = self.remote_streams.add(&stream_id, track);
                let tracks = self
                    .remote_streams
                    .stream(&source_id)
                    .map(<[_]>::to_vec)
                    .unwrap_or_default();
                vec![SessionEvent::Stream { source_id, tracks }]
            }
            PeerEvent::DataChannel(channel) => {
                let open = channel.is_open();
                match self.accept_remote_channel(channel) {
                    Some(id) if open => vec![SessionEvent::DataChannelOpen(id)],
                    _ => Vec::new(),
                }
            }
            PeerEvent::DataChannelOpen { label } => match ChannelId::from_label(&label) {
                Some(id) if self.channels.contains_key(&id) => {
                    info!("[{}] data channel {} open", self.role, id);
                    vec![SessionEvent::DataChannelOpen(id)]
                }
                _ => Vec::new(),
            },
            PeerEvent::DataChannelMessage { label, data } => self.dispatch(&label, data),
        }
    }

    fn dispatch(&mut self, label: &str, frame: Bytes) -> Vec<SessionEvent> {
        let Some(receivers) = ChannelId::from_label(label).and_then(|id| self.receivers.get_mut(&id))
        else {
            warn!("[{}] no receivers for channel {:?}", self.role, label);
            return Vec::new();
        };

        let message = match self.frames.open(frame) {
            Ok(Some(message)) => message,
            Ok(None) => return Vec::new(),
            Err(e) => {
                warn!("[{}] dropping message on {}: {}", self.role, label, e);
                return Vec::new();
            }
        };

        match receivers.dispatch(&message) {
            Ok(replies) => replies.into_iter().map(SessionEvent::from).collect(),
            Err(e) => {
                warn!("[{}] dropping message on {}: {}", self.role, label, e);
                Vec::new()
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────────

    /// Release everything. Safe to call more than once.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }

        if self.is_channel_open(ChannelId::Command) {
            self.send_command(Command::Connect(false)).await;
        }
        self.closed = true;

        for receivers in self.receivers.values_mut() {
            receivers.reset();
        }
        self.receivers.clear();

        for track in self.local_tracks.drain(..) {
            track.stop();
        }
        self.remote_streams.clear();

        for (id, channel) in self.channels.drain() {
            if let Err(e) = channel.close().await {
                debug!("[{}] closing channel {}: {}", self.role, id, e);
            }
        }
        if let Err(e) = self.peer.close().await {
            warn!("[{}] closing peer connection: {}", self.role, e);
        }

        self.pending_ice.clear();
        self.state = PeerConnectionState::Closed;
        info!("[{}] session closed", self.role);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{PeerConfig, PeerConnectionFactory, PeerEventSender};
    use crate::mock::{MockPeerConnection, MockPeerFactory, MockTrack, PeerCall};
    use picamera_protocol::encode;
    use tokio::sync::mpsc;

    async fn session(
        frames: FrameFormat,
        options: SessionOptions,
    ) -> (PeerSession, Arc<MockPeerConnection>) {
        let factory = MockPeerFactory::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let peer = factory
            .create(PeerConfig::default(), PeerEventSender::new(SessionRole::Commander, tx))
            .await
            .unwrap();
        let mock = factory.peer(SessionRole::Commander).unwrap();
        (PeerSession::new(SessionRole::Commander, peer, options, frames), mock)
    }

    fn candidate(n: u32) -> IceCandidateInit {
        IceCandidateInit::new(format!("candidate:{n} 1 udp 2122260223 10.0.0.{n} 5000{n} typ host"))
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let (mut s, mock) = session(FrameFormat::Direct, SessionOptions::default()).await;

        for n in 1..=3 {
            s.add_ice_candidate(candidate(n)).await.unwrap();
        }
        assert_eq!(s.pending_candidates(), 3);
        assert!(mock.applied_candidates().is_empty());

        s.set_remote_description(SessionDescription::answer("v=0\r\n")).await.unwrap();
        assert_eq!(s.pending_candidates(), 0);

        s.add_ice_candidate(candidate(4)).await.unwrap();
        assert_eq!(s.pending_candidates(), 0);

        let applied = mock.applied_candidates();
        let expected: Vec<String> = (1..=4).map(|n| candidate(n).candidate).collect();
        assert_eq!(applied, expected);

        // remote description precedes every candidate
        let calls = mock.calls();
        let remote_at = calls
            .iter()
            .position(|c| matches!(c, PeerCall::SetRemoteDescription(_)))
            .unwrap();
        let first_ice = calls
            .iter()
            .position(|c| matches!(c, PeerCall::AddIceCandidate(_)))
            .unwrap();
        assert!(remote_at < first_ice);
    }

    #[tokio::test]
    async fn answer_applies_remote_offer_first() {
        let (mut s, mock) = session(FrameFormat::Relay, SessionOptions::default()).await;
        s.add_ice_candidate(candidate(1)).await.unwrap();

        let answer = s.create_answer(SessionDescription::offer("v=0\r\n")).await.unwrap();
        assert_eq!(answer.sdp_type, picamera_core::SdpType::Answer);

        let calls = mock.calls();
        assert!(matches!(calls[0], PeerCall::SetRemoteDescription(_)));
        assert!(matches!(calls[1], PeerCall::AddIceCandidate(_)));
        assert!(matches!(calls[2], PeerCall::CreateAnswer));
        assert!(matches!(calls[3], PeerCall::SetLocalDescription(_)));
    }

    #[tokio::test]
    async fn remote_tracks_follow_speaker_default() {
        let options = SessionOptions {
            speaker_on: false,
            ..Default::default()
        };
        let (mut s, _mock) = session(FrameFormat::Relay, options).await;
        let audio = MockTrack::new("a", TrackKind::Audio);
        let video = MockTrack::new("v", TrackKind::Video);

        let events = s.handle_event(PeerEvent::Track {
            stream_id: "PA_cam|TR_a".into(),
            track: audio.clone(),
        });
        s.handle_event(PeerEvent::Track {
            stream_id: "PA_cam|TR_v".into(),
            track: video,
        });

        assert!(matches!(&events[0], SessionEvent::Stream { source_id, .. } if source_id == "PA_cam"));
        assert!(!audio.is_enabled());
        assert_eq!(s.remote_streams().stream("PA_cam").map(<[_]>::len), Some(2));

        s.toggle_speaker(true);
        assert!(audio.is_enabled());
    }

    #[tokio::test]
    async fn relay_messages_are_unwrapped_before_dispatch() {
        let options = SessionOptions {
            ipc_mode: Some(IpcMode::Reliable),
            ..Default::default()
        };
        let (mut s, mock) = session(FrameFormat::Relay, options).await;
        let channel = mock.announce_channel("_reliable", DataChannelInit::reliable());
        let opened = s.handle_event(PeerEvent::DataChannel(channel));
        assert!(matches!(opened[..], [SessionEvent::DataChannelOpen(ChannelId::Reliable)]));

        let frame = |body: &[u8]| wrap_user(DataPacketKind::Reliable, &encode(CmdType::Custom, body), None);
        s.handle_event(PeerEvent::DataChannelMessage {
            label: "_reliable".into(),
            data: frame(b"5"),
        });
        let events = s.handle_event(PeerEvent::DataChannelMessage {
            label: "_reliable".into(),
            data: frame(b"hello"),
        });

        assert!(matches!(&events[0], SessionEvent::Progress { received: 5, total: 5, kind: CmdType::Custom }));
        assert!(matches!(&events[1], SessionEvent::Message(m) if &m[..] == b"hello"));
    }

    #[tokio::test]
    async fn remote_ipc_channel_must_match_mode() {
        let options = SessionOptions {
            ipc_mode: Some(IpcMode::Lossy),
            ..Default::default()
        };
        let (mut s, mock) = session(FrameFormat::Relay, options).await;
        let reliable = mock.announce_channel("_reliable", DataChannelInit::reliable());
        assert!(s.handle_event(PeerEvent::DataChannel(reliable)).is_empty());
        assert!(!s.has_channel(ChannelId::Reliable));

        let lossy = mock.announce_channel("_lossy", DataChannelInit::lossy());
        s.handle_event(PeerEvent::DataChannel(lossy));
        assert!(s.has_channel(ChannelId::Lossy));

        let unknown = mock.announce_channel("chat", DataChannelInit::reliable());
        assert!(s.handle_event(PeerEvent::DataChannel(unknown)).is_empty());
    }

    #[tokio::test]
    async fn malformed_messages_are_dropped_and_channel_survives() {
        let (mut s, mock) = session(FrameFormat::Direct, SessionOptions::default()).await;
        s.create_data_channel(ChannelId::Command, DataChannelInit::reliable().negotiated(0))
            .await
            .unwrap();
        mock.open_channel("command");

        let bad = s.handle_event(PeerEvent::DataChannelMessage {
            label: "command".into(),
            data: Bytes::from_static(&[99, 1, 2]),
        });
        assert!(bad.is_empty());

        s.handle_event(PeerEvent::DataChannelMessage {
            label: "command".into(),
            data: encode(CmdType::Recording, b"2"),
        });
        let done = s.handle_event(PeerEvent::DataChannelMessage {
            label: "command".into(),
            data: encode(CmdType::Recording, b"ok"),
        });
        assert!(matches!(done.last(), Some(SessionEvent::FileDownloaded(f)) if &f[..] == b"ok"));
    }

    #[tokio::test]
    async fn close_notifies_camera_and_is_idempotent() {
        let (mut s, mock) = session(FrameFormat::Direct, SessionOptions::default()).await;
        s.create_data_channel(ChannelId::Command, DataChannelInit::reliable().negotiated(0))
            .await
            .unwrap();
        mock.open_channel("command");
        let remote = MockTrack::new("v", TrackKind::Video);
        s.handle_event(PeerEvent::Track {
            stream_id: "cam".into(),
            track: remote.clone(),
        });
        s.add_ice_candidate(candidate(1)).await.unwrap();

        let command = mock.channel("command").unwrap();
        s.close().await;
        s.close().await;

        assert_eq!(command.sent(), vec![Command::Connect(false).to_message()]);
        assert!(command.is_closed());
        assert!(remote.is_stopped());
        assert_eq!(s.pending_candidates(), 0);
        assert_eq!(s.connection_state(), PeerConnectionState::Closed);
        let closes = mock.calls().iter().filter(|c| **c == PeerCall::Close).count();
        assert_eq!(closes, 1);

        // events after close are ignored
        assert!(s
            .handle_event(PeerEvent::ConnectionStateChange(PeerConnectionState::Connected))
            .is_empty());
    }
}
