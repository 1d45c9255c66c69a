//! webrtc-rs implementation of the capability traits.
//!
//! Callbacks registered on the underlying `RTCPeerConnection` and its data
//! channels are turned into [`PeerEvent`]s on the session's event sender.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use picamera_core::{
    IceCandidateInit, PeerConnectionState, PeerError, SdpType, SessionDescription, TrackKind,
    TransceiverDirection,
};
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::connection::{
    DataChannel, DataChannelInit, MediaSourceProvider, MediaTrack, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender,
};

fn backend_err(e: webrtc::Error) -> PeerError {
    PeerError::Backend(e.to_string())
}

// ── Conversions ──────────────────────────────────────────────────────────────

fn to_rtc_description(desc: SessionDescription) -> Result<RTCSessionDescription, PeerError> {
    let result = match desc.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        SdpType::Pranswer => RTCSessionDescription::pranswer(desc.sdp),
        SdpType::Rollback => {
            return Err(PeerError::InvalidDescription {
                reason: "rollback is not supported".to_owned(),
            })
        }
    };
    result.map_err(|e| PeerError::InvalidDescription {
        reason: e.to_string(),
    })
}

fn from_rtc_description(desc: RTCSessionDescription) -> Result<SessionDescription, PeerError> {
    let sdp_type = match desc.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        RTCSdpType::Unspecified => {
            return Err(PeerError::InvalidDescription {
                reason: "unspecified sdp type".to_owned(),
            })
        }
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: desc.sdp,
    })
}

fn from_rtc_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => PeerConnectionState::New,
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
    }
}

fn to_rtc_kind(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn to_rtc_direction(direction: TransceiverDirection) -> RTCRtpTransceiverDirection {
    match direction {
        TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
        TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
        TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
        TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub struct WebRtcFactory {
    api: API,
}

impl WebRtcFactory {
    /// API with the default codecs and interceptors.
    pub fn new() -> Result<Self, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(backend_err)?;
        let registry =
            register_default_interceptors(Registry::new(), &mut media_engine).map_err(backend_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl PeerConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError> {
        let rtc_config = RTCConfiguration {
            ice_servers: config
                .ice_servers
                .into_iter()
                .map(|s| RTCIceServer {
                    urls: s.urls,
                    username: s.username.unwrap_or_default(),
                    credential: s.credential.unwrap_or_default(),
                    ..Default::default()
                })
                .collect(),
            ice_candidate_pool_size: config.ice_candidate_pool_size,
            ..Default::default()
        };
        let pc = Arc::new(
            self.api
                .new_peer_connection(rtc_config)
                .await
                .map_err(backend_err)?,
        );
        install_handlers(&pc, &events);
        Ok(Arc::new(RtcPeer { pc, events }))
    }
}

fn install_handlers(pc: &Arc<RTCPeerConnection>, events: &PeerEventSender) {
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        let tx = tx.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            match candidate.to_json() {
                Ok(init) => {
                    tx.send(PeerEvent::IceCandidate(IceCandidateInit {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    }));
                }
                Err(e) => warn!("Serializing local ICE candidate: {}", e),
            }
        })
    }));

    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let tx = tx.clone();
        Box::pin(async move {
            tx.send(PeerEvent::ConnectionStateChange(from_rtc_state(state)));
        })
    }));

    let tx = events.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let tx = tx.clone();
        Box::pin(async move {
            let stream_id = track.stream_id();
            let remote: Arc<dyn MediaTrack> = Arc::new(RemoteTrack::new(track));
            tx.send(PeerEvent::Track {
                stream_id,
                track: remote,
            });
        })
    }));

    let tx = events.clone();
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let tx = tx.clone();
        Box::pin(async move {
            debug!("Remote data channel announced: {}", dc.label());
            wire_channel(&dc, &tx);
            tx.send(PeerEvent::DataChannel(Arc::new(RtcDataChannel::new(dc))));
        })
    }));
}

fn wire_channel(dc: &Arc<RTCDataChannel>, events: &PeerEventSender) {
    let label = dc.label().to_owned();

    let tx = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        tx.send(PeerEvent::DataChannelOpen { label: open_label });
        Box::pin(async {})
    }));

    let tx = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        tx.send(PeerEvent::DataChannelMessage {
            label: label.clone(),
            data: msg.data,
        });
        Box::pin(async {})
    }));
}

// ── Peer connection ──────────────────────────────────────────────────────────

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSender,
}

#[async_trait]
impl PeerConnection for RtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(backend_err)?;
        from_rtc_description(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(backend_err)?;
        from_rtc_description(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_local_description(to_rtc_description(desc)?)
            .await
            .map_err(backend_err)
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        self.pc
            .set_remote_description(to_rtc_description(desc)?)
            .await
            .map_err(backend_err)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| PeerError::InvalidCandidate {
                reason: e.to_string(),
            })
    }

    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, PeerError> {
        let options = RTCDataChannelInit {
            ordered: Some(init.ordered),
            max_retransmits: init.max_retransmits,
            negotiated: init.negotiated,
            ..Default::default()
        };
        let dc = self
            .pc
            .create_data_channel(label, Some(options))
            .await
            .map_err(|e| PeerError::DataChannel {
                label: label.to_owned(),
                reason: e.to_string(),
            })?;
        wire_channel(&dc, &self.events);
        Ok(Arc::new(RtcDataChannel::new(dc)))
    }

    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError> {
        self.pc
            .add_transceiver_from_kind(
                to_rtc_kind(kind),
                Some(RTCRtpTransceiverInit {
                    direction: to_rtc_direction(direction),
                    send_encodings: vec![],
                }),
            )
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError> {
        let Some(local) = track.as_any().downcast_ref::<LocalAudioTrack>() else {
            return Err(PeerError::Backend(format!(
                "track {} was not created by this backend",
                track.id()
            )));
        };
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = local.sample_track.clone();
        self.pc.add_track(rtc_track).await.map_err(backend_err)?;
        Ok(())
    }

    fn connection_state(&self) -> PeerConnectionState {
        from_rtc_state(self.pc.connection_state())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(backend_err)
    }
}

// ── Data channel ─────────────────────────────────────────────────────────────

struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
    label: String,
}

impl RtcDataChannel {
    fn new(inner: Arc<RTCDataChannel>) -> Self {
        let label = inner.label().to_owned();
        Self { inner, label }
    }
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.label)
            .field("state", &self.inner.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send(&self, data: Bytes) -> Result<(), PeerError> {
        self.inner
            .send(&data)
            .await
            .map(|_| ())
            .map_err(|e| PeerError::DataChannel {
                label: self.label.clone(),
                reason: e.to_string(),
            })
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.inner.close().await.map_err(backend_err)
    }
}

// ── Media ────────────────────────────────────────────────────────────────────

/// Enabled/stopped flags shared by both track types. Stopping is final.
#[derive(Debug)]
struct TrackGate {
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl Default for TrackGate {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }
}

impl TrackGate {
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Media should flow: enabled and not stopped.
    fn is_live(&self) -> bool {
        self.is_enabled() && !self.is_stopped()
    }
}

/// A track received from the remote side. The RTP stream is available via
/// [`RemoteTrack::rtp`] until the track is stopped; enabling only gates what
/// the consumer plays.
pub struct RemoteTrack {
    track: Arc<TrackRemote>,
    id: String,
    kind: TrackKind,
    gate: TrackGate,
}

impl RemoteTrack {
    fn new(track: Arc<TrackRemote>) -> Self {
        let kind = match track.kind() {
            RTPCodecType::Audio => TrackKind::Audio,
            _ => TrackKind::Video,
        };
        Self {
            id: track.id(),
            track,
            kind,
            gate: TrackGate::default(),
        }
    }

    /// `None` once the track has been stopped.
    pub fn rtp(&self) -> Option<&Arc<TrackRemote>> {
        (!self.gate.is_stopped()).then_some(&self.track)
    }

    pub fn is_stopped(&self) -> bool {
        self.gate.is_stopped()
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl MediaTrack for RemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn set_enabled(&self, enabled: bool) {
        self.gate.set_enabled(enabled);
    }

    fn is_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    fn stop(&self) {
        self.gate.stop();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Opus track fed with samples by the application (e.g. from a capture
/// device). Samples written while disabled or stopped are dropped.
pub struct LocalAudioTrack {
    sample_track: Arc<TrackLocalStaticSample>,
    id: String,
    gate: TrackGate,
}

impl LocalAudioTrack {
    pub fn new(id: &str, stream_id: &str) -> Self {
        let sample_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            id.to_owned(),
            stream_id.to_owned(),
        ));
        Self {
            sample_track,
            id: id.to_owned(),
            gate: TrackGate::default(),
        }
    }

    pub async fn write_sample(&self, sample: &Sample) -> Result<(), PeerError> {
        if !self.gate.is_live() {
            return Ok(());
        }
        self.sample_track
            .write_sample(sample)
            .await
            .map_err(backend_err)
    }
}

impl fmt::Debug for LocalAudioTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalAudioTrack")
            .field("id", &self.id)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl MediaTrack for LocalAudioTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        TrackKind::Audio
    }

    fn set_enabled(&self, enabled: bool) {
        self.gate.set_enabled(enabled);
    }

    fn is_enabled(&self) -> bool {
        self.gate.is_enabled()
    }

    fn stop(&self) {
        self.gate.stop();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Hands out [`LocalAudioTrack`]s; the caller feeds them with samples.
#[derive(Debug, Default)]
pub struct SampleAudioSource {
    stream_id: String,
}

impl SampleAudioSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaSourceProvider for SampleAudioSource {
    async fn local_audio(&self) -> Result<Arc<dyn MediaTrack>, PeerError> {
        Ok(Arc::new(LocalAudioTrack::new("audio", &self.stream_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stopped_gate_stays_stopped() {
        let gate = TrackGate::default();
        assert!(gate.is_live());

        gate.set_enabled(false);
        assert!(!gate.is_live());
        gate.set_enabled(true);
        assert!(gate.is_live());

        gate.stop();
        gate.set_enabled(true);
        assert!(gate.is_stopped());
        assert!(!gate.is_live());
    }

    #[tokio::test]
    async fn stopped_local_track_drops_samples() {
        let track = LocalAudioTrack::new("audio", "picamera");
        track.stop();
        assert!(track.is_enabled());
        assert!(track.gate.is_stopped());
        assert!(track.write_sample(&Sample::default()).await.is_ok());
    }
}
