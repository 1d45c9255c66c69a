//! Capability traits over the underlying WebRTC stack.
//!
//! Sessions never touch a concrete peer connection. A backend implements
//! these traits and reports asynchronous notifications (ICE, state, tracks,
//! data channel traffic) as [`PeerEvent`]s through a [`PeerEventSender`].

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use picamera_core::{
    IceCandidateInit, IceServer, PeerConnectionState, PeerError, SessionDescription, SessionRole,
    TrackKind, TransceiverDirection,
};
use tokio::sync::mpsc;

// MARK: - Configuration

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerConfig {
    pub ice_servers: Vec<IceServer>,
    pub ice_candidate_pool_size: u8,
}

/// Data channel options, mirroring `RTCDataChannelInit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataChannelInit {
    pub ordered: bool,
    /// `None` = unlimited retransmits.
    pub max_retransmits: Option<u16>,
    /// Pre-negotiated stream id; `None` = announced in-band.
    pub negotiated: Option<u16>,
}

impl DataChannelInit {
    /// Ordered, unlimited retransmits.
    pub fn reliable() -> Self {
        Self {
            ordered: true,
            max_retransmits: None,
            negotiated: None,
        }
    }

    /// Unordered, zero retransmits.
    pub fn lossy() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
            negotiated: None,
        }
    }

    pub fn negotiated(mut self, id: u16) -> Self {
        self.negotiated = Some(id);
        self
    }
}

// MARK: - Events

#[derive(Debug, Clone)]
pub enum PeerEvent {
    IceCandidate(IceCandidateInit),
    ConnectionStateChange(PeerConnectionState),
    Track {
        stream_id: String,
        track: Arc<dyn MediaTrack>,
    },
    /// A channel announced by the remote side.
    DataChannel(Arc<dyn DataChannel>),
    DataChannelOpen { label: String },
    DataChannelMessage { label: String, data: Bytes },
}

/// Event sink handed to a backend; tags every event with the session role.
#[derive(Debug, Clone)]
pub struct PeerEventSender {
    role: SessionRole,
    tx: mpsc::UnboundedSender<(SessionRole, PeerEvent)>,
}

impl PeerEventSender {
    pub fn new(role: SessionRole, tx: mpsc::UnboundedSender<(SessionRole, PeerEvent)>) -> Self {
        Self { role, tx }
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// Returns `false` once the receiving side is gone.
    pub fn send(&self, event: PeerEvent) -> bool {
        self.tx.send((self.role, event)).is_ok()
    }
}

// MARK: - Capabilities

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;
    async fn add_ice_candidate(&self, candidate: IceCandidateInit) -> Result<(), PeerError>;
    async fn create_data_channel(
        &self,
        label: &str,
        init: DataChannelInit,
    ) -> Result<Arc<dyn DataChannel>, PeerError>;
    async fn add_transceiver(
        &self,
        kind: TrackKind,
        direction: TransceiverDirection,
    ) -> Result<(), PeerError>;
    async fn add_track(&self, track: Arc<dyn MediaTrack>) -> Result<(), PeerError>;
    fn connection_state(&self) -> PeerConnectionState;
    async fn close(&self) -> Result<(), PeerError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    async fn send(&self, data: Bytes) -> Result<(), PeerError>;
    async fn close(&self) -> Result<(), PeerError>;
}

/// A local or remote media track. Enabling is a soft mute; `stop` releases it.
pub trait MediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    /// Lets a backend recover its own track type in `add_track`.
    fn as_any(&self) -> &dyn Any;
}

/// Source of local capture tracks (microphone).
#[async_trait]
pub trait MediaSourceProvider: Send + Sync {
    async fn local_audio(&self) -> Result<Arc<dyn MediaTrack>, PeerError>;
}

#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    async fn create(
        &self,
        config: PeerConfig,
        events: PeerEventSender,
    ) -> Result<Arc<dyn PeerConnection>, PeerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_presets() {
        let lossy = DataChannelInit::lossy();
        assert!(!lossy.ordered);
        assert_eq!(lossy.max_retransmits, Some(0));

        let cmd = DataChannelInit::reliable().negotiated(0);
        assert!(cmd.ordered);
        assert_eq!(cmd.max_retransmits, None);
        assert_eq!(cmd.negotiated, Some(0));
    }

    #[test]
    fn sender_tags_events_with_role() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sender = PeerEventSender::new(SessionRole::Subscriber, tx);
        assert!(sender.send(PeerEvent::ConnectionStateChange(PeerConnectionState::Connecting)));

        let (role, event) = rx.try_recv().unwrap();
        assert_eq!(role, SessionRole::Subscriber);
        assert!(matches!(
            event,
            PeerEvent::ConnectionStateChange(PeerConnectionState::Connecting)
        ));

        drop(rx);
        assert!(!sender.send(PeerEvent::ConnectionStateChange(PeerConnectionState::Closed)));
    }
}
