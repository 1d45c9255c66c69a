use std::sync::Arc;

use bytes::Bytes;
use picamera_core::{
    ChannelId, Participant, PeerConnectionState, Quality, RoomInfo, Speaking, VideoMetadata,
};
use picamera_protocol::CmdType;
use picamera_webrtc::{MediaTrack, SessionEvent};

/// Everything a [`crate::PiCamera`] reports, in arrival order.
#[derive(Debug, Clone)]
pub enum CameraEvent {
    ConnectionState(PeerConnectionState),
    DataChannelOpen(ChannelId),
    /// All tracks received so far for one remote source.
    Stream {
        source_id: String,
        tracks: Vec<Arc<dyn MediaTrack>>,
    },
    /// `data:image/jpeg;base64,...`
    Snapshot(String),
    Metadata(VideoMetadata),
    Progress {
        received: usize,
        total: usize,
        kind: CmdType,
    },
    FileDownloaded(Bytes),
    Message(Bytes),
    /// No session connected before the watchdog fired. `ConnectionState(Closed)`
    /// follows.
    Timeout,

    // SFU room notifications
    RoomInfo(RoomInfo),
    Quality(Vec<Quality>),
    Speaking(Vec<Speaking>),
    Participant(Vec<Participant>),

    /// The signaling link dropped or the relay reported an error.
    SignalingError(String),
    Info(String),
}

impl CameraEvent {
    /// Session events that are forwarded as-is. Candidates and state changes
    /// are handled by the orchestrator and yield `None`.
    pub(crate) fn from_session(event: SessionEvent) -> Option<Self> {
        Some(match event {
            SessionEvent::Stream { source_id, tracks } => Self::Stream { source_id, tracks },
            SessionEvent::DataChannelOpen(id) => Self::DataChannelOpen(id),
            SessionEvent::Progress {
                received,
                total,
                kind,
            } => Self::Progress {
                received,
                total,
                kind,
            },
            SessionEvent::Snapshot(url) => Self::Snapshot(url),
            SessionEvent::Metadata(meta) => Self::Metadata(meta),
            SessionEvent::FileDownloaded(file) => Self::FileDownloaded(file),
            SessionEvent::Message(msg) => Self::Message(msg),
            SessionEvent::IceCandidate(_) | SessionEvent::ConnectionState(_) => return None,
        })
    }
}
