pub mod commander;
pub mod connection;
pub mod media;
pub mod publisher;
pub mod sdp;
pub mod session;
pub mod subscriber;

#[cfg(feature = "webrtc-rs")]
pub mod backend;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use connection::{
    DataChannel, DataChannelInit, MediaSourceProvider, MediaTrack, PeerConfig, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEventSender,
};
pub use media::{source_id, RemoteStreamTable};
pub use sdp::keep_only_codec;
pub use session::{FrameFormat, PeerSession, SessionEvent, SessionOptions};
