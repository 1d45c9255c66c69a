//! PiCamera client.
//!
//! Connects to a camera either directly (MQTT-negotiated peer connection) or
//! through an SFU (WebSocket-negotiated publisher and subscriber legs), and
//! exposes the camera's command channel: snapshots, property control,
//! recording metadata and file transfer, custom IPC messages.

mod backend;
mod camera;
mod events;
mod orchestrator;

pub use backend::Backend;
pub use camera::PiCamera;
pub use events::CameraEvent;

pub use picamera_core::{
    CameraPropertyKey, ChannelId, CodecType, IpcMode, MqttProtocol, PeerConnectionState,
    PiCameraError, PiCameraOptions, PropertyValue, SignalingKind, VideoMetadata,
};
pub use picamera_protocol::{CmdType, MetadataSelector, DEFAULT_SNAPSHOT_QUALITY};
