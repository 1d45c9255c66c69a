pub mod camera_property;
pub mod config;
pub mod errors;
pub mod types;

pub use camera_property::{CameraPropertyKey, PropertyValue};
pub use config::{MqttProtocol, PiCameraOptions, SignalingKind};
pub use errors::{PeerError, PiCameraError, ProtocolError, SignalingError};
pub use types::*;
