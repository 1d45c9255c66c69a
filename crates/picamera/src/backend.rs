use std::fmt;
use std::sync::Arc;

use picamera_signaling::{BrokerConnector, RumqttConnector, SocketConnector, TungsteniteConnector};
use picamera_webrtc::{MediaSourceProvider, PeerConnectionFactory};

/// The external capabilities a camera connection runs on.
#[derive(Clone)]
pub struct Backend {
    pub peers: Arc<dyn PeerConnectionFactory>,
    pub media: Arc<dyn MediaSourceProvider>,
    pub broker: Arc<dyn BrokerConnector>,
    pub socket: Arc<dyn SocketConnector>,
}

impl Backend {
    /// Peer connections from `peers`, signaling over rumqttc / tokio-tungstenite.
    pub fn new(peers: Arc<dyn PeerConnectionFactory>, media: Arc<dyn MediaSourceProvider>) -> Self {
        Self {
            peers,
            media,
            broker: Arc::new(RumqttConnector),
            socket: Arc::new(TungsteniteConnector),
        }
    }

    pub fn with_broker(mut self, broker: Arc<dyn BrokerConnector>) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_socket(mut self, socket: Arc<dyn SocketConnector>) -> Self {
        self.socket = socket;
        self
    }

    /// webrtc-rs peers with an application-fed Opus microphone track.
    #[cfg(feature = "webrtc-rs")]
    pub fn webrtc() -> Result<Self, picamera_core::PeerError> {
        use picamera_webrtc::backend::{SampleAudioSource, WebRtcFactory};

        Ok(Self::new(
            Arc::new(WebRtcFactory::new()?),
            Arc::new(SampleAudioSource::new("picamera")),
        ))
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend").finish_non_exhaustive()
    }
}
