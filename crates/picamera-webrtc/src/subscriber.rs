//! SFU downlink peer. Creates nothing locally; channels announced by the
//! relay are registered as they arrive.

use picamera_core::{PeerError, SessionRole};
use tracing::debug;

use crate::connection::{PeerConfig, PeerConnectionFactory, PeerEventSender};
use crate::session::{FrameFormat, PeerSession, SessionOptions};

impl PeerSession {
    pub async fn subscriber(
        factory: &dyn PeerConnectionFactory,
        config: PeerConfig,
        events: PeerEventSender,
        options: SessionOptions,
    ) -> Result<Self, PeerError> {
        let peer = factory.create(config, events).await?;
        debug!("[subscriber] created");
        Ok(Self::new(SessionRole::Subscriber, peer, options, FrameFormat::Relay))
    }
}
