//! SFU uplink peer.

use bytes::Bytes;
use picamera_core::{ChannelId, IpcMode, PeerError, SessionRole};
use picamera_protocol::Command;
use tracing::{debug, warn};

use crate::connection::{
    DataChannelInit, MediaSourceProvider, PeerConfig, PeerConnectionFactory, PeerEventSender,
};
use crate::session::{FrameFormat, PeerSession, SessionOptions};

impl PeerSession {
    /// Build the publisher: both IPC channels (announced in-band to the
    /// relay) and the local microphone unless data-only.
    pub async fn publisher(
        factory: &dyn PeerConnectionFactory,
        media: &dyn MediaSourceProvider,
        config: PeerConfig,
        events: PeerEventSender,
        options: SessionOptions,
    ) -> Result<Self, PeerError> {
        let peer = factory.create(config, events).await?;
        let mut session = Self::new(SessionRole::Publisher, peer, options, FrameFormat::Relay);

        session
            .create_data_channel(ChannelId::Reliable, DataChannelInit::reliable())
            .await?;
        session
            .create_data_channel(ChannelId::Lossy, DataChannelInit::lossy())
            .await?;

        if !options.datachannel_only {
            if let Err(e) = session.attach_local_audio(media).await {
                warn!("[publisher] local audio unavailable: {}", e);
            }
        }

        debug!("[publisher] created");
        Ok(session)
    }

    /// Publish a custom IPC payload through the relay on the configured
    /// mode's channel (reliable when none is configured).
    pub async fn publish_message(&self, data: Bytes) -> bool {
        let id = self
            .options()
            .ipc_mode
            .unwrap_or(IpcMode::Reliable)
            .channel_id();
        self.send(id, Command::Custom(data).to_message()).await
    }
}
