//! Direct peer that owns the Command channel.

use bytes::Bytes;
use picamera_core::{
    ChannelId, PeerError, PropertyValue, SessionRole, TrackKind, TransceiverDirection,
};
use picamera_protocol::{Command, MetadataSelector};
use tracing::{debug, warn};

use crate::connection::{
    DataChannelInit, MediaSourceProvider, PeerConfig, PeerConnectionFactory, PeerEventSender,
};
use crate::session::{FrameFormat, PeerSession, SessionOptions};

/// Channel options for a commander channel. Both ends pre-negotiate the
/// stream id, so no in-band announcement happens.
fn channel_init(id: ChannelId) -> DataChannelInit {
    let init = match id {
        ChannelId::Lossy => DataChannelInit::lossy(),
        _ => DataChannelInit::reliable(),
    };
    init.negotiated(id.stream_id())
}

impl PeerSession {
    /// Build the commander: local audio and transceivers unless data-only,
    /// the Command channel, and the IPC channel when a mode is configured.
    pub async fn commander(
        factory: &dyn PeerConnectionFactory,
        media: &dyn MediaSourceProvider,
        config: PeerConfig,
        events: PeerEventSender,
        options: SessionOptions,
    ) -> Result<Self, PeerError> {
        let peer = factory.create(config, events).await?;
        let mut session = Self::new(SessionRole::Commander, peer, options, FrameFormat::Direct);

        if !options.datachannel_only {
            if let Err(e) = session.attach_local_audio(media).await {
                warn!("[commander] local audio unavailable: {}", e);
            }
            session
                .add_transceiver(TrackKind::Video, TransceiverDirection::RecvOnly)
                .await?;
            session
                .add_transceiver(TrackKind::Audio, TransceiverDirection::SendRecv)
                .await?;
        }

        session
            .create_data_channel(ChannelId::Command, channel_init(ChannelId::Command))
            .await?;
        if let Some(mode) = options.ipc_mode {
            let id = mode.channel_id();
            session.create_data_channel(id, channel_init(id)).await?;
        }

        debug!("[commander] created (datachannel_only={})", options.datachannel_only);
        Ok(session)
    }

    // ── Requests ─────────────────────────────────────────────────────────────
    //
    // Each request is a no-op (returns `false`) unless the Command channel
    // exists and is open.

    pub async fn snapshot(&self, quality: i32) -> bool {
        self.send_command(Command::Snapshot(quality)).await
    }

    pub async fn set_camera_property(
        &self,
        key: impl Into<u32>,
        value: impl Into<PropertyValue>,
    ) -> bool {
        self.send_command(Command::ControlCamera {
            key: key.into(),
            value: value.into(),
        })
        .await
    }

    pub async fn fetch_metadata(&self, selector: MetadataSelector) -> bool {
        self.send_command(Command::QueryMetadata(selector)).await
    }

    pub async fn fetch_file(&self, path: &str) -> bool {
        self.send_command(Command::TransferFile(path.to_owned())).await
    }

    /// Custom IPC payload: on the IPC channel when one is configured,
    /// otherwise on the Command channel.
    pub async fn send_message(&self, data: Bytes) -> bool {
        let message = Command::Custom(data).to_message();
        match self.options().ipc_mode {
            Some(mode) if self.has_channel(mode.channel_id()) => {
                self.send(mode.channel_id(), message).await
            }
            _ => self.send(ChannelId::Command, message).await,
        }
    }
}
