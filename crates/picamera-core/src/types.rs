use serde::{Deserialize, Serialize};

// MARK: - ChannelId

/// Logical data channels multiplexed over one peer connection.
///
/// The numeric value doubles as the negotiated SCTP stream id on the
/// direct (commander) path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelId {
    Command = 0,
    Lossy = 1,
    Reliable = 2,
}

impl ChannelId {
    pub const ALL: [ChannelId; 3] = [ChannelId::Command, ChannelId::Lossy, ChannelId::Reliable];

    pub fn label(self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::Lossy => "_lossy",
            Self::Reliable => "_reliable",
        }
    }

    pub fn from_label(label: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|id| id.label() == label)
    }

    pub fn stream_id(self) -> u16 {
        self as u16
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// MARK: - IpcMode

/// Delivery mode of the optional IPC channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IpcMode {
    /// Unordered, zero retransmits.
    Lossy,
    /// Ordered, unlimited retransmits.
    Reliable,
}

impl IpcMode {
    pub fn channel_id(self) -> ChannelId {
        match self {
            Self::Lossy => ChannelId::Lossy,
            Self::Reliable => ChannelId::Reliable,
        }
    }
}

// MARK: - PeerConnectionState

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerConnectionState {
    #[default]
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl std::fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// MARK: - SessionRole

/// Which leg of the topology a peer session plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionRole {
    /// Direct peer that owns the command channel.
    Commander,
    /// SFU uplink.
    Publisher,
    /// SFU downlink.
    Subscriber,
}

impl std::fmt::Display for SessionRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Commander => write!(f, "commander"),
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

// MARK: - SessionDescription

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// An SDP blob plus its type, serialized the way browsers do
/// (`{"type":"offer","sdp":"v=0..."}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Offer, sdp: sdp.into() }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { sdp_type: SdpType::Answer, sdp: sdp.into() }
    }
}

// MARK: - IceCandidateInit

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidateInit {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidateInit {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self { candidate: candidate.into(), ..Default::default() }
    }
}

// MARK: - IceServer

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IceServer {
    #[serde(deserialize_with = "one_or_many")]
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

/// `urls` may be a single string or an array on the wire.
fn one_or_many<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(url) => vec![url],
        OneOrMany::Many(urls) => urls,
    })
}

// MARK: - Media

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

/// Video codecs the commander may restrict its offer to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecType {
    #[serde(alias = "h264")]
    H264,
    #[serde(alias = "vp8")]
    VP8,
    #[serde(alias = "vp9")]
    VP9,
    #[serde(alias = "av1")]
    AV1,
}

impl CodecType {
    pub const ALL: [CodecType; 4] = [CodecType::H264, CodecType::VP8, CodecType::VP9, CodecType::AV1];

    /// Encoding name as it appears in `a=rtpmap` lines.
    pub fn encoding_name(self) -> &'static str {
        match self {
            Self::H264 => "H264",
            Self::VP8 => "VP8",
            Self::VP9 => "VP9",
            Self::AV1 => "AV1",
        }
    }
}

// MARK: - VideoMetadata

/// Metadata of one recorded file, as returned by a METADATA query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoMetadata {
    pub duration: String,
    /// Base64 thumbnail.
    pub image: String,
    pub path: String,
}

// MARK: - SFU room notifications

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomInfo {
    pub sid: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quality {
    pub sid: String,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Speaking {
    pub sid: String,
    pub level: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParticipantState {
    Joining,
    Joined,
    Active,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub sid: String,
    pub id: String,
    pub state: ParticipantState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_labels_map_both_ways() {
        for id in ChannelId::ALL {
            assert_eq!(ChannelId::from_label(id.label()), Some(id));
        }
        assert_eq!(ChannelId::from_label("video"), None);
        assert_eq!(ChannelId::Reliable.stream_id(), 2);
    }

    #[test]
    fn ice_candidate_uses_browser_field_names() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: IceCandidateInit = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));

        let back = serde_json::to_string(&c).unwrap();
        assert!(back.contains("\"sdpMLineIndex\":0"));
        assert!(!back.contains("usernameFragment"));
    }

    #[test]
    fn session_description_type_is_lowercase() {
        let desc = SessionDescription::answer("v=0\r\n");
        let json = serde_json::to_string(&desc).unwrap();
        assert_eq!(json, r#"{"type":"answer","sdp":"v=0\r\n"}"#);
    }

    #[test]
    fn ice_server_accepts_single_url() {
        let server: IceServer =
            serde_json::from_str(r#"{"urls":"turn:relay.example:3478","username":"u","credential":"p"}"#).unwrap();
        assert_eq!(server.urls, vec!["turn:relay.example:3478".to_string()]);
        assert_eq!(server.username.as_deref(), Some("u"));
    }

    #[test]
    fn participant_state_is_screaming_case() {
        let p: Participant =
            serde_json::from_str(r#"{"sid":"PA_1","id":"cam","state":"ACTIVE"}"#).unwrap();
        assert_eq!(p.state, ParticipantState::Active);
    }
}
