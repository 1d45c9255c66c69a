//! Tagged message framing used on every data channel.
//!
//! # Message Layout
//!
//! ```text
//! [0]      tag    u8    CmdType
//! [1..]    body   [u8]  command body, or one fragment of a chunked transfer
//! ```
//!
//! Replies of the streamed kinds (SNAPSHOT, METADATA, RECORDING, CUSTOM) are
//! sent as a sequence of messages with the same tag: first a decimal length
//! header, then raw fragments. See [`crate::receiver`].

use bytes::{BufMut, Bytes, BytesMut};
use picamera_core::ProtocolError;

// ── CmdType ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CmdType {
    Connect = 0,
    Snapshot = 1,
    Metadata = 2,
    Recording = 3,
    CameraControl = 4,
    Broadcast = 5,
    Custom = 6,
}

impl CmdType {
    pub const ALL: [CmdType; 7] = [
        CmdType::Connect,
        CmdType::Snapshot,
        CmdType::Metadata,
        CmdType::Recording,
        CmdType::CameraControl,
        CmdType::Broadcast,
        CmdType::Custom,
    ];

    pub fn tag(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for CmdType {
    type Error = ProtocolError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.tag() == tag)
            .ok_or(ProtocolError::UnknownTag { tag })
    }
}

impl std::fmt::Display for CmdType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Connect => "CONNECT",
            Self::Snapshot => "SNAPSHOT",
            Self::Metadata => "METADATA",
            Self::Recording => "RECORDING",
            Self::CameraControl => "CAMERA_CONTROL",
            Self::Broadcast => "BROADCAST",
            Self::Custom => "CUSTOM",
        };
        f.write_str(s)
    }
}

// ── Encode / decode ──────────────────────────────────────────────────────────

/// Prepend the tag byte to `body`.
pub fn encode(kind: CmdType, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + body.len());
    buf.put_u8(kind.tag());
    buf.put_slice(body);
    buf.freeze()
}

/// Split a message into its tag and body. The body shares `message`'s buffer.
pub fn decode(message: &Bytes) -> Result<(CmdType, Bytes), ProtocolError> {
    let tag = *message.first().ok_or(ProtocolError::EmptyMessage)?;
    let kind = CmdType::try_from(tag)?;
    Ok((kind, message.slice(1..)))
}
