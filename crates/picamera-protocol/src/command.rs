//! Outbound requests carried on the Command channel.

use bytes::Bytes;
use chrono::NaiveDateTime;
use picamera_core::PropertyValue;
use serde::Serialize;

use crate::codec::{encode, CmdType};

pub const DEFAULT_SNAPSHOT_QUALITY: i32 = 30;
const METADATA_TIME_FORMAT: &str = "%Y%m%d_%H%M%S";

// ── MetadataSelector ─────────────────────────────────────────────────────────

/// Which recording(s) a METADATA query asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataSelector {
    /// The most recent recording.
    Latest,
    /// Up to 8 recordings older than the given file.
    Before(String),
    /// The recording closest to a wall-clock time.
    At(NaiveDateTime),
}

impl MetadataSelector {
    fn command(&self) -> u8 {
        match self {
            Self::Latest => 0,
            Self::Before(_) => 1,
            Self::At(_) => 2,
        }
    }

    fn message(&self) -> String {
        match self {
            Self::Latest => String::new(),
            Self::Before(path) => path.clone(),
            Self::At(time) => time.format(METADATA_TIME_FORMAT).to_string(),
        }
    }
}

#[derive(Serialize)]
struct MetadataQuery {
    command: u8,
    message: String,
}

#[derive(Serialize)]
struct CameraControl {
    key: u32,
    value: PropertyValue,
}

// ── Command ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// `false` notifies the camera that the client is leaving.
    Connect(bool),
    /// JPEG quality; clamped to 0..=100 when encoded.
    Snapshot(i32),
    QueryMetadata(MetadataSelector),
    TransferFile(String),
    ControlCamera { key: u32, value: PropertyValue },
    Custom(Bytes),
}

impl Command {
    pub fn kind(&self) -> CmdType {
        match self {
            Self::Connect(_) => CmdType::Connect,
            Self::Snapshot(_) => CmdType::Snapshot,
            Self::QueryMetadata(_) => CmdType::Metadata,
            Self::TransferFile(_) => CmdType::Recording,
            Self::ControlCamera { .. } => CmdType::CameraControl,
            Self::Custom(_) => CmdType::Custom,
        }
    }

    /// Serialize into one tagged wire message.
    pub fn to_message(&self) -> Bytes {
        let body: Vec<u8> = match self {
            Self::Connect(connect) => vec![u8::from(*connect)],
            Self::Snapshot(quality) => vec![clamp_quality(*quality)],
            Self::QueryMetadata(selector) => json_body(&MetadataQuery {
                command: selector.command(),
                message: selector.message(),
            }),
            Self::TransferFile(path) => path.as_bytes().to_vec(),
            Self::ControlCamera { key, value } => json_body(&CameraControl {
                key: *key,
                value: *value,
            }),
            Self::Custom(data) => return encode(CmdType::Custom, data),
        };
        encode(self.kind(), &body)
    }
}

pub fn clamp_quality(quality: i32) -> u8 {
    quality.clamp(0, 100) as u8
}

fn json_body<T: Serialize>(value: &T) -> Vec<u8> {
    // Plain structs of integers and strings always serialize.
    serde_json::to_vec(value).unwrap_or_default()
}
