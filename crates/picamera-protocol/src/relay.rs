//! SFU data packets.
//!
//! On the relay path every data channel message is wrapped in a LiveKit
//! `DataPacket`. Only the `user` variant carries camera traffic; its
//! `payload` is a regular tagged message (see [`crate::codec`]). Fields of
//! other packet variants are skipped on decode.

use bytes::Bytes;
use picamera_core::ProtocolError;
use prost::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum DataPacketKind {
    Reliable = 0,
    Lossy = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DataPacket {
    #[prost(enumeration = "DataPacketKind", tag = "1")]
    pub kind: i32,
    #[prost(string, tag = "4")]
    pub participant_identity: ::prost::alloc::string::String,
    #[prost(string, repeated, tag = "5")]
    pub destination_identities: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(oneof = "data_packet::Value", tags = "2")]
    pub value: ::core::option::Option<data_packet::Value>,
}

pub mod data_packet {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Value {
        #[prost(message, tag = "2")]
        User(super::UserPacket),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UserPacket {
    #[prost(string, tag = "1")]
    pub participant_sid: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub participant_identity: ::prost::alloc::string::String,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
    #[prost(string, repeated, tag = "3")]
    pub destination_sids: ::prost::alloc::vec::Vec<::prost::alloc::string::String>,
    #[prost(string, optional, tag = "4")]
    pub topic: ::core::option::Option<::prost::alloc::string::String>,
}

/// Wrap a tagged message into a `user` data packet.
pub fn wrap_user(kind: DataPacketKind, payload: &[u8], topic: Option<&str>) -> Bytes {
    let packet = DataPacket {
        kind: kind as i32,
        value: Some(data_packet::Value::User(UserPacket {
            payload: payload.to_vec(),
            topic: topic.map(str::to_owned),
            ..Default::default()
        })),
        ..Default::default()
    };
    Bytes::from(packet.encode_to_vec())
}

/// Extract the `user` payload. `Ok(None)` for packets of any other variant.
pub fn unwrap_user(frame: &[u8]) -> Result<Option<Bytes>, ProtocolError> {
    let packet = DataPacket::decode(frame).map_err(|e| ProtocolError::MalformedPayload {
        reason: format!("relay packet: {e}"),
    })?;
    Ok(match packet.value {
        Some(data_packet::Value::User(user)) => Some(Bytes::from(user.payload)),
        None => None,
    })
}
