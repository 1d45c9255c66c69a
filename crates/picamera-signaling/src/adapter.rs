//! The transport-independent signaling contract.
//!
//! ```text
//!  orchestrator ──send(OutboundSignal)──► adapter ──► broker / relay proxy
//!  orchestrator ◄──SignalingEvent──────── adapter ◄── broker / relay proxy
//! ```
//!
//! Both backends report `Ready` exactly once per successful connect, then
//! decoded [`SignalMessage`]s, then `Closed` when the link goes away.

use async_trait::async_trait;
use picamera_core::{
    IceCandidateInit, IceServer, Participant, Quality, RoomInfo, SessionDescription, SessionRole,
    SignalingError, Speaking,
};
use tokio::sync::mpsc;

pub type SignalingEventSender = mpsc::UnboundedSender<SignalingEvent>;

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// The link is established; fires once per connect.
    Ready,
    Message(SignalMessage),
    /// The link went away. `reason` is set when it dropped on an error.
    Closed { reason: Option<String> },
}

/// Inbound negotiation and room messages, already decoded.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalMessage {
    Offer(SessionDescription),
    Answer(SessionDescription),
    /// A remote candidate for the session playing `target`.
    RemoteCandidate {
        target: SessionRole,
        candidate: IceCandidateInit,
    },
    /// Relay join: the ICE server to use for both SFU legs.
    Join(IceServer),
    TrackPublished,
    RoomInfo(RoomInfo),
    Quality(Vec<Quality>),
    Speaking(Vec<Speaking>),
    Participants(Vec<Participant>),
    Leave,
    Error(String),
    Info(String),
}

/// What the orchestrator sends through the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundSignal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate {
        role: SessionRole,
        candidate: IceCandidateInit,
    },
}

#[async_trait]
pub trait SignalingAdapter: Send {
    /// Start connecting. Events, starting with `Ready`, arrive on `events`.
    async fn connect(&mut self, events: SignalingEventSender) -> Result<(), SignalingError>;

    /// Tear the link down. Safe to call when not connected.
    async fn disconnect(&mut self);

    /// Returns `Err(NotConnected)` when the link is not up.
    async fn send(&mut self, signal: OutboundSignal) -> Result<(), SignalingError>;

    fn is_connected(&self) -> bool;
}
