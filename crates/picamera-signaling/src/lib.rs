pub mod adapter;
pub mod broker;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod mqtt;
pub mod socket;
pub mod websocket;

pub use adapter::{OutboundSignal, SignalMessage, SignalingAdapter, SignalingEvent, SignalingEventSender};
pub use broker::RumqttConnector;
pub use mqtt::{BrokerConnector, BrokerEvent, BrokerLink, BrokerRequest, BrokerSettings, MqttSignaling, Topic};
pub use socket::TungsteniteConnector;
pub use websocket::{Action, Envelope, SocketConnector, SocketEvent, SocketLink, SocketRequest, WebSocketSignaling};
