//! rumqttc-backed [`BrokerConnector`].

use async_trait::async_trait;
use picamera_core::SignalingError;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport,
};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::mqtt::{BrokerConnector, BrokerEvent, BrokerLink, BrokerRequest, BrokerSettings};

/// Capacity of rumqttc's request queue.
const REQUEST_CAPACITY: usize = 16;
/// Answers and camera candidates.
const SUBSCRIBE_QOS: QoS = QoS::ExactlyOnce;
/// Offers and local candidates.
const PUBLISH_QOS: QoS = QoS::AtMostOnce;

#[derive(Debug, Default, Clone, Copy)]
pub struct RumqttConnector;

fn mqtt_options(settings: &BrokerSettings) -> MqttOptions {
    let port = settings.port();
    let tls = settings.protocol.is_tls();
    let mut options = if settings.protocol.is_websocket() {
        // rumqttc expects the full url as "host" for websocket transports
        let mut options = MqttOptions::new(&settings.client_id, settings.websocket_url(), port);
        options.set_transport(if tls {
            Transport::wss_with_default_config()
        } else {
            Transport::Ws
        });
        options
    } else {
        let mut options = MqttOptions::new(&settings.client_id, &settings.host, port);
        if tls {
            options.set_transport(Transport::tls_with_default_config());
        }
        options
    };
    options.set_keep_alive(settings.keep_alive);
    options.set_clean_session(true);
    if let Some(username) = &settings.username {
        options.set_credentials(username, settings.password.clone().unwrap_or_default());
    }
    options
}

#[async_trait]
impl BrokerConnector for RumqttConnector {
    async fn open(
        &self,
        settings: &BrokerSettings,
        topics: &[String],
    ) -> Result<BrokerLink, SignalingError> {
        let (client, eventloop) = AsyncClient::new(mqtt_options(settings), REQUEST_CAPACITY);
        // queued now, sent right after CONNACK
        for topic in topics {
            client
                .subscribe(topic.as_str(), SUBSCRIBE_QOS)
                .await
                .map_err(|e| SignalingError::ConnectionFailed {
                    reason: e.to_string(),
                })?;
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        tokio::spawn(poll_loop(eventloop, event_tx));
        tokio::spawn(request_loop(client, request_rx));

        Ok(BrokerLink {
            requests: request_tx,
            events: event_rx,
        })
    }
}

async fn poll_loop(mut eventloop: EventLoop, events: mpsc::UnboundedSender<BrokerEvent>) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    break Some(format!("broker refused connection: {:?}", ack.code));
                }
                if events.send(BrokerEvent::Connected).is_err() {
                    return;
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let event = BrokerEvent::Publish {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if events.send(event).is_err() {
                    return;
                }
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break None,
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT event loop stopped: {}", e);
                break Some(e.to_string());
            }
        }
    };
    let _ = events.send(BrokerEvent::Disconnected { reason });
}

async fn request_loop(client: AsyncClient, mut requests: mpsc::UnboundedReceiver<BrokerRequest>) {
    while let Some(request) = requests.recv().await {
        let result = match request {
            BrokerRequest::Publish { topic, payload } => {
                client
                    .publish(topic, PUBLISH_QOS, false, payload.to_vec())
                    .await
            }
            BrokerRequest::Unsubscribe(topic) => client.unsubscribe(topic).await,
            BrokerRequest::Disconnect => {
                if let Err(e) = client.disconnect().await {
                    debug!("MQTT disconnect: {}", e);
                }
                return;
            }
        };
        if let Err(e) = result {
            warn!("MQTT request failed: {}", e);
        }
    }
    // adapter dropped without disconnecting
    let _ = client.disconnect().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use picamera_core::MqttProtocol;
    use std::time::Duration;

    fn settings(protocol: MqttProtocol) -> BrokerSettings {
        BrokerSettings {
            client_id: "client".into(),
            host: "broker.example".into(),
            port: None,
            path: "/mqtt".into(),
            protocol,
            username: Some("user".into()),
            password: None,
            keep_alive: Duration::from_secs(20),
        }
    }

    #[test]
    fn websocket_transport_uses_full_url() {
        let options = mqtt_options(&settings(MqttProtocol::Ws));
        let (host, port) = options.broker_address();
        assert_eq!(host, "ws://broker.example:80/mqtt");
        assert_eq!(port, 80);
        assert_eq!(options.keep_alive(), Duration::from_secs(20));
        assert!(options.clean_session());
    }

    #[test]
    fn publishes_fire_and_forget_subscribes_exactly_once() {
        assert_eq!(PUBLISH_QOS, QoS::AtMostOnce);
        assert_eq!(SUBSCRIBE_QOS, QoS::ExactlyOnce);
    }

    #[test]
    fn plain_tcp_uses_bare_host() {
        let options = mqtt_options(&settings(MqttProtocol::Mqtt));
        assert_eq!(options.broker_address(), ("broker.example".to_string(), 1883));
    }
}
