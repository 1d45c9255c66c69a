use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::PiCameraError;
use crate::types::{CodecType, IceServer, IpcMode};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const ICE_CANDIDATE_POOL_SIZE: u8 = 10;

// MARK: - Enums

/// Which signaling transport (and therefore topology) to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalingKind {
    /// Direct peer-to-peer, negotiated over an MQTT broker.
    #[default]
    Mqtt,
    /// SFU publisher/subscriber legs, negotiated over a WebSocket proxy.
    Websocket,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MqttProtocol {
    Mqtt,
    Mqtts,
    Ws,
    #[default]
    Wss,
}

impl MqttProtocol {
    pub fn scheme(self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Mqtts => "mqtts",
            Self::Ws => "ws",
            Self::Wss => "wss",
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Self::Ws | Self::Wss)
    }

    pub fn is_tls(self) -> bool {
        matches!(self, Self::Mqtts | Self::Wss)
    }

    /// Port used when none is configured.
    pub fn default_port(self) -> u16 {
        match self {
            Self::Mqtt => 1883,
            Self::Mqtts => 8883,
            Self::Ws => 80,
            Self::Wss => 443,
        }
    }
}

// MARK: - PiCameraOptions

/// Connection options. Accepts the JS client's camelCase keys as well as
/// snake_case.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PiCameraOptions {
    pub signaling: SignalingKind,

    // broker
    #[serde(alias = "deviceUid")]
    pub device_uid: Option<String>,
    #[serde(alias = "mqttHost")]
    pub mqtt_host: Option<String>,
    #[serde(alias = "mqttPath")]
    pub mqtt_path: String,
    #[serde(alias = "mqttPort")]
    pub mqtt_port: Option<u16>,
    #[serde(alias = "mqttProtocol")]
    pub mqtt_protocol: MqttProtocol,
    #[serde(alias = "mqttUsername")]
    pub mqtt_username: Option<String>,
    #[serde(alias = "mqttPassword")]
    pub mqtt_password: Option<String>,

    // socket
    #[serde(alias = "websocketUrl")]
    pub websocket_url: Option<String>,
    #[serde(alias = "apiKey")]
    pub api_key: Option<String>,
    #[serde(alias = "userId")]
    pub user_id: Option<String>,
    #[serde(alias = "roomId")]
    pub room_id: Option<String>,

    // ice
    #[serde(alias = "stunUrls")]
    pub stun_urls: Vec<String>,
    #[serde(alias = "turnUrl")]
    pub turn_url: Option<String>,
    #[serde(alias = "turnUsername")]
    pub turn_username: Option<String>,
    #[serde(alias = "turnPassword")]
    pub turn_password: Option<String>,

    /// Connection watchdog in milliseconds; 0 disables it.
    #[serde(alias = "timeoutMs")]
    pub timeout: u64,
    #[serde(alias = "datachannelOnly")]
    pub datachannel_only: bool,
    #[serde(alias = "ipcMode")]
    pub ipc_mode: Option<IpcMode>,
    #[serde(alias = "isMicOn")]
    pub is_mic_on: bool,
    #[serde(alias = "isSpeakerOn")]
    pub is_speaker_on: bool,
    pub codec: Option<CodecType>,
}

impl Default for PiCameraOptions {
    fn default() -> Self {
        Self {
            signaling: SignalingKind::Mqtt,
            device_uid: None,
            mqtt_host: None,
            mqtt_path: String::new(),
            mqtt_port: None,
            mqtt_protocol: MqttProtocol::Wss,
            mqtt_username: None,
            mqtt_password: None,
            websocket_url: None,
            api_key: None,
            user_id: None,
            room_id: None,
            stun_urls: Vec::new(),
            turn_url: None,
            turn_username: None,
            turn_password: None,
            timeout: DEFAULT_TIMEOUT_MS,
            datachannel_only: false,
            ipc_mode: None,
            is_mic_on: true,
            is_speaker_on: true,
            codec: None,
        }
    }
}

impl PiCameraOptions {
    /// Watchdog duration, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout > 0).then(|| Duration::from_millis(self.timeout))
    }

    /// ICE servers for the direct topology: one entry carrying every STUN url,
    /// plus a TURN entry when url and both credentials are present.
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let mut servers = Vec::new();
        if !self.stun_urls.is_empty() {
            servers.push(IceServer {
                urls: self.stun_urls.clone(),
                ..Default::default()
            });
        }
        if let (Some(url), Some(username), Some(password)) =
            (&self.turn_url, &self.turn_username, &self.turn_password)
        {
            servers.push(IceServer {
                urls: vec![url.clone()],
                username: Some(username.clone()),
                credential: Some(password.clone()),
            });
        }
        servers
    }

    pub fn validate(&self) -> Result<(), PiCameraError> {
        let missing = |field: &str| PiCameraError::ConfigurationInvalid {
            reason: format!("{field} is required for {:?} signaling", self.signaling),
        };
        match self.signaling {
            SignalingKind::Mqtt => {
                if is_blank(&self.device_uid) {
                    return Err(missing("device_uid"));
                }
                if is_blank(&self.mqtt_host) {
                    return Err(missing("mqtt_host"));
                }
            }
            SignalingKind::Websocket => {
                if is_blank(&self.websocket_url) {
                    return Err(missing("websocket_url"));
                }
            }
        }
        Ok(())
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().map_or(true, |s| s.trim().is_empty())
}
