use serde::{Deserialize, Serialize};

use super::error::GatewayError;

/// Every panel endpoint wraps its payload in this envelope.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
    pub success: bool,
    #[serde(default)]
    pub msg: String,
    pub obj: Option<T>,
}

/// A protocol listener on the gateway, with the traffic stats the panel
/// tracks per client. The credential material itself lives inside the
/// JSON-encoded `settings` string.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inbound {
    pub id: i32,
    #[serde(default)]
    pub remark: String,
    pub port: u16,
    pub protocol: String,
    pub enable: bool,
    #[serde(default)]
    pub client_stats: Vec<ClientStat>,
    pub settings: String,
}

impl Inbound {
    pub fn parsed_settings(&self) -> Result<InboundSettings, GatewayError> {
        serde_json::from_str(&self.settings).map_err(|e| {
            GatewayError::Operation(format!(
                "inbound {} has unparseable settings: {e}",
                self.id
            ))
        })
    }
}

/// Per-client traffic counters as reported by the panel. `expiry_time` is
/// milliseconds since epoch, 0 meaning "never expires". `total` is the
/// quota in bytes, 0 meaning unlimited.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStat {
    pub id: i64,
    pub inbound_id: i32,
    pub enable: bool,
    pub email: String,
    pub up: i64,
    pub down: i64,
    pub expiry_time: i64,
    pub total: i64,
}

/// One credential as embedded in an inbound's `settings` JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    /// Credential UUID.
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub flow: String,
    /// Max simultaneous connections; 0 = unlimited.
    #[serde(default)]
    pub limit_ip: i32,
    /// Quota in bytes despite the panel's field name.
    #[serde(default)]
    pub total_gb: i64,
    /// Milliseconds since epoch; 0 = never.
    #[serde(default)]
    pub expiry_time: i64,
    pub enable: bool,
    #[serde(default)]
    pub tg_id: String,
    #[serde(default)]
    pub sub_id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

impl InboundSettings {
    pub fn encode(&self) -> String {
        // Serialization of this shape cannot fail.
        serde_json::to_string(self).unwrap_or_else(|_| "{\"clients\":[]}".to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ResourceGauge {
    #[serde(default)]
    pub current: i64,
    #[serde(default)]
    pub total: i64,
}

impl ResourceGauge {
    pub fn percent(&self) -> f64 {
        if self.total <= 0 {
            return 0.0;
        }
        self.current as f64 / self.total as f64 * 100.0
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct XrayStatus {
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub version: String,
}

/// Resource snapshot from `GET /panel/api/server/status`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub cpu: f64,
    #[serde(default)]
    pub mem: ResourceGauge,
    #[serde(default)]
    pub disk: ResourceGauge,
    #[serde(default)]
    pub uptime: i64,
    #[serde(default)]
    pub xray: XrayStatus,
}
