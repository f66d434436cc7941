//! 3x-ui panel model and the gateway trait every panel connection implements.

pub mod registry;
pub mod selector;
pub mod xui;

use async_trait::async_trait;
use serde::{de, Deserialize, Deserializer, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub use registry::{LinkBuilder, Panel, PanelLinks, PanelRegistry, PanelRole};

/// Flow tag and connection limit re-asserted on every client write.
pub const CLIENT_FLOW: &str = "xtls-rprx-vision";
pub const CLIENT_LIMIT_IP: u32 = 5;

#[derive(Debug, Error)]
pub enum PanelError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode: {0}")]
    Decode(#[from] serde_json::Error),

    /// The panel answered `success: false`
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("config: {0}")]
    Config(String),
}

/// One provisioned VPN identity on a panel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub flow: String,
    #[serde(rename = "limitIp", default)]
    pub limit_ip: u32,
    #[serde(rename = "totalGB", default)]
    pub total_gb: i64,
    /// Milliseconds since epoch, UTC
    #[serde(rename = "expiryTime", default)]
    pub expiry_time: i64,
    #[serde(rename = "tgId", default, deserialize_with = "lenient_tg_id")]
    pub tg_id: i64,
    #[serde(rename = "subId", default)]
    pub sub_id: String,
    #[serde(default)]
    pub reset: i64,
}

impl Client {
    pub fn provision(tg_id: i64, email: &str, sub_id: &str, expiry_time: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            enable: true,
            flow: CLIENT_FLOW.to_string(),
            limit_ip: CLIENT_LIMIT_IP,
            total_gb: 0,
            expiry_time,
            tg_id,
            sub_id: sub_id.to_string(),
            reset: 0,
        }
    }

    /// Copy with a new expiry. Panel updates replace the whole client, so
    /// identity, flow, enable flag and limit are written back explicitly.
    pub fn renewed(&self, tg_id: i64, sub_id: &str, expiry_time: i64) -> Self {
        Self {
            id: self.id.clone(),
            email: self.email.clone(),
            enable: true,
            flow: CLIENT_FLOW.to_string(),
            limit_ip: CLIENT_LIMIT_IP,
            total_gb: self.total_gb,
            expiry_time,
            tg_id,
            sub_id: sub_id.to_string(),
            reset: self.reset,
        }
    }
}

// 3x-ui has shipped tgId both as a number and as a (possibly empty) string.
fn lenient_tg_id<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.trim().is_empty() => Ok(0),
        Raw::Text(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InboundSettings {
    #[serde(default)]
    pub clients: Vec<Client>,
}

/// A traffic group on a panel. The panel sends `settings` as a JSON string.
#[derive(Debug, Clone, Deserialize)]
pub struct Inbound {
    pub id: i64,
    #[serde(deserialize_with = "settings_from_str")]
    pub settings: InboundSettings,
}

fn settings_from_str<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<InboundSettings, D::Error> {
    let raw = String::deserialize(deserializer)?;
    if raw.trim().is_empty() {
        return Ok(InboundSettings::default());
    }
    serde_json::from_str(&raw).map_err(de::Error::custom)
}

/// A client together with the inbound group holding it.
#[derive(Debug, Clone, PartialEq)]
pub struct LocatedClient {
    pub inbound_id: i64,
    pub client: Client,
}

#[async_trait]
pub trait PanelApi: Send + Sync {
    /// Establish (or re-establish) the authenticated session.
    async fn login(&self) -> Result<(), PanelError>;

    async fn list_inbounds(&self) -> Result<Vec<Inbound>, PanelError>;

    async fn add_client(&self, inbound_id: i64, client: &Client) -> Result<(), PanelError>;

    async fn update_client(
        &self,
        inbound_id: i64,
        client_id: &str,
        client: &Client,
    ) -> Result<(), PanelError>;

    async fn get_client_by_email(&self, email: &str) -> Result<Option<LocatedClient>, PanelError>;

    async fn delete_client(&self, inbound_id: i64, client_id: &str) -> Result<(), PanelError>;
}
