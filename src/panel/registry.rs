use std::sync::Arc;

use log::{error, info};
use serde::Deserialize;

use super::xui::{XuiCredentials, XuiPanel};
use super::{Client, PanelApi, PanelError};
use crate::config::{PanelConfig, PanelsConfig};

/// Turns a client into a user-facing connection string. Pure.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkBuilder {
    /// `vless://` URI for a VLESS + Reality inbound
    Reality {
        host: String,
        port: u16,
        public_key: String,
        short_id: String,
        sni: String,
        #[serde(default = "default_fingerprint")]
        fingerprint: String,
        #[serde(default = "default_spider_x")]
        spider_x: String,
        label: String,
    },
    /// Shareable subscription URL: `{base_url}/{sub_id}[/{suffix}]`
    Subscription {
        base_url: String,
        #[serde(default)]
        suffix: Option<String>,
    },
}

fn default_fingerprint() -> String {
    "chrome".to_string()
}

fn default_spider_x() -> String {
    "/".to_string()
}

impl LinkBuilder {
    pub fn build(&self, client: &Client) -> String {
        match self {
            LinkBuilder::Reality {
                host,
                port,
                public_key,
                short_id,
                sni,
                fingerprint,
                spider_x,
                label,
            } => {
                let spx: String = form_urlencoded::byte_serialize(spider_x.as_bytes()).collect();
                format!(
                    "vless://{}@{}:{}?type=tcp&security=reality&pbk={}&fp={}&sni={}&sid={}&spx={}&flow={}#{}",
                    client.id, host, port, public_key, fingerprint, sni, short_id, spx, client.flow, label
                )
            }
            LinkBuilder::Subscription { base_url, suffix } => {
                let base = base_url.trim_end_matches('/');
                match suffix {
                    Some(suffix) => format!("{}/{}/{}", base, client.sub_id, suffix),
                    None => format!("{}/{}", base, client.sub_id),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PanelLinks {
    pub key: LinkBuilder,
    pub subscription: LinkBuilder,
}

pub enum PanelRole {
    /// Candidate for new subscriptions, authoritative for its clients
    Primary(PanelLinks),
    /// Replicates every client created on a primary panel
    Mirror,
}

pub struct Panel {
    pub name: String,
    /// Inbound group new clients are added to
    pub inbound_id: i64,
    pub api: Arc<dyn PanelApi>,
    pub role: PanelRole,
}

impl Panel {
    pub fn links(&self) -> Option<&PanelLinks> {
        match &self.role {
            PanelRole::Primary(links) => Some(links),
            PanelRole::Mirror => None,
        }
    }
}

/// Every panel this process talks to, constructed once at startup.
pub struct PanelRegistry {
    primaries: Vec<Panel>,
    mirrors: Vec<Panel>,
}

impl PanelRegistry {
    pub fn new(primaries: Vec<Panel>, mirrors: Vec<Panel>) -> Self {
        Self { primaries, mirrors }
    }

    pub fn from_config(config: &PanelsConfig) -> Result<Self, PanelError> {
        let primaries = config
            .panels
            .iter()
            .map(|cfg| {
                let links = match (&cfg.key, &cfg.subscription) {
                    (Some(key), Some(subscription)) => PanelLinks {
                        key: key.clone(),
                        subscription: subscription.clone(),
                    },
                    _ => {
                        return Err(PanelError::Config(format!(
                            "primary panel {} needs both `key` and `subscription` link builders",
                            cfg.name
                        )))
                    }
                };
                Self::connect(cfg, PanelRole::Primary(links))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mirrors = config
            .mirrors
            .iter()
            .map(|cfg| Self::connect(cfg, PanelRole::Mirror))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::new(primaries, mirrors))
    }

    fn connect(cfg: &PanelConfig, role: PanelRole) -> Result<Panel, PanelError> {
        let api = XuiPanel::new(XuiCredentials {
            host: cfg.host.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            login_secret: cfg.login_secret.clone(),
            totp_secret: cfg.totp_secret.clone(),
        })?;
        Ok(Panel {
            name: cfg.name.clone(),
            inbound_id: cfg.inbound_id,
            api: Arc::new(api),
            role,
        })
    }

    pub fn primaries(&self) -> &[Panel] {
        &self.primaries
    }

    pub fn mirrors(&self) -> &[Panel] {
        &self.mirrors
    }

    pub fn primary(&self, name: &str) -> Option<&Panel> {
        self.primaries.iter().find(|p| p.name == name)
    }

    /// Log in to every panel. Called once at startup and on explicit admin
    /// request; a failed login leaves that panel unusable until the next call.
    pub async fn authenticate_all(&self) -> Vec<(String, Result<(), PanelError>)> {
        let mut outcomes = Vec::with_capacity(self.primaries.len() + self.mirrors.len());
        for panel in self.primaries.iter().chain(self.mirrors.iter()) {
            let result = panel.api.login().await;
            match &result {
                Ok(()) => info!("Panel {} authenticated", panel.name),
                Err(e) => error!("Panel {} login failed: {}", panel.name, e),
            }
            outcomes.push((panel.name.clone(), result));
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> Client {
        let mut c = Client::provision(1, "DE-FRA-USER-1-abcdef", "k3x9q0w1e2r3t4y5", 0);
        c.id = "3f0c7a4e-0000-4000-8000-000000000001".into();
        c
    }

    #[test]
    fn reality_key_is_rendered() {
        let builder = LinkBuilder::Reality {
            host: "de-1.example.net".into(),
            port: 443,
            public_key: "PBK".into(),
            short_id: "bbdbd6f3".into(),
            sni: "google.com".into(),
            fingerprint: default_fingerprint(),
            spider_x: default_spider_x(),
            label: "Germany".into(),
        };
        assert_eq!(
            builder.build(&client()),
            "vless://3f0c7a4e-0000-4000-8000-000000000001@de-1.example.net:443?type=tcp&security=reality&pbk=PBK&fp=chrome&sni=google.com&sid=bbdbd6f3&spx=%2F&flow=xtls-rprx-vision#Germany"
        );
    }

    #[test]
    fn subscription_link_with_and_without_suffix() {
        let with_suffix = LinkBuilder::Subscription {
            base_url: "https://sub.example.net/sub/".into(),
            suffix: Some("WSocks".into()),
        };
        let bare = LinkBuilder::Subscription {
            base_url: "https://de-3.example.net:2096/SubDE".into(),
            suffix: None,
        };
        assert_eq!(
            with_suffix.build(&client()),
            "https://sub.example.net/sub/k3x9q0w1e2r3t4y5/WSocks"
        );
        assert_eq!(
            bare.build(&client()),
            "https://de-3.example.net:2096/SubDE/k3x9q0w1e2r3t4y5"
        );
    }

    #[test]
    fn link_builders_deserialize_by_kind() {
        let raw = r#"
            kind = "subscription"
            base_url = "https://sub.example.net/sub"
        "#;
        let builder: LinkBuilder = toml::from_str(raw).unwrap();
        assert_eq!(
            builder,
            LinkBuilder::Subscription {
                base_url: "https://sub.example.net/sub".into(),
                suffix: None
            }
        );
    }
}
