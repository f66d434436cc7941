use std::env;
use std::fs;

use log::info;
use serde::Deserialize;
use thiserror::Error;

use crate::panel::LinkBuilder;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("environment variable {0} is not set")]
    Missing(&'static str),

    #[error("environment variable {name} is invalid: {reason}")]
    Invalid { name: &'static str, reason: String },

    #[error("cannot read panel config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("cannot parse panel config {path}: {source}")]
    Toml {
        path: String,
        source: toml::de::Error,
    },
}

/// Process settings, read from the environment (`.env` is loaded first).
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    /// Token of the Mini-App bot; keys the `initData` signature
    pub bot_token: String,
    /// Bot that posts order notifications to the admins
    pub order_bot_token: String,
    pub admin_chat_ids: Vec<i64>,
    pub yookassa_shop_id: String,
    pub yookassa_secret_key: String,
    pub payment_return_url: String,
    pub base_redirect_url: String,
    pub allowed_origins: Vec<String>,
    pub admin_api_token: Option<String>,
    pub panels_path: String,
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn list(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let admin_chat_ids = list(&env::var("ADMIN_CHAT_IDS").unwrap_or_default())
            .map(|id| {
                id.parse().map_err(|_| ConfigError::Invalid {
                    name: "ADMIN_CHAT_IDS",
                    reason: format!("{:?} is not a chat id", id),
                })
            })
            .collect::<Result<Vec<i64>, _>>()?;

        Ok(Self {
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            database_url: required("DATABASE_URL")?,
            db_max_connections: parsed("DB_MAX_CONNECTIONS", 5)?,
            db_min_connections: parsed("DB_MIN_CONNECTIONS", 2)?,
            bot_token: required("BOT_TOKEN")?,
            order_bot_token: required("ORDER_BOT_TOKEN")?,
            admin_chat_ids,
            yookassa_shop_id: required("YOOKASSA_SHOP_ID")?,
            yookassa_secret_key: required("YOOKASSA_SECRET_KEY")?,
            payment_return_url: required("PAYMENT_RETURN_URL")?,
            base_redirect_url: required("BASE_REDIRECT_URL")?,
            allowed_origins: list(&env::var("ALLOWED_ORIGINS").unwrap_or_default())
                .map(str::to_string)
                .collect(),
            admin_api_token: env::var("ADMIN_API_TOKEN").ok().filter(|t| !t.is_empty()),
            panels_path: env::var("PANELS_CONFIG").unwrap_or_else(|_| "panels.toml".to_string()),
        })
    }
}

/// One 3x-ui panel in `panels.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct PanelConfig {
    pub name: String,
    pub host: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub login_secret: Option<String>,
    #[serde(default)]
    pub totp_secret: Option<String>,
    #[serde(default = "default_inbound_id")]
    pub inbound_id: i64,
    /// Connection key builder (primary panels)
    #[serde(default)]
    pub key: Option<LinkBuilder>,
    /// Subscription URL builder (primary panels)
    #[serde(default)]
    pub subscription: Option<LinkBuilder>,
}

fn default_inbound_id() -> i64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanelsConfig {
    #[serde(default)]
    pub panels: Vec<PanelConfig>,
    #[serde(default)]
    pub mirrors: Vec<PanelConfig>,
}

impl PanelsConfig {
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_string(),
            source,
        })?;
        let config = Self::parse(&contents).map_err(|source| ConfigError::Toml {
            path: path.to_string(),
            source,
        })?;
        info!(
            "Loaded {} primary and {} mirror panels from {}",
            config.panels.len(),
            config.mirrors.len(),
            path
        );
        Ok(config)
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }
}
