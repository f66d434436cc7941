use std::collections::BTreeMap;

use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use thiserror::Error;
use uuid::Uuid;

/// Opaque key-value bag the gateway hands back verbatim.
pub type Metadata = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum PaymentError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),

    #[error("gateway answered {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("payment {0} has no confirmation url")]
    MissingConfirmation(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    WaitingForCapture,
    Succeeded,
    Canceled,
    #[serde(other)]
    Unknown,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::WaitingForCapture => "waiting_for_capture",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Amount {
    pub value: String,
    pub currency: String,
}

impl Amount {
    pub fn rub(rubles: i64) -> Self {
        Self {
            value: format!("{}.00", rubles),
            currency: "RUB".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Confirmation {
    #[serde(default)]
    pub confirmation_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Payment {
    pub id: String,
    pub status: PaymentStatus,
    pub amount: Amount,
    #[serde(default)]
    pub confirmation: Option<Confirmation>,
    #[serde(default, deserialize_with = "lenient_metadata")]
    pub metadata: Metadata,
}

impl Payment {
    pub fn confirmation_url(&self) -> Result<&str, PaymentError> {
        self.confirmation
            .as_ref()
            .and_then(|c| c.confirmation_url.as_deref())
            .ok_or_else(|| PaymentError::MissingConfirmation(self.id.clone()))
    }
}

// Metadata values come back as strings, but tolerate scalars anyway.
fn lenient_metadata<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Metadata, D::Error> {
    let raw: Option<BTreeMap<String, serde_json::Value>> = Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(k, v)| {
            let v = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, v)
        })
        .collect())
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub amount: Amount,
    pub description: String,
    pub metadata: Metadata,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, PaymentError>;

    async fn find_payment(&self, id: &str) -> Result<Payment, PaymentError>;

    async fn cancel_payment(&self, id: &str) -> Result<Payment, PaymentError>;
}

const YOOKASSA_API: &str = "https://api.yookassa.ru/v3";

/// YooKassa REST client (`/v3/payments`), basic auth with shop id + secret key.
pub struct YooKassa {
    http: reqwest::Client,
    base_url: String,
    shop_id: String,
    secret_key: String,
    return_url: String,
}

impl YooKassa {
    pub fn new(shop_id: String, secret_key: String, return_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: YOOKASSA_API.to_string(),
            shop_id,
            secret_key,
            return_url,
        }
    }

    async fn parse(resp: reqwest::Response) -> Result<Payment, PaymentError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(PaymentError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for YooKassa {
    async fn create_payment(&self, payment: NewPayment) -> Result<Payment, PaymentError> {
        let body = json!({
            "amount": payment.amount,
            "confirmation": { "type": "redirect", "return_url": self.return_url },
            "capture": true,
            "description": payment.description,
            "metadata": payment.metadata,
        });
        let resp = self
            .http
            .post(format!("{}/payments", self.base_url))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&body)
            .send()
            .await?;
        let created = Self::parse(resp).await?;
        info!("Payment {} created ({:?})", created.id, created.status);
        Ok(created)
    }

    async fn find_payment(&self, id: &str) -> Result<Payment, PaymentError> {
        let resp = self
            .http
            .get(format!("{}/payments/{}", self.base_url, id))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn cancel_payment(&self, id: &str) -> Result<Payment, PaymentError> {
        let resp = self
            .http
            .post(format!("{}/payments/{}/cancel", self.base_url, id))
            .basic_auth(&self.shop_id, Some(&self.secret_key))
            .header("Idempotence-Key", Uuid::new_v4().to_string())
            .json(&json!({}))
            .send()
            .await?;
        Self::parse(resp).await
    }
}
