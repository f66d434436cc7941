use std::collections::HashMap;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};
use crate::payment::Metadata;

pub const TRIAL_DAYS: i64 = 3;
pub const REFERRAL_BONUS_DAYS: i64 = 7;
/// Longest period a single product order may cover.
pub const MAX_ORDER_DAYS: i64 = 3650;

lazy_static! {
    /// Subscription period (days) -> price, RUB
    static ref PRICES: HashMap<i64, i64> = {
        let mut m = HashMap::new();
        m.insert(7, 0);
        m.insert(30, 89);
        m.insert(90, 249);
        m.insert(180, 449);
        m.insert(360, 849);
        m
    };
}

pub fn price_for(days: i64) -> ApiResult<i64> {
    PRICES
        .get(&days)
        .copied()
        .ok_or_else(|| ApiError::validation("Invalid subscription period"))
}

pub fn check_order_days(days: i64) -> ApiResult<i64> {
    if (1..=MAX_ORDER_DAYS).contains(&days) {
        Ok(days)
    } else {
        Err(ApiError::validation(format!(
            "Days must be between 1 and {}",
            MAX_ORDER_DAYS
        )))
    }
}

/// Orders are keyed by the first word of the product name ("Spotify Premium" -> "Spotify").
pub fn product_key(product: &str) -> &str {
    product.split_whitespace().next().unwrap_or(product)
}

#[derive(Debug, Deserialize)]
pub struct AuthRequest {
    pub init_data: String,
}

#[derive(Debug, Serialize)]
pub struct AuthUser {
    pub telegram_id: i64,
    pub first_name: String,
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: AuthUser,
}

#[derive(Debug, Deserialize)]
pub struct TgQuery {
    pub tg_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct BuySubscriptionRequest {
    pub tg_id: i64,
    pub days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ExtendSubscriptionRequest {
    pub tg_id: i64,
    pub days: i64,
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PaymentIdRequest {
    pub payment_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyProductRequest {
    pub tg_id: i64,
    pub product: String,
    pub login: String,
    pub password: String,
    pub days: i64,
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TrialRequest {
    pub tg_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SubmitOrderRequest {
    pub telegram_id: i64,
    pub product: String,
    pub login: String,
    pub password: String,
    pub days: i64,
}

#[derive(Debug, Deserialize)]
pub struct ReferralBonusRequest {
    pub tg_id: i64,
    pub referee_id: i64,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminDeleteRequest {
    pub panel: String,
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct SubscriptionView {
    pub email: String,
    pub panel: String,
    pub expiry_date: String,
    pub is_expired: bool,
    pub sub_url: String,
    pub redirect_url: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentCreated {
    pub email: String,
    pub payment_url: String,
    pub payment_id: String,
    /// Projected expiry once the payment is confirmed
    pub expiry_date: String,
}

#[derive(Debug, Serialize)]
pub struct PaymentState {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ProductPaymentCreated {
    pub payment_url: String,
    pub payment_id: String,
}

#[derive(Debug, Serialize)]
pub struct ProductPaymentState {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiry_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct TrialActivated {
    pub email: String,
    pub panel: String,
    pub key: String,
    pub sub_url: String,
    pub expiry_date: String,
    pub days: i64,
}

#[derive(Debug, Serialize)]
pub struct OrderSubmitted {
    pub status: String,
    pub product: String,
    pub expiry_date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BonusAction {
    Created,
    Extended,
}

#[derive(Debug, Serialize)]
pub struct BonusApplied {
    pub action: BonusAction,
    pub email: String,
    pub expiry_date: String,
}

#[derive(Debug, Serialize)]
pub struct ReauthOutcome {
    pub panel: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Removed {
    pub email: String,
    pub removed: usize,
}

fn field<'a>(metadata: &'a Metadata, key: &str) -> ApiResult<&'a str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ApiError::validation(format!("payment metadata lacks {}", key)))
}

fn number(metadata: &Metadata, key: &str) -> ApiResult<i64> {
    field(metadata, key)?
        .parse()
        .map_err(|_| ApiError::validation(format!("payment metadata {} is not a number", key)))
}

/// Subscription purchase or renewal, carried through the gateway as metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOrder {
    pub tg_id: i64,
    pub days: i64,
    pub email: String,
    pub is_extension: bool,
}

impl SubscriptionOrder {
    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert("tg_id".into(), self.tg_id.to_string());
        m.insert("days".into(), self.days.to_string());
        m.insert("email".into(), self.email.clone());
        m.insert("is_extension".into(), self.is_extension.to_string());
        m
    }

    pub fn from_metadata(metadata: &Metadata) -> ApiResult<Self> {
        Ok(Self {
            tg_id: number(metadata, "tg_id")?,
            days: check_order_days(number(metadata, "days")?)?,
            email: field(metadata, "email")?.to_string(),
            is_extension: metadata
                .get("is_extension")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProductOrder {
    pub tg_id: i64,
    pub product: String,
    pub login: String,
    pub password: String,
    pub days: i64,
}

impl ProductOrder {
    pub fn to_metadata(&self) -> Metadata {
        let mut m = Metadata::new();
        m.insert("tg_id".into(), self.tg_id.to_string());
        m.insert("product".into(), self.product.clone());
        m.insert("login".into(), self.login.clone());
        m.insert("password".into(), self.password.clone());
        m.insert("days".into(), self.days.to_string());
        m
    }

    pub fn from_metadata(metadata: &Metadata) -> ApiResult<Self> {
        Ok(Self {
            tg_id: number(metadata, "tg_id")?,
            product: field(metadata, "product")?.to_string(),
            login: field(metadata, "login")?.to_string(),
            password: field(metadata, "password")?.to_string(),
            days: check_order_days(number(metadata, "days")?)?,
        })
    }
}
