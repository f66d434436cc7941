//! Telegram Mini-App `initData` verification and the admin token check.

use hmac::{Hmac, Mac};
use log::{error, warn};
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::ApiError;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, hmac::digest::InvalidLength> {
    let mut mac = HmacSha256::new_from_slice(key)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Check the signature of `init_data` against the bot token and return the
/// user it describes.
pub fn verify_init_data(init_data: &str, bot_token: &str) -> Result<TelegramUser, ApiError> {
    if init_data.is_empty() {
        return Err(ApiError::validation("init_data is empty"));
    }

    let mut pairs: Vec<(String, String)> = form_urlencoded::parse(init_data.as_bytes())
        .into_owned()
        .collect();

    let hash_pos = pairs
        .iter()
        .position(|(k, _)| k == "hash")
        .ok_or_else(|| ApiError::validation("Hash not found"))?;
    let (_, received_hash) = pairs.remove(hash_pos);

    pairs.sort_by(|a, b| a.0.cmp(&b.0));
    let data_check_string = pairs
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");

    let computed = hmac_sha256(b"WebAppData", bot_token.as_bytes())
        .and_then(|secret_key| hmac_sha256(&secret_key, data_check_string.as_bytes()))
        .map(hex::encode)
        .map_err(|e| ApiError::Unauthorized(format!("cannot sign init_data: {}", e)))?;

    if !bool::from(computed.as_bytes().ct_eq(received_hash.as_bytes())) {
        warn!("init_data signature mismatch");
        return Err(ApiError::Unauthorized("Invalid auth data".into()));
    }

    let user_json = pairs
        .iter()
        .find(|(k, _)| k == "user")
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::validation("User data not found"))?;

    serde_json::from_str(user_json).map_err(|e| {
        error!("init_data user JSON decode error: {}", e);
        ApiError::validation(format!("Invalid user data format: {}", e))
    })
}

/// Constant-time check of an `Authorization: Bearer <token>` value.
pub fn check_admin_token(header: Option<&str>, expected: Option<&str>) -> Result<(), ApiError> {
    let Some(expected) = expected.filter(|t| !t.is_empty()) else {
        return Err(ApiError::Unauthorized("admin API is disabled".into()));
    };
    let presented = header
        .and_then(|h| h.strip_prefix("Bearer "))
        .unwrap_or_default();
    if bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized("invalid admin token".into()))
    }
}

#[cfg(test)]
pub(crate) fn sign_init_data(fields: &[(&str, &str)], bot_token: &str) -> String {
    let mut sorted: Vec<&(&str, &str)> = fields.iter().collect();
    sorted.sort_by(|a, b| a.0.cmp(b.0));
    let dcs = sorted
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("\n");
    let secret_key = hmac_sha256(b"WebAppData", bot_token.as_bytes()).unwrap();
    let hash = hex::encode(hmac_sha256(&secret_key, dcs.as_bytes()).unwrap());

    let mut ser = form_urlencoded::Serializer::new(String::new());
    for (k, v) in fields {
        ser.append_pair(k, v);
    }
    ser.append_pair("hash", &hash);
    ser.finish()
}
