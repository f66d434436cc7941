use async_trait::async_trait;
use log::{error, info};
use serde_json::json;

/// Fire-and-forget outbound messages to the admin channel.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, text: &str);
}

/// Posts through the Telegram Bot API to each configured admin chat.
pub struct TelegramNotifier {
    http: reqwest::Client,
    bot_token: String,
    chat_ids: Vec<i64>,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_ids: Vec<i64>) -> Self {
        Self {
            http: reqwest::Client::new(),
            bot_token,
            chat_ids,
        }
    }

    async fn send(&self, chat_id: i64, text: &str) -> Result<(), reqwest::Error> {
        self.http
            .post(format!(
                "https://api.telegram.org/bot{}/sendMessage",
                self.bot_token
            ))
            .json(&json!({ "chat_id": chat_id, "text": text }))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn notify(&self, text: &str) {
        for &chat_id in &self.chat_ids {
            match self.send(chat_id, text).await {
                Ok(()) => info!("Admin notification sent to {}", chat_id),
                Err(e) => error!("Admin notification to {} failed: {}", chat_id, e),
            }
        }
    }
}
