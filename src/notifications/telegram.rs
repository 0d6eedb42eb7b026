use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

use super::{AccountEvent, NotifyError, Notifier};

/// Pushes account events to a Telegram chat via the Bot API.
pub struct TelegramNotifier {
    client: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> Self {
        Self {
            client: Client::new(),
            bot_token,
            chat_id,
        }
    }
}

#[derive(Serialize)]
struct TelegramMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(&self, event: &AccountEvent) -> Result<(), NotifyError> {
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let text = event.message();
        let response = self
            .client
            .post(&url)
            .json(&TelegramMessage {
                chat_id: &self.chat_id,
                text: &text,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed(format!(
                "telegram returned {status}: {body}"
            )));
        }
        Ok(())
    }
}
