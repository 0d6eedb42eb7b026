use async_trait::async_trait;
use reqwest::{Client, header};

use super::{AccountEvent, NotifyError, Notifier};

/// Posts account events as JSON to an operator-supplied webhook.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: String) -> Self {
        Self {
            client: Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, event: &AccountEvent) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(event)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::SendFailed(format!(
                "webhook returned {status}: {body}"
            )));
        }
        Ok(())
    }
}
