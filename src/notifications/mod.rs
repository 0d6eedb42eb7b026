use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

pub mod telegram;
pub mod webhook;

pub use telegram::TelegramNotifier;
pub use webhook::WebhookNotifier;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("failed to send notification: {0}")]
    SendFailed(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountEventKind {
    TrafficExceeded,
    Expired,
}

/// What the notification subsystem is told when an account crosses a
/// threshold during reconciliation.
#[derive(Debug, Clone, Serialize)]
pub struct AccountEvent {
    pub account_id: i64,
    pub remote_email: String,
    pub server_name: String,
    pub kind: AccountEventKind,
}

impl AccountEvent {
    pub fn message(&self) -> String {
        let what = match self.kind {
            AccountEventKind::TrafficExceeded => "exhausted its traffic quota",
            AccountEventKind::Expired => "expired",
        };
        format!(
            "Account {} on {} has {}.",
            self.remote_email, self.server_name, what
        )
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: &AccountEvent) -> Result<(), NotifyError>;
}

/// Fire-and-forget fan-out: each sender runs in its own task and failures
/// are logged, never propagated to the caller.
pub fn dispatch(notifiers: &[Arc<dyn Notifier>], event: AccountEvent) {
    for notifier in notifiers {
        let notifier = notifier.clone();
        let event = event.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&event).await {
                warn!(
                    account_id = event.account_id,
                    kind = ?event.kind,
                    error = %err,
                    "failed to deliver account notification"
                );
            }
        });
    }
}
