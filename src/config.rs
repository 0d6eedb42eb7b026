use std::env;

/// Runtime configuration read from the environment (a `.env` file is
/// loaded first by the binary).
#[derive(Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    pub webhook_url: Option<String>,
    pub sync_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, String> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set".to_string())?;

        let telegram_bot_token = env::var("TELEGRAM_BOT_TOKEN").ok();
        let telegram_chat_id = env::var("TELEGRAM_CHAT_ID").ok();
        if telegram_bot_token.is_some() != telegram_chat_id.is_some() {
            return Err(
                "TELEGRAM_BOT_TOKEN and TELEGRAM_CHAT_ID must be set together".to_string(),
            );
        }

        let webhook_url = env::var("NOTIFY_WEBHOOK_URL").ok();

        let sync_interval_secs = parse_or("SYNC_INTERVAL_SECS", 300)?;
        let request_timeout_secs = parse_or("GATEWAY_REQUEST_TIMEOUT_SECS", 15)?;

        Ok(AppConfig {
            database_url,
            telegram_bot_token,
            telegram_chat_id,
            webhook_url,
            sync_interval_secs,
            request_timeout_secs,
        })
    }
}

fn parse_or(key: &str, default: u64) -> Result<u64, String> {
    match env::var(key) {
        Ok(raw) => raw
            .parse::<u64>()
            .map_err(|_| format!("{key} must be a positive integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}
