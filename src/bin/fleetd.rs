use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use vpnfleet::config::AppConfig;
use vpnfleet::db::pg::PgStore;
use vpnfleet::gateway::{GatewayPool, RetryPolicy};
use vpnfleet::notifications::telegram::TelegramNotifier;
use vpnfleet::notifications::webhook::WebhookNotifier;
use vpnfleet::notifications::Notifier;
use vpnfleet::sync::AccountSyncEngine;

/// Fleet reconciliation daemon. Periodically syncs every active gateway's
/// client list and metrics into the database.
#[derive(Parser)]
#[command(name = "fleetd", version)]
struct Cli {
    /// Run a single sync pass and exit.
    #[arg(long)]
    once: bool,

    /// Seconds between passes; overrides SYNC_INTERVAL_SECS.
    #[arg(long)]
    interval_secs: Option<u64>,
}

fn init_logging() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stdout))
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;
    let interval_secs = cli.interval_secs.unwrap_or(config.sync_interval_secs);

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;

    let store = Arc::new(PgStore::new(pool));
    let connector = Arc::new(GatewayPool::new(
        RetryPolicy::default(),
        Duration::from_secs(config.request_timeout_secs),
    ));

    let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();
    if let (Some(token), Some(chat_id)) = (
        config.telegram_bot_token.clone(),
        config.telegram_chat_id.clone(),
    ) {
        notifiers.push(Arc::new(TelegramNotifier::new(token, chat_id)));
    }
    if let Some(url) = config.webhook_url.clone() {
        notifiers.push(Arc::new(WebhookNotifier::new(url)));
    }

    let engine = AccountSyncEngine::new(store, connector, notifiers);

    if cli.once {
        let summary = engine.sync_all_servers().await?;
        info!(
            succeeded = summary.succeeded,
            failed = summary.failed,
            "single sync pass finished"
        );
        if summary.failed > 0 {
            std::process::exit(1);
        }
        return Ok(());
    }

    info!(interval_secs, "fleetd started");
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match engine.sync_all_servers().await {
                    Ok(summary) => {
                        if summary.failed > 0 {
                            warn!(
                                succeeded = summary.succeeded,
                                failed = summary.failed,
                                "sync pass finished with failures"
                            );
                        } else {
                            info!(succeeded = summary.succeeded, "sync pass finished");
                        }
                    }
                    Err(err) => error!(error = %err, "sync pass could not run"),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received");
                break;
            }
        }
    }
    Ok(())
}
