use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use thiserror::Error;
use tracing::{info, warn};

use crate::db::models::AccountStatus;
use crate::db::store::{Store, StoreError};
use crate::gateway::{GatewayError, PanelConnector};
use crate::notifications::{AccountEvent, AccountEventKind, Notifier, dispatch};

pub mod plan;

use plan::{SyncStats, collect_remote_clients, plan_sync};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("server {0} not found")]
    ServerNotFound(i32),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug)]
pub struct SyncSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub outcomes: Vec<(i32, Result<SyncStats, SyncError>)>,
}

/// Reconciles local account records against each gateway's live client
/// list. Remote state is authoritative; local drift is corrected, never
/// the other way around.
pub struct AccountSyncEngine {
    store: Arc<dyn Store>,
    connector: Arc<dyn PanelConnector>,
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl AccountSyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn PanelConnector>,
        notifiers: Vec<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            store,
            connector,
            notifiers,
        }
    }

    /// One server's reconciliation pass. Nothing is written until the
    /// whole plan commits, so any failure leaves prior state untouched
    /// for the next scheduled pass.
    pub async fn sync_server(&self, server_id: i32) -> Result<SyncStats, SyncError> {
        let server = self
            .store
            .get_server(server_id)
            .await?
            .ok_or(SyncError::ServerNotFound(server_id))?;
        let panel = self.connector.connect(&server)?;

        // Authentication failure surfaces here and aborts the pass; no
        // partial reconciliation.
        let inbounds = panel.list_inbounds().await?;
        let status = panel.server_status().await?;

        let locals = self.store.accounts_for_server(server_id).await?;
        let remotes = collect_remote_clients(&inbounds)?;
        let now = Utc::now();
        let output = plan_sync(&server, &locals, &remotes, (&status).into(), now);

        self.store.apply_sync_plan(server_id, &output.plan).await?;

        for change in &output.status_changes {
            let kind = match change.to {
                AccountStatus::TrafficExceeded => AccountEventKind::TrafficExceeded,
                AccountStatus::Expired => AccountEventKind::Expired,
                _ => continue,
            };
            dispatch(
                &self.notifiers,
                AccountEvent {
                    account_id: change.account_id,
                    remote_email: change.remote_email.clone(),
                    server_name: server.name.clone(),
                    kind,
                },
            );
        }

        info!(
            server_id,
            matched = output.stats.matched,
            shadows = output.stats.shadows,
            deactivated = output.stats.deactivated,
            active_clients = output.plan.active_clients,
            "server sync pass committed"
        );
        Ok(output.stats)
    }

    /// Runs one pass per active server, concurrently and isolated: one
    /// server's failure neither blocks nor rolls back the others.
    pub async fn sync_all_servers(&self) -> Result<SyncSummary, StoreError> {
        let servers = self.store.list_active_servers().await?;
        let passes = servers.iter().map(|server| {
            let id = server.id;
            async move { (id, self.sync_server(id).await) }
        });
        let outcomes: Vec<_> = join_all(passes).await;

        let mut summary = SyncSummary {
            succeeded: 0,
            failed: 0,
            outcomes: Vec::with_capacity(outcomes.len()),
        };
        for (server_id, result) in outcomes {
            match &result {
                Ok(_) => summary.succeeded += 1,
                Err(err) => {
                    summary.failed += 1;
                    warn!(server_id, error = %err, "server sync pass failed");
                }
            }
            summary.outcomes.push((server_id, result));
        }
        Ok(summary)
    }
}
