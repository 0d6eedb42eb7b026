use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{info, warn};

use crate::balancer::LoadBalancer;
use crate::db::models::{AccountStatus, MigrationRecord, Server};
use crate::db::store::{NewMigration, Store, StoreError};
use crate::gateway::{GatewayError, PanelConnector};
use crate::provisioning::{client_config_for, pick_inbound};

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("server {0} not found")]
    ServerNotFound(i32),
    #[error("account {account_id} is on server {actual}, not {expected}")]
    AccountNotOnSource {
        account_id: i64,
        expected: i32,
        actual: i32,
    },
    #[error("server {0} has no usable inbound")]
    NoUsableInbound(i32),
    #[error("destination provisioning failed: {0}")]
    DestinationFailed(GatewayError),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Moves one account between gateways, preserving remaining quota and
/// validity. The destination is provisioned first; the source is only
/// touched once the destination holds the credential, so a failure never
/// loses the user's access.
pub struct MigrationCoordinator {
    store: Arc<dyn Store>,
    connector: Arc<dyn PanelConnector>,
    balancer: LoadBalancer,
}

impl MigrationCoordinator {
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn PanelConnector>) -> Self {
        let balancer = LoadBalancer::new(store.clone());
        Self {
            store,
            connector,
            balancer,
        }
    }

    /// Removes the account's credential from this server, wherever its
    /// inbounds hold it. The account row may already point at the
    /// destination inbound, so the credential is located by uuid rather
    /// than by the stored inbound id. Absence counts as already cleaned
    /// up; any failure is reported as a detail string, never an error.
    async fn cleanup_source(&self, server: &Server, remote_uuid: &str) -> Option<String> {
        let panel = match self.connector.connect(server) {
            Ok(panel) => panel,
            Err(err) => {
                warn!(server_id = server.id, error = %err, "source gateway unreachable for cleanup");
                return Some(format!("source cleanup failed: {err}"));
            }
        };
        let inbounds = match panel.list_inbounds().await {
            Ok(inbounds) => inbounds,
            Err(err) => {
                warn!(server_id = server.id, error = %err, "source inbound listing failed during cleanup");
                return Some(format!("source cleanup failed: {err}"));
            }
        };
        for inbound in &inbounds {
            let holds_credential = inbound
                .parsed_settings()
                .map(|s| s.clients.iter().any(|c| c.id == remote_uuid))
                .unwrap_or(false);
            if !holds_credential {
                continue;
            }
            match panel.delete_client(inbound.id, remote_uuid).await {
                Ok(()) => {}
                Err(err) if err.is_not_found() => {}
                Err(err) => {
                    warn!(
                        server_id = server.id,
                        inbound_id = inbound.id,
                        error = %err,
                        "source cleanup failed; destination remains authoritative"
                    );
                    return Some(format!("source cleanup failed: {err}"));
                }
            }
        }
        None
    }

    /// Two concurrent migrations of the same account are not serialized;
    /// the idempotent convergence step makes a repeat of a finished move
    /// harmless, but overlapping moves to different destinations are an
    /// accepted race corrected by the next sync pass.
    pub async fn migrate(
        &self,
        account_id: i64,
        from_server_id: i32,
        to_server_id: i32,
        initiated_by: Option<i64>,
    ) -> Result<MigrationRecord, MigrationError> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(MigrationError::AccountNotFound(account_id))?;
        let to_server = self
            .store
            .get_server(to_server_id)
            .await?
            .ok_or(MigrationError::ServerNotFound(to_server_id))?;

        // Idempotent convergence: the account already lives on the
        // destination, so only the source copy (if any) needs removing.
        if account.server_id == to_server_id && account.is_active() {
            let mut detail = Some("already on destination".to_string());
            // A same-server "move" holds the live credential; there is
            // nothing stale to clean up.
            if from_server_id != to_server_id {
                if let Some(from_server) = self.store.get_server(from_server_id).await? {
                    if let Some(cleanup) = self
                        .cleanup_source(&from_server, &account.remote_uuid)
                        .await
                    {
                        detail = Some(format!("already on destination; {cleanup}"));
                    }
                }
            }
            let record = self
                .store
                .insert_migration(NewMigration {
                    account_id,
                    from_server_id,
                    to_server_id,
                    initiated_by,
                    success: true,
                    detail,
                })
                .await?;
            return Ok(record);
        }

        if account.server_id != from_server_id {
            return Err(MigrationError::AccountNotOnSource {
                account_id,
                expected: from_server_id,
                actual: account.server_id,
            });
        }
        let from_server = self
            .store
            .get_server(from_server_id)
            .await?
            .ok_or(MigrationError::ServerNotFound(from_server_id))?;

        let now = Utc::now();
        let remaining_traffic = account.remaining_traffic_bytes();
        let remaining_days = account.remaining_days(now);
        let new_expiry = now + Duration::days(remaining_days);

        let dest_panel = self.connector.connect(&to_server)?;
        let inbounds = dest_panel.list_inbounds().await?;
        let inbound = pick_inbound(&inbounds, to_server.protocol.as_deref())
            .ok_or(MigrationError::NoUsableInbound(to_server_id))?;

        let mut moved = account.clone();
        moved.traffic_limit_bytes = remaining_traffic;
        moved.traffic_used_bytes = 0;
        moved.expires_at = new_expiry;
        let client = client_config_for(&moved, true);

        if let Err(err) = dest_panel.add_client(inbound.id, &client).await {
            // Source untouched; nothing is lost.
            self.store
                .insert_migration(NewMigration {
                    account_id,
                    from_server_id,
                    to_server_id,
                    initiated_by,
                    success: false,
                    detail: Some(format!("destination provisioning failed: {err}")),
                })
                .await?;
            warn!(
                account_id,
                from_server_id,
                to_server_id,
                error = %err,
                "migration aborted before touching the source"
            );
            return Err(MigrationError::DestinationFailed(err));
        }

        // Destination is authoritative from here on.
        let was_active = account.is_active();
        account.server_id = to_server_id;
        account.inbound_id = inbound.id;
        account.traffic_limit_bytes = remaining_traffic;
        account.traffic_used_bytes = 0;
        account.expires_at = new_expiry;
        account.status = AccountStatus::Active;
        account.last_synced_at = Some(now);
        self.store.update_account(&account).await?;

        self.store.adjust_server_clients(to_server_id, 1).await?;
        if was_active {
            self.store.adjust_server_clients(from_server_id, -1).await?;
        }
        self.balancer.rescore(to_server_id).await.ok();
        self.balancer.rescore(from_server_id).await.ok();

        // Same-server moves re-provision in place; the uuid search would
        // find the credential just added.
        let detail = if from_server_id != to_server_id {
            self.cleanup_source(&from_server, &account.remote_uuid).await
        } else {
            None
        };
        let record = self
            .store
            .insert_migration(NewMigration {
                account_id,
                from_server_id,
                to_server_id,
                initiated_by,
                success: true,
                detail,
            })
            .await?;

        info!(
            account_id,
            from_server_id,
            to_server_id,
            remaining_traffic,
            remaining_days,
            "account migrated"
        );
        Ok(record)
    }
}
