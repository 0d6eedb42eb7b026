use std::sync::Arc;

use chrono::{Duration, Utc};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::balancer::{LoadBalancer, PlacementCriteria};
use crate::db::models::{AccountStatus, ClientAccount, GB, Server};
use crate::db::store::{NewAccount, Store, StoreError};
use crate::gateway::models::{ClientConfig, Inbound};
use crate::gateway::{GatewayError, PanelConnector};

#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("no eligible server for placement")]
    NoEligibleServer,
    #[error("server {0} not found")]
    ServerNotFound(i32),
    #[error("account {0} not found")]
    AccountNotFound(i64),
    #[error("server {0} has no usable inbound")]
    NoUsableInbound(i32),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct CreateAccountRequest {
    pub user_id: i64,
    /// Explicit target; wins over location and load-based placement.
    pub server_id: Option<i32>,
    pub location: Option<String>,
    pub days: i64,
    pub traffic_limit_gb: i64,
    pub max_connections: i32,
}

/// Prefers an enabled inbound carrying the server's configured protocol,
/// falling back to any enabled one.
pub(crate) fn pick_inbound<'a>(
    inbounds: &'a [Inbound],
    protocol: Option<&str>,
) -> Option<&'a Inbound> {
    inbounds
        .iter()
        .filter(|i| i.enable)
        .find(|i| protocol.is_none_or(|p| i.protocol == p))
        .or_else(|| inbounds.iter().find(|i| i.enable))
}

pub(crate) fn client_config_for(account: &ClientAccount, enable: bool) -> ClientConfig {
    ClientConfig {
        id: account.remote_uuid.clone(),
        email: account.remote_email.clone(),
        flow: String::new(),
        limit_ip: account.max_connections,
        total_gb: account.traffic_limit_bytes,
        expiry_time: account.expires_at.timestamp_millis(),
        enable,
        tg_id: account.user_id.map(|id| id.to_string()).unwrap_or_default(),
        sub_id: String::new(),
    }
}

/// Creates, renews, resets and deletes individual accounts, keeping the
/// local record and the remote gateway in step.
pub struct ProvisioningService {
    store: Arc<dyn Store>,
    connector: Arc<dyn PanelConnector>,
    balancer: LoadBalancer,
}

impl ProvisioningService {
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn PanelConnector>) -> Self {
        let balancer = LoadBalancer::new(store.clone());
        Self {
            store,
            connector,
            balancer,
        }
    }

    async fn resolve_target(
        &self,
        req: &CreateAccountRequest,
    ) -> Result<Server, ProvisionError> {
        if let Some(id) = req.server_id {
            let server = self
                .store
                .get_server(id)
                .await?
                .ok_or(ProvisionError::ServerNotFound(id))?;
            if !server.is_active {
                return Err(ProvisionError::NoEligibleServer);
            }
            return Ok(server);
        }
        if let Some(location) = &req.location {
            let criteria = PlacementCriteria {
                location: Some(location.clone()),
                ..Default::default()
            };
            if let Some(server) = self.balancer.best_server(&criteria).await? {
                return Ok(server);
            }
            debug!(%location, "no server in requested location, falling back to global pick");
        }
        self.balancer
            .best_server(&PlacementCriteria::default())
            .await?
            .ok_or(ProvisionError::NoEligibleServer)
    }

    /// Writes a pending record, provisions the credential remotely, then
    /// flips the record to active. On remote failure the record is kept as
    /// `disabled` with an audit note and no account is returned.
    pub async fn create_account(
        &self,
        req: CreateAccountRequest,
    ) -> Result<ClientAccount, ProvisionError> {
        let server = self.resolve_target(&req).await?;
        let panel = self.connector.connect(&server)?;
        let inbounds = panel.list_inbounds().await?;
        let inbound = pick_inbound(&inbounds, server.protocol.as_deref())
            .ok_or(ProvisionError::NoUsableInbound(server.id))?;

        let now = Utc::now();
        let remote_uuid = Uuid::new_v4().to_string();
        let remote_email = format!("{}-{}", req.user_id, &remote_uuid[..8]);
        let mut account = self
            .store
            .insert_account(NewAccount {
                user_id: Some(req.user_id),
                server_id: server.id,
                inbound_id: inbound.id,
                remote_email,
                remote_uuid,
                traffic_limit_bytes: req.traffic_limit_gb * GB,
                traffic_used_bytes: 0,
                expires_at: now + Duration::days(req.days),
                max_connections: req.max_connections,
                status: AccountStatus::Pending,
                note: None,
                last_synced_at: None,
            })
            .await?;

        let client = client_config_for(&account, true);
        match panel.add_client(inbound.id, &client).await {
            Ok(()) => {
                account.status = AccountStatus::Active;
                account.last_synced_at = Some(now);
                self.store.update_account(&account).await?;
                self.store.adjust_server_clients(server.id, 1).await?;
                self.balancer.rescore(server.id).await?;
                info!(
                    account_id = account.id,
                    user_id = req.user_id,
                    server_id = server.id,
                    inbound_id = inbound.id,
                    "account provisioned"
                );
                Ok(account)
            }
            Err(err) => {
                // Keep the row for audit; it is never deleted automatically.
                account.status = AccountStatus::Disabled;
                account.note = Some(format!("provisioning failed: {err}"));
                self.store.update_account(&account).await?;
                warn!(
                    account_id = account.id,
                    server_id = server.id,
                    error = %err,
                    "remote client creation failed"
                );
                Err(err.into())
            }
        }
    }

    /// Extends validity: new expiry = max(current, now) + extra days. An
    /// account that is not currently active is recreated remotely with the
    /// full remaining duration and reactivated.
    ///
    /// Not serialized against a concurrent sync pass of the same server;
    /// the next pass converges the record to remote truth either way.
    pub async fn renew_account(
        &self,
        account_id: i64,
        extra_days: i64,
    ) -> Result<ClientAccount, ProvisionError> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(ProvisionError::AccountNotFound(account_id))?;
        let server = self
            .store
            .get_server(account.server_id)
            .await?
            .ok_or(ProvisionError::ServerNotFound(account.server_id))?;
        let panel = self.connector.connect(&server)?;

        let now = Utc::now();
        let was_active = account.is_active();
        account.expires_at = account.expires_at.max(now) + Duration::days(extra_days);
        let client = client_config_for(&account, true);

        if was_active {
            panel.update_client(account.inbound_id, &client).await?;
        } else {
            // The remote client may be gone (deleted) or still present but
            // lapsed; try a fresh add first, fall back to updating in place.
            if let Err(add_err) = panel.add_client(account.inbound_id, &client).await {
                panel
                    .update_client(account.inbound_id, &client)
                    .await
                    .map_err(|_| add_err)?;
            }
        }

        account.status = AccountStatus::Active;
        account.last_synced_at = Some(now);
        self.store.update_account(&account).await?;
        if !was_active {
            self.store.adjust_server_clients(server.id, 1).await?;
            self.balancer.rescore(server.id).await?;
        }
        info!(account_id, extra_days, server_id = server.id, "account renewed");
        Ok(account)
    }

    /// Zeroes traffic counters remotely and locally. A gateway "not found"
    /// counts as done. Reactivates an account that was only out of quota.
    pub async fn reset_account_traffic(
        &self,
        account_id: i64,
    ) -> Result<ClientAccount, ProvisionError> {
        let mut account = self
            .store
            .get_account(account_id)
            .await?
            .ok_or(ProvisionError::AccountNotFound(account_id))?;
        let server = self
            .store
            .get_server(account.server_id)
            .await?
            .ok_or(ProvisionError::ServerNotFound(account.server_id))?;
        let panel = self.connector.connect(&server)?;

        match panel
            .reset_client_traffic(account.inbound_id, &account.remote_email)
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_not_found() => {
                debug!(account_id, "remote counters already absent");
            }
            Err(err) => return Err(err.into()),
        }

        account.traffic_used_bytes = 0;
        if account.status == AccountStatus::TrafficExceeded {
            account.status = AccountStatus::Active;
            self.store.update_account(&account).await?;
            self.store.adjust_server_clients(server.id, 1).await?;
            self.balancer.rescore(server.id).await?;
        } else {
            self.store.update_account(&account).await?;
        }
        info!(account_id, server_id = server.id, "traffic counters reset");
        Ok(account)
    }

    /// Removes the account. Remote deletion is best-effort and idempotent:
    /// "not found" counts as success and a failed remote call still removes
    /// the local record (the next sync pass cannot resurrect a deleted
    /// row). Returns false when there was nothing to delete.
    pub async fn delete_account(&self, account_id: i64) -> Result<bool, ProvisionError> {
        let Some(account) = self.store.get_account(account_id).await? else {
            return Ok(false);
        };

        if let Some(server) = self.store.get_server(account.server_id).await? {
            match self.connector.connect(&server) {
                Ok(panel) => match panel
                    .delete_client(account.inbound_id, &account.remote_uuid)
                    .await
                {
                    Ok(()) => {}
                    Err(err) if err.is_not_found() => {
                        debug!(account_id, "remote client already gone");
                    }
                    Err(err) => {
                        warn!(
                            account_id,
                            server_id = server.id,
                            error = %err,
                            "best-effort remote delete failed"
                        );
                    }
                },
                Err(err) => {
                    warn!(account_id, server_id = server.id, error = %err, "gateway unreachable for delete");
                }
            }
        }

        let removed = self.store.delete_account(account_id).await?;
        if account.is_active() {
            self.store
                .adjust_server_clients(account.server_id, -1)
                .await?;
            self.balancer.rescore(account.server_id).await.ok();
        }
        info!(account_id, server_id = account.server_id, "account deleted");
        Ok(removed)
    }
}
