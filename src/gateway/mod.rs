use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::db::models::Server;

pub mod client;
pub mod error;
pub mod models;
pub mod retry;

#[cfg(test)]
pub mod fake;

pub use client::GatewayClient;
pub use error::GatewayError;
pub use retry::RetryPolicy;

use models::{ClientConfig, Inbound, ServerStatus};

/// The panel operations the engine consumes. `GatewayClient` is the real
/// implementation; tests substitute an in-memory panel.
#[async_trait]
pub trait PanelApi: Send + Sync {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError>;
    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound, GatewayError>;
    async fn add_client(&self, inbound_id: i32, client: &ClientConfig) -> Result<(), GatewayError>;
    async fn update_client(
        &self,
        inbound_id: i32,
        client: &ClientConfig,
    ) -> Result<(), GatewayError>;
    async fn delete_client(&self, inbound_id: i32, uuid: &str) -> Result<(), GatewayError>;
    async fn reset_client_traffic(&self, inbound_id: i32, email: &str)
    -> Result<(), GatewayError>;
    async fn server_status(&self) -> Result<ServerStatus, GatewayError>;
    async fn online_clients(&self) -> Result<Vec<String>, GatewayError>;
}

#[async_trait]
impl PanelApi for GatewayClient {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError> {
        GatewayClient::list_inbounds(self).await
    }
    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound, GatewayError> {
        GatewayClient::get_inbound(self, inbound_id).await
    }
    async fn add_client(&self, inbound_id: i32, client: &ClientConfig) -> Result<(), GatewayError> {
        GatewayClient::add_client(self, inbound_id, client).await
    }
    async fn update_client(
        &self,
        inbound_id: i32,
        client: &ClientConfig,
    ) -> Result<(), GatewayError> {
        GatewayClient::update_client(self, inbound_id, client).await
    }
    async fn delete_client(&self, inbound_id: i32, uuid: &str) -> Result<(), GatewayError> {
        GatewayClient::delete_client(self, inbound_id, uuid).await
    }
    async fn reset_client_traffic(
        &self,
        inbound_id: i32,
        email: &str,
    ) -> Result<(), GatewayError> {
        GatewayClient::reset_client_traffic(self, inbound_id, email).await
    }
    async fn server_status(&self) -> Result<ServerStatus, GatewayError> {
        GatewayClient::server_status(self).await
    }
    async fn online_clients(&self) -> Result<Vec<String>, GatewayError> {
        GatewayClient::online_clients(self).await
    }
}

/// Resolves the panel connection for a server record.
pub trait PanelConnector: Send + Sync {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, GatewayError>;
}

struct PoolEntry {
    fingerprint: String,
    client: Arc<GatewayClient>,
}

/// One `GatewayClient` per server, cached so the session cookie survives
/// across operations. Entries are rebuilt when the server's endpoint or
/// credentials change.
pub struct GatewayPool {
    entries: DashMap<i32, PoolEntry>,
    retry: RetryPolicy,
    request_timeout: Duration,
}

impl GatewayPool {
    pub fn new(retry: RetryPolicy, request_timeout: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            retry,
            request_timeout,
        }
    }
}

impl PanelConnector for GatewayPool {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, GatewayError> {
        let fingerprint = format!(
            "{}|{}|{}",
            server.panel_url, server.username, server.password
        );
        if let Some(entry) = self.entries.get(&server.id) {
            if entry.fingerprint == fingerprint {
                return Ok(entry.client.clone());
            }
        }
        let client = Arc::new(GatewayClient::new(
            &server.panel_url,
            &server.username,
            &server.password,
            self.retry.clone(),
            self.request_timeout,
        )?);
        self.entries.insert(
            server.id,
            PoolEntry {
                fingerprint,
                client: client.clone(),
            },
        );
        Ok(client)
    }
}
