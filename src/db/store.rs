use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::models::{AccountStatus, ClientAccount, MigrationRecord, Server};
use crate::sync::plan::SyncPlan;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Payload for inserting an account row; ids and timestamps are assigned
/// by the store.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub user_id: Option<i64>,
    pub server_id: i32,
    pub inbound_id: i32,
    pub remote_email: String,
    pub remote_uuid: String,
    pub traffic_limit_bytes: i64,
    pub traffic_used_bytes: i64,
    pub expires_at: DateTime<Utc>,
    pub max_connections: i32,
    pub status: AccountStatus,
    pub note: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct NewMigration {
    pub account_id: i64,
    pub from_server_id: i32,
    pub to_server_id: i32,
    pub initiated_by: Option<i64>,
    pub success: bool,
    pub detail: Option<String>,
}

/// Persistence seam for the engine. The Postgres implementation lives in
/// `db::pg`; tests run against `db::mem`.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get_server(&self, id: i32) -> Result<Option<Server>, StoreError>;
    async fn list_active_servers(&self) -> Result<Vec<Server>, StoreError>;
    async fn set_server_load_score(&self, id: i32, score: f64) -> Result<(), StoreError>;
    /// Adds `delta` to the server's active-client count, clamped at zero.
    async fn adjust_server_clients(&self, id: i32, delta: i32) -> Result<(), StoreError>;

    async fn get_account(&self, id: i64) -> Result<Option<ClientAccount>, StoreError>;
    async fn find_account_on_server(
        &self,
        server_id: i32,
        remote_email: &str,
    ) -> Result<Option<ClientAccount>, StoreError>;
    async fn accounts_for_server(&self, server_id: i32) -> Result<Vec<ClientAccount>, StoreError>;
    async fn insert_account(&self, account: NewAccount) -> Result<ClientAccount, StoreError>;
    async fn update_account(&self, account: &ClientAccount) -> Result<(), StoreError>;
    /// Returns false when the row was already gone.
    async fn delete_account(&self, id: i64) -> Result<bool, StoreError>;

    /// Commits one server's reconciliation pass as a single unit: metric
    /// update, account patches, shadow inserts, count and score. A failure
    /// leaves everything from this pass unapplied.
    async fn apply_sync_plan(&self, server_id: i32, plan: &SyncPlan) -> Result<(), StoreError>;

    async fn insert_migration(
        &self,
        migration: NewMigration,
    ) -> Result<MigrationRecord, StoreError>;
}
