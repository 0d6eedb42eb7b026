//! In-memory `Store` used by the engine's unit tests.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use super::models::{ClientAccount, MigrationRecord, Server};
use super::store::{NewAccount, NewMigration, Store, StoreError};
use crate::sync::plan::SyncPlan;

#[derive(Default)]
struct Inner {
    servers: HashMap<i32, Server>,
    accounts: HashMap<i64, ClientAccount>,
    migrations: Vec<MigrationRecord>,
    next_account_id: i64,
    next_migration_id: i64,
    fail_sync_commit: bool,
}

#[derive(Default)]
pub struct MemStore {
    inner: Mutex<Inner>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed_server(&self, server: Server) {
        self.inner.lock().unwrap().servers.insert(server.id, server);
    }

    pub fn seed_account(&self, account: ClientAccount) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_account_id = inner.next_account_id.max(account.id);
        inner.accounts.insert(account.id, account);
    }

    /// Makes the next `apply_sync_plan` fail before touching anything.
    pub fn fail_next_sync_commit(&self) {
        self.inner.lock().unwrap().fail_sync_commit = true;
    }

    pub fn server(&self, id: i32) -> Option<Server> {
        self.inner.lock().unwrap().servers.get(&id).cloned()
    }

    pub fn account(&self, id: i64) -> Option<ClientAccount> {
        self.inner.lock().unwrap().accounts.get(&id).cloned()
    }

    pub fn accounts(&self) -> Vec<ClientAccount> {
        let mut accounts: Vec<_> = self
            .inner
            .lock()
            .unwrap()
            .accounts
            .values()
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        accounts
    }

    pub fn migrations(&self) -> Vec<MigrationRecord> {
        self.inner.lock().unwrap().migrations.clone()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn get_server(&self, id: i32) -> Result<Option<Server>, StoreError> {
        Ok(self.inner.lock().unwrap().servers.get(&id).cloned())
    }

    async fn list_active_servers(&self) -> Result<Vec<Server>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut servers: Vec<_> = inner
            .servers
            .values()
            .filter(|s| s.is_active)
            .cloned()
            .collect();
        servers.sort_by_key(|s| s.id);
        Ok(servers)
    }

    async fn set_server_load_score(&self, id: i32, score: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let server = inner
            .servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("server {id}")))?;
        server.load_score = score;
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn adjust_server_clients(&self, id: i32, delta: i32) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let server = inner
            .servers
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("server {id}")))?;
        server.current_clients = (server.current_clients + delta).max(0);
        server.updated_at = Utc::now();
        Ok(())
    }

    async fn get_account(&self, id: i64) -> Result<Option<ClientAccount>, StoreError> {
        Ok(self.inner.lock().unwrap().accounts.get(&id).cloned())
    }

    async fn find_account_on_server(
        &self,
        server_id: i32,
        remote_email: &str,
    ) -> Result<Option<ClientAccount>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .accounts
            .values()
            .find(|a| a.server_id == server_id && a.remote_email == remote_email)
            .cloned())
    }

    async fn accounts_for_server(&self, server_id: i32) -> Result<Vec<ClientAccount>, StoreError> {
        let inner = self.inner.lock().unwrap();
        let mut accounts: Vec<_> = inner
            .accounts
            .values()
            .filter(|a| a.server_id == server_id)
            .cloned()
            .collect();
        accounts.sort_by_key(|a| a.id);
        Ok(accounts)
    }

    async fn insert_account(&self, account: NewAccount) -> Result<ClientAccount, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_account_id += 1;
        let now = Utc::now();
        let row = ClientAccount {
            id: inner.next_account_id,
            user_id: account.user_id,
            server_id: account.server_id,
            inbound_id: account.inbound_id,
            remote_email: account.remote_email,
            remote_uuid: account.remote_uuid,
            traffic_limit_bytes: account.traffic_limit_bytes,
            traffic_used_bytes: account.traffic_used_bytes,
            expires_at: account.expires_at,
            max_connections: account.max_connections,
            status: account.status,
            note: account.note,
            last_synced_at: account.last_synced_at,
            created_at: now,
            updated_at: now,
        };
        inner.accounts.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_account(&self, account: &ClientAccount) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.accounts.contains_key(&account.id) {
            return Err(StoreError::NotFound(format!("account {}", account.id)));
        }
        let mut updated = account.clone();
        updated.updated_at = Utc::now();
        inner.accounts.insert(account.id, updated);
        Ok(())
    }

    async fn delete_account(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().accounts.remove(&id).is_some())
    }

    async fn apply_sync_plan(&self, server_id: i32, plan: &SyncPlan) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_sync_commit {
            inner.fail_sync_commit = false;
            return Err(StoreError::NotFound("injected commit failure".to_string()));
        }
        {
            let server = inner
                .servers
                .get_mut(&server_id)
                .ok_or_else(|| StoreError::NotFound(format!("server {server_id}")))?;
            server.cpu_percent = plan.metrics.cpu_percent;
            server.mem_percent = plan.metrics.mem_percent;
            server.disk_percent = plan.metrics.disk_percent;
            server.uptime_seconds = plan.metrics.uptime_seconds;
            server.xray_state = plan.metrics.xray_state.clone();
            server.xray_version = plan.metrics.xray_version.clone();
            server.current_clients = plan.active_clients;
            server.load_score = plan.load_score;
            server.last_synced_at = Some(plan.synced_at);
            server.updated_at = plan.synced_at;
        }
        for patch in &plan.patches {
            if let Some(account) = inner.accounts.get_mut(&patch.account_id) {
                account.traffic_used_bytes = patch.traffic_used_bytes;
                account.traffic_limit_bytes = patch.traffic_limit_bytes;
                if let Some(expires_at) = patch.expires_at {
                    account.expires_at = expires_at;
                }
                account.status = patch.status;
                if let Some(note) = &patch.note {
                    account.note = Some(note.clone());
                }
                account.last_synced_at = Some(plan.synced_at);
                account.updated_at = plan.synced_at;
            }
        }
        for shadow in &plan.shadows {
            let exists = inner
                .accounts
                .values()
                .any(|a| a.server_id == shadow.server_id && a.remote_email == shadow.remote_email);
            if exists {
                continue;
            }
            inner.next_account_id += 1;
            let id = inner.next_account_id;
            inner.accounts.insert(
                id,
                ClientAccount {
                    id,
                    user_id: shadow.user_id,
                    server_id: shadow.server_id,
                    inbound_id: shadow.inbound_id,
                    remote_email: shadow.remote_email.clone(),
                    remote_uuid: shadow.remote_uuid.clone(),
                    traffic_limit_bytes: shadow.traffic_limit_bytes,
                    traffic_used_bytes: shadow.traffic_used_bytes,
                    expires_at: shadow.expires_at,
                    max_connections: shadow.max_connections,
                    status: shadow.status,
                    note: shadow.note.clone(),
                    last_synced_at: shadow.last_synced_at,
                    created_at: plan.synced_at,
                    updated_at: plan.synced_at,
                },
            );
        }
        Ok(())
    }

    async fn insert_migration(
        &self,
        migration: NewMigration,
    ) -> Result<MigrationRecord, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_migration_id += 1;
        let record = MigrationRecord {
            id: inner.next_migration_id,
            account_id: migration.account_id,
            from_server_id: migration.from_server_id,
            to_server_id: migration.to_server_id,
            initiated_by: migration.initiated_by,
            success: migration.success,
            detail: migration.detail,
            created_at: Utc::now(),
        };
        inner.migrations.push(record.clone());
        Ok(record)
    }
}
