use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;

use super::models::{ClientAccount, MigrationRecord, Server};
use super::store::{NewAccount, NewMigration, Store, StoreError};
use crate::sync::plan::SyncPlan;

/// Postgres-backed `Store`. Schema lives in `migrations/`.
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn get_server(&self, id: i32) -> Result<Option<Server>, StoreError> {
        let server = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(server)
    }

    async fn list_active_servers(&self) -> Result<Vec<Server>, StoreError> {
        let servers =
            sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE is_active ORDER BY id")
                .fetch_all(&self.pool)
                .await?;
        Ok(servers)
    }

    async fn set_server_load_score(&self, id: i32, score: f64) -> Result<(), StoreError> {
        sqlx::query("UPDATE servers SET load_score = $1, updated_at = $2 WHERE id = $3")
            .bind(score)
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn adjust_server_clients(&self, id: i32, delta: i32) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE servers SET current_clients = GREATEST(0, current_clients + $1), \
             updated_at = $2 WHERE id = $3",
        )
        .bind(delta)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_account(&self, id: i64) -> Result<Option<ClientAccount>, StoreError> {
        let account =
            sqlx::query_as::<_, ClientAccount>("SELECT * FROM client_accounts WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(account)
    }

    async fn find_account_on_server(
        &self,
        server_id: i32,
        remote_email: &str,
    ) -> Result<Option<ClientAccount>, StoreError> {
        let account = sqlx::query_as::<_, ClientAccount>(
            "SELECT * FROM client_accounts WHERE server_id = $1 AND remote_email = $2",
        )
        .bind(server_id)
        .bind(remote_email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    async fn accounts_for_server(&self, server_id: i32) -> Result<Vec<ClientAccount>, StoreError> {
        let accounts = sqlx::query_as::<_, ClientAccount>(
            "SELECT * FROM client_accounts WHERE server_id = $1 ORDER BY id",
        )
        .bind(server_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(accounts)
    }

    async fn insert_account(&self, account: NewAccount) -> Result<ClientAccount, StoreError> {
        let now = Utc::now();
        let inserted = sqlx::query_as::<_, ClientAccount>(
            r#"
            INSERT INTO client_accounts (
                user_id, server_id, inbound_id, remote_email, remote_uuid,
                traffic_limit_bytes, traffic_used_bytes, expires_at,
                max_connections, status, note, last_synced_at, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
            RETURNING *
            "#,
        )
        .bind(account.user_id)
        .bind(account.server_id)
        .bind(account.inbound_id)
        .bind(&account.remote_email)
        .bind(&account.remote_uuid)
        .bind(account.traffic_limit_bytes)
        .bind(account.traffic_used_bytes)
        .bind(account.expires_at)
        .bind(account.max_connections)
        .bind(account.status.as_str())
        .bind(&account.note)
        .bind(account.last_synced_at)
        .bind(now)
        .fetch_one(&self.pool)
        .await?;
        Ok(inserted)
    }

    async fn update_account(&self, account: &ClientAccount) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE client_accounts SET
                user_id = $1, server_id = $2, inbound_id = $3,
                remote_email = $4, remote_uuid = $5,
                traffic_limit_bytes = $6, traffic_used_bytes = $7,
                expires_at = $8, max_connections = $9, status = $10,
                note = $11, last_synced_at = $12, updated_at = $13
            WHERE id = $14
            "#,
        )
        .bind(account.user_id)
        .bind(account.server_id)
        .bind(account.inbound_id)
        .bind(&account.remote_email)
        .bind(&account.remote_uuid)
        .bind(account.traffic_limit_bytes)
        .bind(account.traffic_used_bytes)
        .bind(account.expires_at)
        .bind(account.max_connections)
        .bind(account.status.as_str())
        .bind(&account.note)
        .bind(account.last_synced_at)
        .bind(Utc::now())
        .bind(account.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!("account {}", account.id)));
        }
        Ok(())
    }

    async fn delete_account(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM client_accounts WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn apply_sync_plan(&self, server_id: i32, plan: &SyncPlan) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE servers SET
                cpu_percent = $1, mem_percent = $2, disk_percent = $3,
                uptime_seconds = $4, xray_state = $5, xray_version = $6,
                current_clients = $7, load_score = $8,
                last_synced_at = $9, updated_at = $9
            WHERE id = $10
            "#,
        )
        .bind(plan.metrics.cpu_percent)
        .bind(plan.metrics.mem_percent)
        .bind(plan.metrics.disk_percent)
        .bind(plan.metrics.uptime_seconds)
        .bind(&plan.metrics.xray_state)
        .bind(&plan.metrics.xray_version)
        .bind(plan.active_clients)
        .bind(plan.load_score)
        .bind(plan.synced_at)
        .bind(server_id)
        .execute(&mut *tx)
        .await?;

        for patch in &plan.patches {
            sqlx::query(
                r#"
                UPDATE client_accounts SET
                    traffic_used_bytes = $1, traffic_limit_bytes = $2,
                    expires_at = COALESCE($3, expires_at), status = $4,
                    note = COALESCE($5, note),
                    last_synced_at = $6, updated_at = $6
                WHERE id = $7
                "#,
            )
            .bind(patch.traffic_used_bytes)
            .bind(patch.traffic_limit_bytes)
            .bind(patch.expires_at)
            .bind(patch.status.as_str())
            .bind(&patch.note)
            .bind(plan.synced_at)
            .bind(patch.account_id)
            .execute(&mut *tx)
            .await?;
        }

        for shadow in &plan.shadows {
            // A concurrent pass may have inserted the same shadow; losing
            // that race is fine.
            sqlx::query(
                r#"
                INSERT INTO client_accounts (
                    user_id, server_id, inbound_id, remote_email, remote_uuid,
                    traffic_limit_bytes, traffic_used_bytes, expires_at,
                    max_connections, status, note, last_synced_at, created_at, updated_at
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $13)
                ON CONFLICT (server_id, remote_email) DO NOTHING
                "#,
            )
            .bind(shadow.user_id)
            .bind(shadow.server_id)
            .bind(shadow.inbound_id)
            .bind(&shadow.remote_email)
            .bind(&shadow.remote_uuid)
            .bind(shadow.traffic_limit_bytes)
            .bind(shadow.traffic_used_bytes)
            .bind(shadow.expires_at)
            .bind(shadow.max_connections)
            .bind(shadow.status.as_str())
            .bind(&shadow.note)
            .bind(shadow.last_synced_at)
            .bind(plan.synced_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_migration(
        &self,
        migration: NewMigration,
    ) -> Result<MigrationRecord, StoreError> {
        let record = sqlx::query_as::<_, MigrationRecord>(
            r#"
            INSERT INTO account_migrations (
                account_id, from_server_id, to_server_id, initiated_by,
                success, detail, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(migration.account_id)
        .bind(migration.from_server_id)
        .bind(migration.to_server_id)
        .bind(migration.initiated_by)
        .bind(migration.success)
        .bind(&migration.detail)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;
        Ok(record)
    }
}
