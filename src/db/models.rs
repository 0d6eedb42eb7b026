use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents one managed VPN gateway (a remote 3x-ui style panel).
/// Corresponds to the `servers` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Server {
    pub id: i32,
    pub name: String,
    pub panel_url: String,
    pub username: String,
    pub password: String,
    pub location: Option<String>,
    pub protocol: Option<String>, // e.g. "vless", "vmess"
    pub is_active: bool,
    /// Assumed capacity used by the load balancer; 0 means "unknown".
    pub max_clients: i32,
    pub current_clients: i32,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: i64,
    pub xray_state: Option<String>,
    pub xray_version: Option<String>,
    pub load_score: f64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Server {
    pub fn uptime_days(&self) -> i64 {
        self.uptime_seconds / 86_400
    }
}

/// Lifecycle state of a provisioned account. Stored as text in the DB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Pending,
    Active,
    TrafficExceeded,
    Expired,
    Disabled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::Pending => "pending",
            AccountStatus::Active => "active",
            AccountStatus::TrafficExceeded => "traffic_exceeded",
            AccountStatus::Expired => "expired",
            AccountStatus::Disabled => "disabled",
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for AccountStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(AccountStatus::Pending),
            "active" => Ok(AccountStatus::Active),
            "traffic_exceeded" => Ok(AccountStatus::TrafficExceeded),
            "expired" => Ok(AccountStatus::Expired),
            "disabled" => Ok(AccountStatus::Disabled),
            other => Err(format!("unknown account status: {other}")),
        }
    }
}

/// One provisioned VPN credential and its billing metadata.
/// Corresponds to the `client_accounts` table.
///
/// `user_id` is NULL for shadow records created by reconciliation when a
/// remote client has no local owner.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClientAccount {
    pub id: i64,
    pub user_id: Option<i64>,
    pub server_id: i32,
    pub inbound_id: i32,
    /// Identifier the gateway keys traffic stats by.
    pub remote_email: String,
    /// UUID the gateway keys the credential by inside inbound settings.
    pub remote_uuid: String,
    /// 0 means unlimited.
    pub traffic_limit_bytes: i64,
    pub traffic_used_bytes: i64,
    pub expires_at: DateTime<Utc>,
    pub max_connections: i32,
    #[sqlx(try_from = "String")]
    pub status: AccountStatus,
    pub note: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClientAccount {
    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Quota still available, never negative.
    pub fn remaining_traffic_bytes(&self) -> i64 {
        (self.traffic_limit_bytes - self.traffic_used_bytes).max(0)
    }

    /// Whole days of validity left, rounded up, at least 1.
    /// A migration always grants the moved client at least one day so the
    /// user is never locked out mid-move.
    pub fn remaining_days(&self, now: DateTime<Utc>) -> i64 {
        let secs = (self.expires_at - now).num_seconds();
        (secs + 86_399).div_euclid(86_400).max(1)
    }
}

/// Immutable audit record of one account move between gateways.
/// Corresponds to the `account_migrations` table.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct MigrationRecord {
    pub id: i64,
    pub account_id: i64,
    pub from_server_id: i32,
    pub to_server_id: i32,
    /// Operator user id, when the move was requested by a human.
    pub initiated_by: Option<i64>,
    pub success: bool,
    pub detail: Option<String>,
    pub created_at: DateTime<Utc>,
}

pub const GB: i64 = 1_073_741_824;
