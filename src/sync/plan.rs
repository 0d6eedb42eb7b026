use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::balancer;
use crate::db::models::{AccountStatus, ClientAccount, Server};
use crate::db::store::NewAccount;
use crate::gateway::GatewayError;
use crate::gateway::models::{Inbound, ServerStatus};

/// Resource snapshot destined for the server row.
#[derive(Debug, Clone, Default)]
pub struct ServerMetrics {
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
    pub uptime_seconds: i64,
    pub xray_state: Option<String>,
    pub xray_version: Option<String>,
}

impl From<&ServerStatus> for ServerMetrics {
    fn from(status: &ServerStatus) -> Self {
        Self {
            cpu_percent: status.cpu,
            mem_percent: status.mem.percent(),
            disk_percent: status.disk.percent(),
            uptime_seconds: status.uptime,
            xray_state: Some(status.xray.state.clone()).filter(|s| !s.is_empty()),
            xray_version: Some(status.xray.version.clone()).filter(|s| !s.is_empty()),
        }
    }
}

/// One client as the gateway reports it, with stats and credential joined
/// across the inbound's `clientStats` and `settings`.
#[derive(Debug, Clone)]
pub struct RemoteClient {
    pub inbound_id: i32,
    pub email: String,
    pub uuid: String,
    pub up: i64,
    pub down: i64,
    /// Quota in bytes, 0 = unlimited.
    pub total: i64,
    /// Milliseconds since epoch, 0 = never.
    pub expiry_time_ms: i64,
    pub enable: bool,
}

impl RemoteClient {
    pub fn used(&self) -> i64 {
        self.up + self.down
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.expiry_time_ms <= 0 {
            return None;
        }
        DateTime::from_timestamp_millis(self.expiry_time_ms)
    }
}

/// Flattens the gateway's inbound list into remote clients. Stats rows are
/// authoritative for traffic; settings provide the credential UUID and
/// cover clients that have not produced traffic yet.
///
/// Unparseable settings fail the whole collection. Treating them as an
/// empty client list would make every settings-only client on that
/// inbound look deleted and get its local account deactivated.
pub fn collect_remote_clients(inbounds: &[Inbound]) -> Result<Vec<RemoteClient>, GatewayError> {
    let mut out = Vec::new();
    for inbound in inbounds {
        let settings = inbound.parsed_settings()?;
        let by_email: HashMap<&str, &crate::gateway::models::ClientConfig> = settings
            .clients
            .iter()
            .map(|c| (c.email.as_str(), c))
            .collect();
        let mut seen: HashSet<&str> = HashSet::new();
        for stat in &inbound.client_stats {
            seen.insert(stat.email.as_str());
            let cfg = by_email.get(stat.email.as_str());
            out.push(RemoteClient {
                inbound_id: inbound.id,
                email: stat.email.clone(),
                uuid: cfg.map(|c| c.id.clone()).unwrap_or_default(),
                up: stat.up,
                down: stat.down,
                total: stat.total,
                expiry_time_ms: stat.expiry_time,
                enable: stat.enable,
            });
        }
        for cfg in &settings.clients {
            if cfg.email.is_empty() || seen.contains(cfg.email.as_str()) {
                continue;
            }
            out.push(RemoteClient {
                inbound_id: inbound.id,
                email: cfg.email.clone(),
                uuid: cfg.id.clone(),
                up: 0,
                down: 0,
                total: cfg.total_gb,
                expiry_time_ms: cfg.expiry_time,
                enable: cfg.enable,
            });
        }
    }
    Ok(out)
}

/// Field updates for one existing account; remote values win.
#[derive(Debug, Clone)]
pub struct AccountPatch {
    pub account_id: i64,
    pub traffic_used_bytes: i64,
    pub traffic_limit_bytes: i64,
    /// None keeps the locally known expiry (panel reported "never").
    pub expires_at: Option<DateTime<Utc>>,
    pub status: AccountStatus,
    pub note: Option<String>,
}

/// A transition worth telling the notification subsystem about.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub account_id: i64,
    pub remote_email: String,
    pub from: AccountStatus,
    pub to: AccountStatus,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SyncStats {
    pub matched: usize,
    pub shadows: usize,
    pub deactivated: usize,
}

/// Everything one server's reconciliation pass wants committed atomically.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub metrics: ServerMetrics,
    pub patches: Vec<AccountPatch>,
    pub shadows: Vec<NewAccount>,
    pub active_clients: i32,
    pub load_score: f64,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct SyncOutput {
    pub plan: SyncPlan,
    pub status_changes: Vec<StatusChange>,
    pub stats: SyncStats,
}

fn classify(remote: &RemoteClient, now: DateTime<Utc>) -> AccountStatus {
    if remote.total > 0 && remote.used() >= remote.total {
        return AccountStatus::TrafficExceeded;
    }
    if let Some(expires_at) = remote.expires_at() {
        if expires_at <= now {
            return AccountStatus::Expired;
        }
    }
    if !remote.enable {
        return AccountStatus::Disabled;
    }
    AccountStatus::Active
}

/// Computes the full reconciliation plan for one server. Pure: no I/O, no
/// clock reads, so every drift rule is directly testable.
///
/// Rules, in remote-wins order:
/// - matched accounts take the remote's traffic, quota, expiry and derived
///   status;
/// - remote clients with no local match become unowned shadow accounts;
/// - local ACTIVE accounts absent from the remote list are disabled.
pub fn plan_sync(
    server: &Server,
    locals: &[ClientAccount],
    remotes: &[RemoteClient],
    metrics: ServerMetrics,
    now: DateTime<Utc>,
) -> SyncOutput {
    let local_by_email: HashMap<&str, &ClientAccount> = locals
        .iter()
        .map(|a| (a.remote_email.as_str(), a))
        .collect();

    let mut patches = Vec::new();
    let mut shadows = Vec::new();
    let mut status_changes = Vec::new();
    let mut stats = SyncStats::default();
    let mut active_clients = 0i32;
    let mut matched_emails: HashSet<&str> = HashSet::new();

    for remote in remotes {
        let status = classify(remote, now);
        if status == AccountStatus::Active {
            active_clients += 1;
        }
        match local_by_email.get(remote.email.as_str()) {
            Some(local) => {
                matched_emails.insert(local.remote_email.as_str());
                stats.matched += 1;
                if local.status != status
                    && matches!(
                        status,
                        AccountStatus::TrafficExceeded | AccountStatus::Expired
                    )
                {
                    status_changes.push(StatusChange {
                        account_id: local.id,
                        remote_email: local.remote_email.clone(),
                        from: local.status,
                        to: status,
                    });
                }
                patches.push(AccountPatch {
                    account_id: local.id,
                    traffic_used_bytes: remote.used(),
                    traffic_limit_bytes: if remote.total > 0 {
                        remote.total
                    } else {
                        local.traffic_limit_bytes
                    },
                    expires_at: remote.expires_at(),
                    status,
                    note: None,
                });
            }
            None => {
                stats.shadows += 1;
                shadows.push(NewAccount {
                    user_id: None,
                    server_id: server.id,
                    inbound_id: remote.inbound_id,
                    remote_email: remote.email.clone(),
                    remote_uuid: remote.uuid.clone(),
                    traffic_limit_bytes: remote.total.max(0),
                    traffic_used_bytes: remote.used(),
                    expires_at: remote.expires_at().unwrap_or(now),
                    max_connections: 0,
                    status,
                    note: Some("shadow: discovered on sync".to_string()),
                    last_synced_at: Some(now),
                });
            }
        }
    }

    // Remote absence wins: a locally ACTIVE account the gateway no longer
    // knows cannot stay active.
    for local in locals {
        if local.status == AccountStatus::Active
            && !matched_emails.contains(local.remote_email.as_str())
        {
            stats.deactivated += 1;
            patches.push(AccountPatch {
                account_id: local.id,
                traffic_used_bytes: local.traffic_used_bytes,
                traffic_limit_bytes: local.traffic_limit_bytes,
                expires_at: Some(local.expires_at),
                status: AccountStatus::Disabled,
                note: Some("missing from gateway at sync".to_string()),
            });
        }
    }

    let load_score = balancer::score(
        metrics.cpu_percent,
        metrics.mem_percent,
        active_clients,
        server.max_clients,
    );

    SyncOutput {
        plan: SyncPlan {
            metrics,
            patches,
            shadows,
            active_clients,
            load_score,
            synced_at: now,
        },
        status_changes,
        stats,
    }
}
