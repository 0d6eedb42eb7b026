use std::sync::Arc;

use crate::db::models::Server;
use crate::db::store::{Store, StoreError};

/// Load score weights. The score is a composite in [0, ~1]; lower is a
/// better placement target.
pub const W_CPU: f64 = 0.4;
pub const W_MEM: f64 = 0.3;
pub const W_USERS: f64 = 0.3;

/// Capacity assumed when a server does not declare `max_clients`.
pub const DEFAULT_CAPACITY: i32 = 100;

/// `W_CPU*(cpu/100) + W_MEM*(mem/100) + W_USERS*min(1, active/capacity)`.
pub fn score(cpu_percent: f64, mem_percent: f64, active_users: i32, capacity: i32) -> f64 {
    let capacity = if capacity > 0 { capacity } else { DEFAULT_CAPACITY };
    let user_ratio = (active_users.max(0) as f64 / capacity as f64).min(1.0);
    W_CPU * (cpu_percent / 100.0) + W_MEM * (mem_percent / 100.0) + W_USERS * user_ratio
}

pub fn server_score(server: &Server) -> f64 {
    score(
        server.cpu_percent,
        server.mem_percent,
        server.current_clients,
        server.max_clients,
    )
}

/// Placement filters for `best_server`; all optional.
#[derive(Debug, Clone, Default)]
pub struct PlacementCriteria {
    pub location: Option<String>,
    pub protocol: Option<String>,
    pub min_uptime_days: Option<i64>,
}

fn matches(server: &Server, criteria: &PlacementCriteria) -> bool {
    if !server.is_active {
        return false;
    }
    if server.max_clients > 0 && server.current_clients >= server.max_clients {
        return false;
    }
    if let Some(location) = &criteria.location {
        if server.location.as_deref() != Some(location.as_str()) {
            return false;
        }
    }
    if let Some(protocol) = &criteria.protocol {
        if server.protocol.as_deref() != Some(protocol.as_str()) {
            return false;
        }
    }
    if let Some(days) = criteria.min_uptime_days {
        if server.uptime_days() < days {
            return false;
        }
    }
    true
}

/// Strictly lowest score wins; ties break on the lowest server id.
pub fn pick_best<'a>(servers: &'a [Server], criteria: &PlacementCriteria) -> Option<&'a Server> {
    servers
        .iter()
        .filter(|s| matches(s, criteria))
        .min_by(|a, b| {
            server_score(a)
                .total_cmp(&server_score(b))
                .then(a.id.cmp(&b.id))
        })
}

/// Scores gateways for new-account placement from the metrics the sync
/// engine keeps fresh.
pub struct LoadBalancer {
    store: Arc<dyn Store>,
}

impl LoadBalancer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn best_server(
        &self,
        criteria: &PlacementCriteria,
    ) -> Result<Option<Server>, StoreError> {
        let servers = self.store.list_active_servers().await?;
        Ok(pick_best(&servers, criteria).cloned())
    }

    /// Recomputes and persists a server's score after anything changed its
    /// client count or metrics.
    pub async fn rescore(&self, server_id: i32) -> Result<(), StoreError> {
        let Some(server) = self.store.get_server(server_id).await? else {
            return Err(StoreError::NotFound(format!("server {server_id}")));
        };
        self.store
            .set_server_load_score(server_id, server_score(&server))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn server(id: i32, cpu: f64, mem: f64, clients: i32) -> Server {
        let now = Utc::now();
        Server {
            id,
            name: format!("s{id}"),
            panel_url: format!("https://s{id}.example:2053"),
            username: "admin".to_string(),
            password: "secret".to_string(),
            location: Some("eu".to_string()),
            protocol: Some("vless".to_string()),
            is_active: true,
            max_clients: 100,
            current_clients: clients,
            cpu_percent: cpu,
            mem_percent: mem,
            disk_percent: 0.0,
            uptime_seconds: 30 * 86_400,
            xray_state: Some("running".to_string()),
            xray_version: None,
            load_score: 0.0,
            last_synced_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn score_weights_sum_as_documented() {
        // Fully loaded on every axis gives exactly W_CPU + W_MEM + W_USERS.
        let full = score(100.0, 100.0, 100, 100);
        assert!((full - (W_CPU + W_MEM + W_USERS)).abs() < 1e-9);
        assert_eq!(score(0.0, 0.0, 0, 100), 0.0);
    }

    #[test]
    fn user_ratio_saturates_at_one() {
        let over = score(0.0, 0.0, 250, 100);
        assert!((over - W_USERS).abs() < 1e-9);
    }

    #[test]
    fn lowest_score_wins() {
        // Scores 0.2, 0.5, 0.5.
        let servers = vec![
            server(1, 50.0, 0.0, 0),  // 0.4*0.5 = 0.2
            server(2, 50.0, 100.0, 0), // 0.2 + 0.3 = 0.5
            server(3, 50.0, 100.0, 0), // 0.5
        ];
        let best = pick_best(&servers, &PlacementCriteria::default()).unwrap();
        assert_eq!(best.id, 1);
    }

    #[test]
    fn ties_break_on_lowest_id() {
        let servers = vec![
            server(7, 50.0, 100.0, 0),
            server(2, 50.0, 100.0, 0),
        ];
        let best = pick_best(&servers, &PlacementCriteria::default()).unwrap();
        assert_eq!(best.id, 2);
    }

    #[test]
    fn filters_apply_before_scoring() {
        let mut cheap_but_wrong_location = server(1, 0.0, 0.0, 0);
        cheap_but_wrong_location.location = Some("us".to_string());
        let mut inactive = server(2, 0.0, 0.0, 0);
        inactive.is_active = false;
        let mut full = server(3, 0.0, 0.0, 100);
        full.current_clients = 100;
        let eligible = server(4, 80.0, 80.0, 50);
        let servers = vec![cheap_but_wrong_location, inactive, full, eligible];

        let criteria = PlacementCriteria {
            location: Some("eu".to_string()),
            ..Default::default()
        };
        let best = pick_best(&servers, &criteria).unwrap();
        assert_eq!(best.id, 4);
    }

    #[test]
    fn uptime_filter_excludes_young_servers() {
        let mut young = server(1, 0.0, 0.0, 0);
        young.uptime_seconds = 86_400; // 1 day
        let old = server(2, 50.0, 50.0, 50);
        let servers = vec![young, old];
        let criteria = PlacementCriteria {
            min_uptime_days: Some(7),
            ..Default::default()
        };
        assert_eq!(pick_best(&servers, &criteria).unwrap().id, 2);
    }

    #[test]
    fn empty_candidate_set_yields_none() {
        assert!(pick_best(&[], &PlacementCriteria::default()).is_none());
        let criteria = PlacementCriteria {
            protocol: Some("trojan".to_string()),
            ..Default::default()
        };
        let servers = vec![server(1, 0.0, 0.0, 0)];
        assert!(pick_best(&servers, &criteria).is_none());
    }
}
