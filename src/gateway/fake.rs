//! In-memory panel used by the engine's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::error::GatewayError;
use super::models::{ClientConfig, ClientStat, Inbound, InboundSettings, ServerStatus};
use super::{PanelApi, PanelConnector};
use crate::db::models::Server;

struct FakeClient {
    config: ClientConfig,
    up: i64,
    down: i64,
}

struct FakeInbound {
    id: i32,
    protocol: String,
    enable: bool,
    corrupt_settings: bool,
    clients: Vec<FakeClient>,
}

#[derive(Default)]
struct State {
    inbounds: Vec<FakeInbound>,
    status: ServerStatus,
    fail_auth: bool,
    fail_next_add: bool,
    fail_next_delete: bool,
    delete_calls: u32,
}

#[derive(Default)]
pub struct FakePanel {
    state: Mutex<State>,
}

impl FakePanel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_inbound(inbound_id: i32, protocol: &str) -> Self {
        let panel = Self::new();
        panel.add_inbound(inbound_id, protocol);
        panel
    }

    pub fn add_inbound(&self, inbound_id: i32, protocol: &str) {
        self.state.lock().unwrap().inbounds.push(FakeInbound {
            id: inbound_id,
            protocol: protocol.to_string(),
            enable: true,
            corrupt_settings: false,
            clients: Vec::new(),
        });
    }

    /// Makes the inbound report unparseable settings JSON.
    pub fn corrupt_settings(&self, inbound_id: i32) {
        let mut state = self.state.lock().unwrap();
        if let Some(inbound) = state.inbounds.iter_mut().find(|i| i.id == inbound_id) {
            inbound.corrupt_settings = true;
        }
    }

    pub fn insert_client(&self, inbound_id: i32, config: ClientConfig, up: i64, down: i64) {
        let mut state = self.state.lock().unwrap();
        let inbound = state
            .inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .expect("unknown inbound in fake panel");
        inbound.clients.push(FakeClient { config, up, down });
    }

    pub fn set_status(&self, status: ServerStatus) {
        self.state.lock().unwrap().status = status;
    }

    pub fn fail_auth(&self) {
        self.state.lock().unwrap().fail_auth = true;
    }

    pub fn fail_next_add(&self) {
        self.state.lock().unwrap().fail_next_add = true;
    }

    pub fn fail_next_delete(&self) {
        self.state.lock().unwrap().fail_next_delete = true;
    }

    pub fn delete_calls(&self) -> u32 {
        self.state.lock().unwrap().delete_calls
    }

    pub fn clients(&self, inbound_id: i32) -> Vec<ClientConfig> {
        let state = self.state.lock().unwrap();
        state
            .inbounds
            .iter()
            .find(|i| i.id == inbound_id)
            .map(|i| i.clients.iter().map(|c| c.config.clone()).collect())
            .unwrap_or_default()
    }

    pub fn has_client(&self, inbound_id: i32, email: &str) -> bool {
        self.clients(inbound_id).iter().any(|c| c.email == email)
    }

    fn check_auth(&self) -> Result<(), GatewayError> {
        if self.state.lock().unwrap().fail_auth {
            Err(GatewayError::Authentication(
                "credentials rejected".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    fn materialize(inbound: &FakeInbound) -> Inbound {
        let settings = InboundSettings {
            clients: inbound.clients.iter().map(|c| c.config.clone()).collect(),
        };
        Inbound {
            id: inbound.id,
            remark: format!("inbound-{}", inbound.id),
            port: 443,
            protocol: inbound.protocol.clone(),
            enable: inbound.enable,
            client_stats: inbound
                .clients
                .iter()
                .enumerate()
                .map(|(n, c)| ClientStat {
                    id: n as i64 + 1,
                    inbound_id: inbound.id,
                    enable: c.config.enable,
                    email: c.config.email.clone(),
                    up: c.up,
                    down: c.down,
                    expiry_time: c.config.expiry_time,
                    total: c.config.total_gb,
                })
                .collect(),
            settings: if inbound.corrupt_settings {
                "{\"clients\": [".to_string()
            } else {
                settings.encode()
            },
        }
    }
}

#[async_trait]
impl PanelApi for FakePanel {
    async fn list_inbounds(&self) -> Result<Vec<Inbound>, GatewayError> {
        self.check_auth()?;
        let state = self.state.lock().unwrap();
        Ok(state.inbounds.iter().map(Self::materialize).collect())
    }

    async fn get_inbound(&self, inbound_id: i32) -> Result<Inbound, GatewayError> {
        self.check_auth()?;
        let state = self.state.lock().unwrap();
        state
            .inbounds
            .iter()
            .find(|i| i.id == inbound_id)
            .map(Self::materialize)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))
    }

    async fn add_client(&self, inbound_id: i32, client: &ClientConfig) -> Result<(), GatewayError> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        if state.fail_next_add {
            state.fail_next_add = false;
            return Err(GatewayError::Operation("simulated add failure".to_string()));
        }
        let inbound = state
            .inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))?;
        if inbound.clients.iter().any(|c| c.config.email == client.email) {
            return Err(GatewayError::Operation(format!(
                "duplicate email: {}",
                client.email
            )));
        }
        inbound.clients.push(FakeClient {
            config: client.clone(),
            up: 0,
            down: 0,
        });
        Ok(())
    }

    async fn update_client(
        &self,
        inbound_id: i32,
        client: &ClientConfig,
    ) -> Result<(), GatewayError> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        let inbound = state
            .inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))?;
        let slot = inbound
            .clients
            .iter_mut()
            .find(|c| c.config.id == client.id || c.config.email == client.email)
            .ok_or_else(|| GatewayError::NotFound(format!("client {}", client.email)))?;
        slot.config = client.clone();
        Ok(())
    }

    async fn delete_client(&self, inbound_id: i32, uuid: &str) -> Result<(), GatewayError> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        state.delete_calls += 1;
        if state.fail_next_delete {
            state.fail_next_delete = false;
            return Err(GatewayError::Connection(
                "simulated delete failure".to_string(),
            ));
        }
        let inbound = state
            .inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))?;
        let before = inbound.clients.len();
        inbound.clients.retain(|c| c.config.id != uuid);
        if inbound.clients.len() == before {
            return Err(GatewayError::NotFound(format!("client {uuid}")));
        }
        Ok(())
    }

    async fn reset_client_traffic(
        &self,
        inbound_id: i32,
        email: &str,
    ) -> Result<(), GatewayError> {
        self.check_auth()?;
        let mut state = self.state.lock().unwrap();
        let inbound = state
            .inbounds
            .iter_mut()
            .find(|i| i.id == inbound_id)
            .ok_or_else(|| GatewayError::NotFound(format!("inbound {inbound_id}")))?;
        let client = inbound
            .clients
            .iter_mut()
            .find(|c| c.config.email == email)
            .ok_or_else(|| GatewayError::NotFound(format!("client {email}")))?;
        client.up = 0;
        client.down = 0;
        Ok(())
    }

    async fn server_status(&self) -> Result<ServerStatus, GatewayError> {
        self.check_auth()?;
        let state = self.state.lock().unwrap();
        Ok(state.status.clone())
    }

    async fn online_clients(&self) -> Result<Vec<String>, GatewayError> {
        self.check_auth()?;
        Ok(Vec::new())
    }
}

/// Connector handing out fake panels keyed by server id.
#[derive(Default)]
pub struct FakeConnector {
    panels: HashMap<i32, Arc<FakePanel>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, server_id: i32, panel: Arc<FakePanel>) {
        self.panels.insert(server_id, panel);
    }
}

impl PanelConnector for FakeConnector {
    fn connect(&self, server: &Server) -> Result<Arc<dyn PanelApi>, GatewayError> {
        self.panels
            .get(&server.id)
            .cloned()
            .map(|p| p as Arc<dyn PanelApi>)
            .ok_or_else(|| GatewayError::Connection(format!("no panel for server {}", server.id)))
    }
}
