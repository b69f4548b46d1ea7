//! In-memory Array Simulator
//!
//! A fabric of simulated arrays reachable through the same session port as
//! the SSH connector. Each array interprets the CLI vocabulary, keeps its
//! objects in memory and drives copy mappings and remote-copy relationships
//! through the lifecycle state machines.
//!
//! Transport faults are injected per management address, array-side faults
//! per array.

mod array;

use crate::domain::ports::{ArraySession, CliResult, Credentials, Endpoint, SessionConnector, SessionConnectorRef};
use crate::error::{Error, Result};
use crate::lifecycle::copy_mapping::CopyMapping;
use crate::lifecycle::remote_copy::RemoteCopyRelationship;
use array::{AddressState, ArrayState, FabricState};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Simulator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    /// Delay applied to every command
    pub latency_ms: u64,
    pub username: String,
    pub password: String,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            latency_ms: 0,
            username: "superuser".into(),
            password: "passw0rd".into(),
        }
    }
}

struct Fabric {
    config: SimulatorConfig,
    state: Mutex<FabricState>,
}

impl Fabric {
    fn unreachable(address: &str, reason: &str) -> Error {
        Error::Transport {
            endpoint: address.to_string(),
            reason: reason.to_string(),
        }
    }

    fn run(&self, address: &str, command: &str) -> Result<CliResult> {
        let mut state = self.state.lock();
        let addr = state
            .addresses
            .get_mut(address)
            .ok_or_else(|| Self::unreachable(address, "no route to host"))?;
        if !addr.reachable {
            return Err(Self::unreachable(address, "connection reset by peer"));
        }
        if addr.fail_next > 0 {
            addr.fail_next -= 1;
            return Err(Self::unreachable(address, "channel closed unexpectedly"));
        }
        addr.commands_seen += 1;
        let system_id = addr.system_id.clone();

        if let Some(array) = state.arrays.get_mut(&system_id) {
            array.command_log.push(command.to_string());
        }
        Ok(state.execute(&system_id, command))
    }
}

// =============================================================================
// Fabric
// =============================================================================

/// A set of simulated arrays and their management addresses
#[derive(Clone)]
pub struct SimulatedFabric {
    inner: Arc<Fabric>,
}

impl SimulatedFabric {
    pub fn new(config: SimulatorConfig) -> Self {
        Self {
            inner: Arc::new(Fabric {
                config,
                state: Mutex::new(FabricState::default()),
            }),
        }
    }

    /// Add an array reachable at `address`; it starts with pool `pool0`
    pub fn add_array(&self, name: &str, address: &str) -> SimulatedArray {
        let mut state = self.inner.state.lock();
        let system_id = format!("00000200{:08X}", 0x60A0_0000 + state.arrays.len());
        state.arrays.insert(
            system_id.clone(),
            ArrayState::new(system_id.clone(), name.to_string(), address.to_string()),
        );
        state.addresses.insert(
            address.to_string(),
            AddressState {
                system_id: system_id.clone(),
                reachable: true,
                fail_next: 0,
                commands_seen: 0,
            },
        );
        info!("Simulated array {} ({}) at {}", name, system_id, address);

        SimulatedArray {
            fabric: Arc::clone(&self.inner),
            system_id,
            address: address.to_string(),
        }
    }

    /// Make `array` also reachable at `address` (a second management IP)
    pub fn add_management_address(&self, array: &SimulatedArray, address: &str) {
        self.inner.state.lock().addresses.insert(
            address.to_string(),
            AddressState {
                system_id: array.system_id.clone(),
                reachable: true,
                fail_next: 0,
                commands_seen: 0,
            },
        );
    }

    pub fn connector(&self) -> SessionConnectorRef {
        Arc::new(SimulatedConnector {
            fabric: Arc::clone(&self.inner),
        })
    }

    pub fn set_reachable(&self, address: &str, reachable: bool) {
        if let Some(addr) = self.inner.state.lock().addresses.get_mut(address) {
            addr.reachable = reachable;
        }
    }

    /// Drop the next `count` commands sent to `address` at transport level
    pub fn fail_next_commands(&self, address: &str, count: u32) {
        if let Some(addr) = self.inner.state.lock().addresses.get_mut(address) {
            addr.fail_next = count;
        }
    }

    /// Commands delivered through `address`
    pub fn commands_seen(&self, address: &str) -> u64 {
        self.inner
            .state
            .lock()
            .addresses
            .get(address)
            .map(|a| a.commands_seen)
            .unwrap_or(0)
    }

    pub fn relationships(&self) -> Vec<RemoteCopyRelationship> {
        self.inner.state.lock().relationships.values().cloned().collect()
    }
}

// =============================================================================
// Array Handle
// =============================================================================

/// Handle to one simulated array, for setup and inspection
#[derive(Clone)]
pub struct SimulatedArray {
    fabric: Arc<Fabric>,
    system_id: String,
    address: String,
}

impl SimulatedArray {
    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Endpoint with the simulator's credentials at the array's first address
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint_at(&self.address)
    }

    pub fn endpoint_at(&self, address: &str) -> Endpoint {
        let config = &self.fabric.config;
        Endpoint::new(address, config.username.clone(), Credentials::Password(config.password.clone()))
    }

    fn with<T>(&self, f: impl FnOnce(&mut ArrayState) -> T) -> Option<T> {
        self.fabric.state.lock().arrays.get_mut(&self.system_id).map(f)
    }

    pub fn add_pool(&self, pool: &str) {
        self.with(|a| a.add_pool(pool));
    }

    pub fn add_vdisk(&self, name: &str, pool: &str, size_gb: u64) {
        self.with(|a| a.add_vdisk(name, pool, size_gb));
    }

    pub fn has_vdisk(&self, name: &str) -> bool {
        self.with(|a| a.vdisks.contains_key(name)).unwrap_or(false)
    }

    pub fn vdisk_capacity(&self, name: &str) -> Option<u64> {
        self.with(|a| a.vdisks.get(name).map(|v| v.capacity)).flatten()
    }

    /// Hosts `vdisk` is mapped to
    pub fn host_maps(&self, vdisk: &str) -> Vec<String> {
        self.with(|a| {
            a.host_maps
                .iter()
                .filter(|m| m.vdisk == vdisk)
                .map(|m| m.host.clone())
                .collect()
        })
        .unwrap_or_default()
    }

    pub fn lcmaps(&self) -> Vec<CopyMapping> {
        self.with(|a| a.lcmaps.values().cloned().collect()).unwrap_or_default()
    }

    pub fn partnership_count(&self) -> usize {
        self.with(|a| a.partnership_count()).unwrap_or(0)
    }

    pub fn command_log(&self) -> Vec<String> {
        self.with(|a| a.command_log.clone()).unwrap_or_default()
    }

    /// The next prepared mapping or group fails its flush
    pub fn fail_next_prepare(&self) {
        self.with(|a| a.faults.fail_next_prepare = true);
    }

    /// Keep mappings in `preparing` forever
    pub fn stall_prepare(&self, stall: bool) {
        self.with(|a| a.faults.stall_prepare = stall);
    }

    /// Keep relationships queried through this array from synchronizing
    pub fn stall_sync(&self, stall: bool) {
        self.with(|a| a.faults.stall_sync = stall);
    }

    /// Reject role switches issued to this array
    pub fn reject_switch(&self, reject: bool) {
        self.with(|a| a.faults.reject_switch = reject);
    }

    /// Reject relationship starts issued to this array
    pub fn reject_rc_start(&self, reject: bool) {
        self.with(|a| a.faults.reject_rc_start = reject);
    }
}

// =============================================================================
// Sessions
// =============================================================================

struct SimulatedConnector {
    fabric: Arc<Fabric>,
}

#[async_trait]
impl SessionConnector for SimulatedConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ArraySession>> {
        {
            let state = self.fabric.state.lock();
            let reachable = state
                .addresses
                .get(&endpoint.address)
                .map(|a| a.reachable)
                .unwrap_or(false);
            if !reachable {
                return Err(Fabric::unreachable(&endpoint.to_string(), "connection refused"));
            }
        }

        let config = &self.fabric.config;
        let authenticated = endpoint.username == config.username
            && matches!(&endpoint.credentials, Credentials::Password(p) if *p == config.password);
        if !authenticated {
            return Err(Fabric::unreachable(
                &endpoint.to_string(),
                &format!("authentication failed for user {}", endpoint.username),
            ));
        }

        debug!("Simulated session opened to {}", endpoint);
        Ok(Box::new(SimulatedSession {
            fabric: Arc::clone(&self.fabric),
            address: endpoint.address.clone(),
        }))
    }
}

struct SimulatedSession {
    fabric: Arc<Fabric>,
    address: String,
}

#[async_trait]
impl ArraySession for SimulatedSession {
    async fn exec(&mut self, command: &str) -> Result<CliResult> {
        let latency = self.fabric.config.latency_ms;
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.fabric.run(&self.address, command)
    }

    fn is_alive(&self) -> bool {
        self.fabric
            .state
            .lock()
            .addresses
            .get(&self.address)
            .map(|a| a.reachable)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn test_session_runs_commands() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");

        let mut session = fabric.connector().connect(&array.endpoint()).await.unwrap();
        let result = session.exec("mcsinq lssystem -delim !").await.unwrap();
        assert!(result.succeeded());
        assert!(result.stdout.contains(&format!("id!{}", array.system_id())));
        assert_eq!(array.command_log(), vec!["mcsinq lssystem -delim !".to_string()]);
    }

    #[tokio::test]
    async fn test_bad_credentials_are_refused() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let mut endpoint = array.endpoint();
        endpoint.credentials = Credentials::Password("wrong".into());

        assert!(matches!(
            fabric.connector().connect(&endpoint).await,
            Err(Error::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_transport_faults() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let mut session = fabric.connector().connect(&array.endpoint()).await.unwrap();

        fabric.fail_next_commands("10.0.0.1", 1);
        assert_matches!(session.exec("mcsinq lssystem -delim !").await, Err(Error::Transport { .. }));
        assert!(session.exec("mcsinq lssystem -delim !").await.is_ok());

        fabric.set_reachable("10.0.0.1", false);
        assert!(!session.is_alive());
        assert_eq!(fabric.commands_seen("10.0.0.1"), 1);
    }
}
