//! Command Channel
//!
//! Ships command lines to the active endpoint of an array and returns the
//! raw output. The channel owns a session pool per active endpoint and
//! recovers from transport failures by switching to the alternate endpoint:
//!
//! - pool creation failing on the active endpoint falls through to the
//!   alternate, which becomes active on success;
//! - a transport failure while executing moves from primary to secondary,
//!   rebuilds the pool and retries the command exactly once.
//!
//! Commands the array rejects never move the channel.

use crate::channel::endpoint::{EndpointRole, EndpointSet};
use crate::channel::pool::SessionPool;
use crate::config::{ArrayConfig, ChannelConfig};
use crate::domain::ports::{CliResult, Endpoint, SessionConnectorRef};
use crate::error::{Error, Result};
use crate::metrics::{ChannelMetrics, ChannelStatsSnapshot};
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Characters that would let a token escape into the remote shell
const SHELL_METACHARACTERS: &[char] = &[
    ';', '|', '&', '$', '`', '<', '>', '(', ')', '{', '}', '\\', '\'', '"',
];

/// Reject token lists that could inject shell syntax
pub fn validate_tokens<S: AsRef<str>>(tokens: &[S]) -> Result<()> {
    if tokens.is_empty() {
        return Err(Error::InvalidInput("empty command".into()));
    }
    for token in tokens {
        let token = token.as_ref();
        if token.is_empty() {
            return Err(Error::InvalidInput("empty command token".into()));
        }
        if let Some(c) = token
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || SHELL_METACHARACTERS.contains(c))
        {
            return Err(Error::InvalidInput(format!(
                "token {:?} contains forbidden character {:?}",
                token, c
            )));
        }
    }
    Ok(())
}

// =============================================================================
// Active Endpoint State
// =============================================================================

struct ActiveEndpoint {
    role: EndpointRole,
    /// Bumped on every endpoint change
    generation: u64,
    pool: Option<Arc<SessionPool>>,
}

// =============================================================================
// Command Channel
// =============================================================================

/// Executes CLI commands against one array
pub struct CommandChannel {
    endpoints: EndpointSet,
    connector: SessionConnectorRef,
    config: ChannelConfig,
    active: RwLock<ActiveEndpoint>,
    /// Serializes pool creation and endpoint switches
    switch_lock: tokio::sync::Mutex<()>,
    metrics: Arc<ChannelMetrics>,
}

impl CommandChannel {
    /// Create a channel; no session is opened until the first command
    pub fn new(array: &ArrayConfig, connector: SessionConnectorRef) -> Self {
        Self {
            endpoints: EndpointSet::new(array.primary.clone(), array.secondary.clone()),
            connector,
            config: array.channel.clone(),
            active: RwLock::new(ActiveEndpoint {
                role: EndpointRole::Primary,
                generation: 0,
                pool: None,
            }),
            switch_lock: tokio::sync::Mutex::new(()),
            metrics: Arc::new(ChannelMetrics::new()),
        }
    }

    /// Endpoint currently used for commands
    pub fn active_role(&self) -> EndpointRole {
        self.active.read().role
    }

    /// Address of the endpoint currently used for commands
    pub fn active_address(&self) -> String {
        let role = self.active_role();
        self.endpoints
            .get(role)
            .map(|ep| ep.address.clone())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> ChannelStatsSnapshot {
        self.metrics.snapshot()
    }

    fn current(&self) -> (u64, Option<Arc<SessionPool>>) {
        let active = self.active.read();
        (active.generation, active.pool.clone())
    }

    /// Return the active pool, creating it on first use
    pub async fn ensure_pool(&self) -> Result<(u64, Arc<SessionPool>)> {
        if let (generation, Some(pool)) = self.current() {
            return Ok((generation, pool));
        }

        let _guard = self.switch_lock.lock().await;
        if let (generation, Some(pool)) = self.current() {
            return Ok((generation, pool));
        }

        let role = self.active_role();
        let endpoint = self
            .endpoints
            .get(role)
            .cloned()
            .ok_or_else(|| Error::Configuration(format!("no {} endpoint configured", role)))?;

        match self.create_pool(&endpoint).await {
            Ok(pool) => Ok(self.install(role, pool, false)),
            Err(e) => {
                let Some((alt_role, alt_endpoint)) = self.endpoints.alternate(role) else {
                    error!("Unable to create session pool for {}: {}", endpoint, e);
                    return Err(e);
                };
                warn!(
                    "Unable to create session pool for {} endpoint {}: {}; trying {} endpoint {}",
                    role, endpoint, e, alt_role, alt_endpoint
                );
                let pool = self.create_pool(alt_endpoint).await.map_err(|alt_err| {
                    error!("Unable to create session pool for {}: {}", alt_endpoint, alt_err);
                    alt_err
                })?;
                Ok(self.install(alt_role, pool, true))
            }
        }
    }

    async fn create_pool(&self, endpoint: &Endpoint) -> Result<Arc<SessionPool>> {
        SessionPool::create(
            endpoint.clone(),
            Arc::clone(&self.connector),
            &self.config,
            Arc::clone(&self.metrics),
        )
        .await
        .map_err(|e| {
            if e.is_transport() {
                self.metrics.record_transport_error();
            }
            e
        })
    }

    fn install(&self, role: EndpointRole, pool: Arc<SessionPool>, switched: bool) -> (u64, Arc<SessionPool>) {
        let mut active = self.active.write();
        if switched || active.role != role {
            active.generation += 1;
            self.metrics.record_switch();
            info!("Active endpoint is now {} ({})", role, pool.endpoint());
        }
        active.role = role;
        active.pool = Some(Arc::clone(&pool));
        (active.generation, pool)
    }

    /// Move from primary to secondary after a failure seen at `failed_generation`.
    ///
    /// If another caller already switched, the new pool is returned without
    /// switching again.
    async fn switch_endpoint(&self, failed_generation: u64, cause: Error) -> Result<Arc<SessionPool>> {
        let _guard = self.switch_lock.lock().await;

        if let (generation, Some(pool)) = self.current() {
            if generation != failed_generation {
                debug!("Endpoint already switched to {} by a concurrent caller", pool.endpoint());
                return Ok(pool);
            }
        }

        let role = self.active_role();
        let target = match (role, self.endpoints.get(EndpointRole::Secondary)) {
            (EndpointRole::Primary, Some(secondary)) => secondary.clone(),
            _ => {
                error!("No alternate endpoint left after failure on {} endpoint: {}", role, cause);
                return Err(cause);
            }
        };

        warn!("Command failed on primary endpoint ({}); switching to {}", cause, target);
        let pool = self.create_pool(&target).await?;
        let (_, pool) = self.install(EndpointRole::Secondary, pool, true);
        Ok(pool)
    }

    fn retry_backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.config.retry_initial_interval())
            .with_multiplier(self.config.retry_multiplier)
            .with_max_interval(self.config.retry_max_interval())
            .with_randomization_factor(0.25)
            .with_max_elapsed_time(None)
            .build()
    }

    async fn run_once(&self, pool: &Arc<SessionPool>, command: &str) -> Result<CliResult> {
        let mut session = pool.acquire().await?;
        session.exec(command).await
    }

    /// Run `command` up to `attempts` times on one pool, pausing between tries
    async fn run_with_attempts(&self, pool: &Arc<SessionPool>, command: &str, attempts: u32) -> Result<CliResult> {
        let attempts = attempts.max(1);
        let mut backoff = self.retry_backoff();
        let mut attempt = 1;
        loop {
            match self.run_once(pool, command).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transport() && attempt < attempts => {
                    self.metrics.record_transport_error();
                    self.metrics.record_retry();
                    let pause = backoff
                        .next_backoff()
                        .unwrap_or_else(|| self.config.retry_max_interval());
                    warn!(
                        "Attempt {}/{} of '{}' failed: {}; retrying in {:?}",
                        attempt, attempts, command, e, pause
                    );
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transport() {
                        self.metrics.record_transport_error();
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Execute a command line built from `tokens`.
    ///
    /// With `check_exit`, a non-zero exit status becomes
    /// [`Error::ArrayCommand`]; otherwise the raw result is returned.
    pub async fn execute<S: AsRef<str>>(&self, tokens: &[S], check_exit: bool, attempts: u32) -> Result<CliResult> {
        validate_tokens(tokens)?;
        let command = tokens.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(" ");
        self.metrics.record_command();

        let (generation, pool) = self.ensure_pool().await?;
        debug!("Running on {}: {}", pool.endpoint(), command);

        let result = match self.run_with_attempts(&pool, &command, attempts).await {
            Ok(result) => result,
            Err(e) if e.is_transport() => {
                let pool = self.switch_endpoint(generation, e).await?;
                info!("Retrying '{}' on {}", command, pool.endpoint());
                self.run_with_attempts(&pool, &command, 1).await?
            }
            Err(e) => return Err(e),
        };

        if check_exit && !result.succeeded() {
            self.metrics.record_rejected();
            return Err(Error::ArrayCommand {
                command,
                stdout: result.stdout,
                stderr: result.stderr,
            });
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::Credentials;
    use crate::simulator::{SimulatedArray, SimulatedFabric, SimulatorConfig};
    use assert_matches::assert_matches;

    const LSSYSTEM: &[&str] = &["mcsinq", "lssystem", "-delim", "!"];

    fn dual_endpoint_array(fabric: &SimulatedFabric) -> (SimulatedArray, ArrayConfig) {
        let array = fabric.add_array("array-a", "10.0.0.1");
        fabric.add_management_address(&array, "10.0.0.2");
        let config = ArrayConfig::new(array.endpoint()).with_secondary(array.endpoint_at("10.0.0.2"));
        (array, config)
    }

    #[test]
    fn test_token_validation() {
        assert!(validate_tokens(&["mcsinq", "lsvdisk", "-delim", "!", "vol-1"]).is_ok());
        assert!(validate_tokens(&["mcsop", "mkvdisk", "-rsize", "2%"]).is_ok());

        for bad in ["vol;rm", "a|b", "$(x)", "`id`", "a b", "x\ny", "a>b", "it's"] {
            assert_matches!(
                validate_tokens(&["mcsop", "rmvdisk", bad]),
                Err(Error::InvalidInput(_)),
                "{:?}",
                bad
            );
        }
        let empty: [&str; 0] = [];
        assert_matches!(validate_tokens(&empty), Err(Error::InvalidInput(_)));
        assert_matches!(validate_tokens(&["mcsinq", ""]), Err(Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_execute_on_healthy_channel() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let channel = CommandChannel::new(&ArrayConfig::new(array.endpoint()), fabric.connector());

        let result = channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert!(result.succeeded());
        assert!(result.stdout.contains("name!array-a"));
        assert_eq!(channel.active_role(), EndpointRole::Primary);
    }

    #[tokio::test]
    async fn test_injection_is_rejected_before_sending() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let channel = CommandChannel::new(&ArrayConfig::new(array.endpoint()), fabric.connector());

        let err = channel
            .execute(&["mcsop", "rmvdisk", "vol;reboot"], true, 1)
            .await
            .unwrap_err();
        assert_matches!(err, Error::InvalidInput(_));
        assert!(array.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_command_keeps_endpoint() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, config) = dual_endpoint_array(&fabric);
        let channel = CommandChannel::new(&config, fabric.connector());

        let err = channel
            .execute(&["mcsop", "rmvdisk", "missing"], true, 1)
            .await
            .unwrap_err();
        assert_matches!(err, Error::ArrayCommand { .. });
        assert!(err.has_cli_code(&["CMMVC5753E"]));
        assert_eq!(channel.active_role(), EndpointRole::Primary);

        let raw = channel.execute(&["mcsop", "rmvdisk", "missing"], false, 1).await.unwrap();
        assert!(!raw.succeeded());
    }

    #[tokio::test]
    async fn test_transport_failure_switches_to_secondary() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, config) = dual_endpoint_array(&fabric);
        let channel = CommandChannel::new(&config, fabric.connector());

        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert_eq!(channel.active_role(), EndpointRole::Primary);

        fabric.set_reachable("10.0.0.1", false);

        let result = channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert!(result.succeeded());
        assert_eq!(channel.active_role(), EndpointRole::Secondary);
        assert_eq!(channel.active_address(), "10.0.0.2");

        fabric.set_reachable("10.0.0.1", true);
        let before = fabric.commands_seen("10.0.0.1");
        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert_eq!(fabric.commands_seen("10.0.0.1"), before);
        assert_eq!(channel.stats().endpoint_switches, 1);
    }

    #[tokio::test]
    async fn test_pool_creation_falls_back_to_secondary() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, config) = dual_endpoint_array(&fabric);
        fabric.set_reachable("10.0.0.1", false);
        let channel = CommandChannel::new(&config, fabric.connector());

        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert_eq!(channel.active_role(), EndpointRole::Secondary);
    }

    #[tokio::test]
    async fn test_no_secondary_propagates_failure() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let channel = CommandChannel::new(&ArrayConfig::new(array.endpoint()), fabric.connector());

        fabric.set_reachable("10.0.0.1", false);
        assert_matches!(channel.execute(LSSYSTEM, true, 1).await, Err(Error::Transport { .. }));
    }

    #[tokio::test]
    async fn test_secondary_failure_is_not_switched_back() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, config) = dual_endpoint_array(&fabric);
        let channel = CommandChannel::new(&config, fabric.connector());

        fabric.set_reachable("10.0.0.1", false);
        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert_eq!(channel.active_role(), EndpointRole::Secondary);

        fabric.set_reachable("10.0.0.1", true);
        fabric.fail_next_commands("10.0.0.2", 1);
        assert_matches!(channel.execute(LSSYSTEM, true, 1).await, Err(Error::Transport { .. }));
        assert_eq!(channel.active_role(), EndpointRole::Secondary);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_retry_same_endpoint() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, config) = dual_endpoint_array(&fabric);
        let channel = CommandChannel::new(&config, fabric.connector());

        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        fabric.fail_next_commands("10.0.0.1", 2);

        channel.execute(LSSYSTEM, true, 3).await.unwrap();
        assert_eq!(channel.active_role(), EndpointRole::Primary);
        assert_eq!(channel.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_saturated_pool_surfaces_without_switching() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, mut config) = dual_endpoint_array(&fabric);
        config.channel.pool_max = 1;
        let channel = CommandChannel::new(&config, fabric.connector());

        let (_, pool) = channel.ensure_pool().await.unwrap();
        let held = pool.acquire().await.unwrap();

        assert_matches!(
            channel.execute(LSSYSTEM, true, 3).await,
            Err(Error::PoolExhausted { .. })
        );
        assert_eq!(channel.active_role(), EndpointRole::Primary);
        assert_eq!(channel.stats().endpoint_switches, 0);
        assert_eq!(channel.stats().retries, 0);

        drop(held);
        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        assert_eq!(channel.active_role(), EndpointRole::Primary);
    }

    #[tokio::test]
    async fn test_concurrent_failures_switch_once() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let (_array, mut config) = dual_endpoint_array(&fabric);
        config.channel.pool_min = 4;
        config.channel.pool_max = 4;
        let channel = Arc::new(CommandChannel::new(&config, fabric.connector()));

        channel.execute(LSSYSTEM, true, 1).await.unwrap();
        fabric.set_reachable("10.0.0.1", false);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let channel = Arc::clone(&channel);
                tokio::spawn(async move { channel.execute(LSSYSTEM, true, 1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(channel.active_role(), EndpointRole::Secondary);
        assert_eq!(channel.stats().endpoint_switches, 1);
    }

    #[test]
    fn test_endpoint_helper() {
        let ep = Endpoint::new("10.9.9.9", "admin", Credentials::Password("pw".into()));
        let channel = CommandChannel::new(
            &ArrayConfig::new(ep),
            SimulatedFabric::new(SimulatorConfig::default()).connector(),
        );
        assert_eq!(channel.active_address(), "10.9.9.9");
    }
}
