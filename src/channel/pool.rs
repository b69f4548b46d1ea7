//! Bounded Session Pool
//!
//! Sessions to one endpoint, bounded by a semaphore. Callers that find the
//! pool exhausted wait up to the acquire timeout; this is the admission
//! control against the array's session limit. Healthy sessions return to the
//! pool when their guard drops, failed ones are discarded.

use crate::config::ChannelConfig;
use crate::domain::ports::{ArraySession, CliResult, Endpoint, SessionConnectorRef};
use crate::error::{Error, Result};
use crate::metrics::ChannelMetrics;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

/// Pool of sessions bound to one endpoint
pub struct SessionPool {
    endpoint: Endpoint,
    connector: SessionConnectorRef,
    idle: Mutex<Vec<Box<dyn ArraySession>>>,
    permits: Arc<Semaphore>,
    max_size: usize,
    acquire_timeout: Duration,
    connect_timeout: Duration,
    command_timeout: Duration,
    metrics: Arc<ChannelMetrics>,
}

impl SessionPool {
    /// Create a pool and open `pool_min` sessions eagerly.
    ///
    /// Fails if any of the initial sessions cannot be established.
    pub async fn create(
        endpoint: Endpoint,
        connector: SessionConnectorRef,
        config: &ChannelConfig,
        metrics: Arc<ChannelMetrics>,
    ) -> Result<Arc<Self>> {
        let pool = Arc::new(Self {
            endpoint,
            connector,
            idle: Mutex::new(Vec::with_capacity(config.pool_max)),
            permits: Arc::new(Semaphore::new(config.pool_max)),
            max_size: config.pool_max,
            acquire_timeout: config.acquire_timeout(),
            connect_timeout: config.connect_timeout(),
            command_timeout: config.command_timeout(),
            metrics,
        });

        for _ in 0..config.pool_min.min(config.pool_max) {
            let session = pool.open_session().await?;
            pool.idle.lock().push(session);
        }

        info!(
            "Session pool ready for {} ({} idle, max {})",
            pool.endpoint,
            pool.idle_count(),
            pool.max_size
        );
        Ok(pool)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Sessions that could be handed out right now
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    async fn open_session(&self) -> Result<Box<dyn ArraySession>> {
        debug!("Opening session to {}", self.endpoint);
        let session = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.endpoint))
            .await
            .map_err(|_| Error::Transport {
                endpoint: self.endpoint.to_string(),
                reason: format!("connect timed out after {:?}", self.connect_timeout),
            })??;
        self.metrics.record_session_opened();
        Ok(session)
    }

    /// Check out a session, waiting for a free slot up to the acquire timeout
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledSession> {
        let permit = tokio::time::timeout(self.acquire_timeout, self.permits.clone().acquire_owned())
            .await
            .map_err(|_| Error::PoolExhausted {
                endpoint: self.endpoint.to_string(),
                waited: self.acquire_timeout,
            })?
            .map_err(|_| Error::Internal(format!("session pool for {} closed", self.endpoint)))?;

        let reusable = {
            let mut idle = self.idle.lock();
            let mut found = None;
            while let Some(session) = idle.pop() {
                if session.is_alive() {
                    found = Some(session);
                    break;
                }
            }
            found
        };

        let session = match reusable {
            Some(session) => session,
            None => self.open_session().await?,
        };

        Ok(PooledSession {
            session: Some(session),
            pool: Arc::clone(self),
            broken: false,
            _permit: permit,
        })
    }

    fn release(&self, session: Box<dyn ArraySession>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_size {
            idle.push(session);
        }
    }
}

/// A session checked out of a [`SessionPool`]
pub struct PooledSession {
    session: Option<Box<dyn ArraySession>>,
    pool: Arc<SessionPool>,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    /// Run one command; a transport failure retires the session
    pub async fn exec(&mut self, command: &str) -> Result<CliResult> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::Internal("pooled session already released".into()))?;

        let outcome = tokio::time::timeout(self.pool.command_timeout, session.exec(command)).await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(Error::Transport {
                endpoint: self.pool.endpoint.to_string(),
                reason: format!("command timed out after {:?}", self.pool.command_timeout),
            }),
        };

        if let Err(e) = &result {
            if e.is_transport() {
                warn!("Discarding session to {}: {}", self.pool.endpoint, e);
                self.broken = true;
            }
        }
        result
    }
}

impl Drop for PooledSession {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            if !self.broken && session.is_alive() {
                self.pool.release(session);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::{SimulatedFabric, SimulatorConfig};

    fn config(min: usize, max: usize) -> ChannelConfig {
        ChannelConfig {
            pool_min: min,
            pool_max: max,
            acquire_timeout_secs: 1,
            ..ChannelConfig::default()
        }
    }

    #[tokio::test]
    async fn test_sessions_are_reused() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let metrics = Arc::new(ChannelMetrics::new());

        let pool = SessionPool::create(array.endpoint(), fabric.connector(), &config(1, 2), metrics.clone())
            .await
            .unwrap();
        assert_eq!(pool.idle_count(), 1);

        for _ in 0..3 {
            let mut session = pool.acquire().await.unwrap();
            let result = session.exec("mcsinq lssystem -delim !").await.unwrap();
            assert!(result.succeeded());
        }
        assert_eq!(metrics.snapshot().sessions_opened, 1);
        assert_eq!(pool.available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_times_out() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        let pool = SessionPool::create(
            array.endpoint(),
            fabric.connector(),
            &config(0, 1),
            Arc::new(ChannelMetrics::new()),
        )
        .await
        .unwrap();

        let _held = pool.acquire().await.unwrap();
        assert!(matches!(pool.acquire().await, Err(Error::PoolExhausted { .. })));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_fails_creation() {
        let fabric = SimulatedFabric::new(SimulatorConfig::default());
        let array = fabric.add_array("array-a", "10.0.0.1");
        fabric.set_reachable("10.0.0.1", false);

        let result = SessionPool::create(
            array.endpoint(),
            fabric.connector(),
            &config(1, 2),
            Arc::new(ChannelMetrics::new()),
        )
        .await;
        assert!(matches!(result, Err(Error::Transport { .. })));
    }
}
