//! Channel Metrics
//!
//! Cache-line aligned counters updated on the command path. Readers take a
//! [`ChannelStatsSnapshot`]; the binary exports it in Prometheus text format.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Cache line size for alignment
pub const CACHE_LINE_SIZE: usize = 64;

/// Counters for one command channel, aligned to prevent false sharing
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ChannelMetrics {
    /// Commands handed to the channel
    pub commands: AtomicU64,
    /// Commands the array rejected
    pub rejected: AtomicU64,
    /// Transport failures (connect, handshake, drop, pool timeout)
    pub transport_errors: AtomicU64,
    /// Re-executions of the same command on the same endpoint
    pub retries: AtomicU64,
    /// Active endpoint changes
    pub endpoint_switches: AtomicU64,
    /// Sessions opened
    pub sessions_opened: AtomicU64,
    /// Last update timestamp (Unix millis)
    pub last_update_ms: AtomicU64,
    _padding: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<ChannelMetrics>() <= CACHE_LINE_SIZE);

impl Default for ChannelMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelMetrics {
    pub fn new() -> Self {
        Self {
            commands: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            transport_errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            endpoint_switches: AtomicU64::new(0),
            sessions_opened: AtomicU64::new(0),
            last_update_ms: AtomicU64::new(0),
            _padding: [0; 8],
        }
    }

    #[inline]
    fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
        self.last_update_ms
            .store(Utc::now().timestamp_millis() as u64, Ordering::Release);
    }

    #[inline]
    pub fn record_command(&self) {
        self.bump(&self.commands);
    }

    #[inline]
    pub fn record_rejected(&self) {
        self.bump(&self.rejected);
    }

    #[inline]
    pub fn record_transport_error(&self) {
        self.bump(&self.transport_errors);
    }

    #[inline]
    pub fn record_retry(&self) {
        self.bump(&self.retries);
    }

    #[inline]
    pub fn record_switch(&self) {
        self.bump(&self.endpoint_switches);
    }

    #[inline]
    pub fn record_session_opened(&self) {
        self.bump(&self.sessions_opened);
    }

    pub fn snapshot(&self) -> ChannelStatsSnapshot {
        ChannelStatsSnapshot {
            commands: self.commands.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            endpoint_switches: self.endpoint_switches.load(Ordering::Relaxed),
            sessions_opened: self.sessions_opened.load(Ordering::Relaxed),
            last_update_ms: self.last_update_ms.load(Ordering::Acquire),
        }
    }
}

/// Point-in-time copy of channel counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStatsSnapshot {
    pub commands: u64,
    pub rejected: u64,
    pub transport_errors: u64,
    pub retries: u64,
    pub endpoint_switches: u64,
    pub sessions_opened: u64,
    pub last_update_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = ChannelMetrics::new();
        metrics.record_command();
        metrics.record_command();
        metrics.record_switch();

        let snap = metrics.snapshot();
        assert_eq!(snap.commands, 2);
        assert_eq!(snap.endpoint_switches, 1);
        assert_eq!(snap.rejected, 0);
        assert!(snap.last_update_ms > 0);
    }
}
