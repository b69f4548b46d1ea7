//! Bounded, cancellable polling

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Shortest pause between checks; a zero interval would spin
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// How a poll ended when the check never returned an error
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome<T> {
    Ready(T),
    TimedOut,
    Cancelled,
}

/// Run `check` every `interval` until it yields a value, `timeout` elapses
/// or `cancel` fires. The first check runs immediately; check errors end the
/// poll.
pub async fn poll_until<T, F, Fut>(
    interval: Duration,
    timeout: Duration,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<PollOutcome<T>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>>>,
{
    let deadline = Instant::now() + timeout;
    let mut ticker = tokio::time::interval(interval.max(MIN_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PollOutcome::Cancelled),
            _ = ticker.tick() => {}
        }

        if let Some(value) = check().await? {
            return Ok(PollOutcome::Ready(value));
        }
        if Instant::now() >= deadline {
            return Ok(PollOutcome::TimedOut);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_some_checks() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(Duration::from_secs(5), Duration::from_secs(60), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((n == 3).then_some(n)) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out() {
        let start = Instant::now();
        let outcome = poll_until(Duration::from_secs(5), Duration::from_secs(30), &CancellationToken::new(), || async {
            Ok(None::<()>)
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_polling() {
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);
        let outcome = poll_until(Duration::from_secs(1), Duration::from_secs(3600), &cancel, || {
            if calls.fetch_add(1, Ordering::SeqCst) == 2 {
                cancel.cancel();
            }
            async { Ok(None::<()>) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_still_polls() {
        let calls = AtomicU32::new(0);
        let outcome = poll_until(Duration::ZERO, Duration::from_secs(1), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Ok((n == 5).then_some(n)) }
        })
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(5));
    }

    #[tokio::test]
    async fn test_check_error_ends_poll() {
        let outcome = poll_until(Duration::from_millis(1), Duration::from_secs(1), &CancellationToken::new(), || async {
            Err::<Option<()>, _>(Error::Internal("check failed".into()))
        })
        .await;
        assert_matches!(outcome, Err(Error::Internal(_)));
    }
}
