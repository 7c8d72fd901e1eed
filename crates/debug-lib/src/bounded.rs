//! Staged-timeout watchdog for external calls
//!
//! Local daemons and remote helpers are known to hang indefinitely in some
//! cases. [`BoundedOperation`] runs such a call off the caller's task and races
//! it against two timers:
//!
//! - before the soft timeout, the result is returned as soon as it is ready
//! - at the soft timeout, an informational callback fires once and waiting continues
//! - at the hard timeout, a [`BoundedError::TimedOut`] is returned and the call is abandoned
//!
//! Abandoned blocking calls are not killed. Their thread is detached so it never
//! holds up process exit.

use crate::error::DebugError;
use std::future::Future;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout_at, Instant};
use tracing::debug;

/// Default soft timeout before the operator is told we are waiting
pub const DEFAULT_SOFT_TIMEOUT: Duration = Duration::from_secs(1);

/// Default hard timeout after which the call is abandoned
pub const DEFAULT_HARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Failure of a bounded operation
#[derive(Debug, thiserror::Error)]
pub enum BoundedError<E> {
    /// The call did not finish before the hard timeout.
    #[error("{operation} timed out after {after:?}")]
    TimedOut { operation: String, after: Duration },

    /// The call's thread went away without reporting a result (panic).
    #[error("{operation} exited without reporting a result")]
    Lost { operation: String },

    /// The call finished and reported its own error.
    #[error("{0}")]
    Failed(E),
}

impl<E> BoundedError<E> {
    /// Returns true if the call never answered.
    pub fn is_timeout(&self) -> bool {
        matches!(self, BoundedError::TimedOut { .. })
    }
}

impl<E: Into<DebugError>> From<BoundedError<E>> for DebugError {
    fn from(err: BoundedError<E>) -> Self {
        match err {
            BoundedError::TimedOut { operation, after } => DebugError::TimedOut { operation, after },
            BoundedError::Lost { operation } => {
                DebugError::Remote(format!("{} exited without reporting a result", operation))
            }
            BoundedError::Failed(e) => e.into(),
        }
    }
}

/// A call guarded by a soft and a hard timeout
#[derive(Debug, Clone)]
pub struct BoundedOperation {
    name: String,
    soft_timeout: Duration,
    hard_timeout: Duration,
}

impl BoundedOperation {
    /// Create a bounded operation with the default 1s / 10s tiers
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            soft_timeout: DEFAULT_SOFT_TIMEOUT,
            hard_timeout: DEFAULT_HARD_TIMEOUT,
        }
    }

    /// Set the soft timeout
    pub fn soft_timeout(mut self, timeout: Duration) -> Self {
        self.soft_timeout = timeout;
        self
    }

    /// Set the hard timeout
    pub fn hard_timeout(mut self, timeout: Duration) -> Self {
        self.hard_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run a blocking call on its own thread.
    ///
    /// The result comes back over a oneshot channel; nothing else is shared
    /// with the spawned thread.
    pub async fn run_blocking<T, E, F, S>(&self, op: F, on_soft_timeout: S) -> Result<T, BoundedError<E>>
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        T: Send + 'static,
        E: Send + 'static,
        S: FnOnce(),
    {
        let (tx, rx) = oneshot::channel();

        let spawned = std::thread::Builder::new()
            .name(format!("bounded-{}", self.name))
            .spawn(move || {
                // Receiver may be gone if we already timed out
                let _ = tx.send(op());
            });

        if spawned.is_err() {
            return Err(BoundedError::Lost {
                operation: self.name.clone(),
            });
        }

        match self.race(rx, on_soft_timeout).await {
            Some(Ok(result)) => result.map_err(BoundedError::Failed),
            Some(Err(_)) => Err(BoundedError::Lost {
                operation: self.name.clone(),
            }),
            None => Err(self.timed_out()),
        }
    }

    /// Run an async call. On hard timeout the future is dropped, which cancels it.
    pub async fn run<T, E, Fut, S>(&self, fut: Fut, on_soft_timeout: S) -> Result<T, BoundedError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
        S: FnOnce(),
    {
        match self.race(fut, on_soft_timeout).await {
            Some(result) => result.map_err(BoundedError::Failed),
            None => Err(self.timed_out()),
        }
    }

    fn timed_out<E>(&self) -> BoundedError<E> {
        BoundedError::TimedOut {
            operation: self.name.clone(),
            after: self.hard_timeout,
        }
    }

    /// Returns `None` when the hard deadline passes first.
    async fn race<R, Fut, S>(&self, fut: Fut, on_soft_timeout: S) -> Option<R>
    where
        Fut: Future<Output = R>,
        S: FnOnce(),
    {
        let deadline = Instant::now() + self.hard_timeout;
        tokio::pin!(fut);

        if self.soft_timeout < self.hard_timeout {
            tokio::select! {
                biased;
                result = &mut fut => return Some(result),
                _ = sleep(self.soft_timeout) => {
                    debug!(operation = %self.name, "Soft timeout reached, still waiting");
                    on_soft_timeout();
                }
            }
        }

        match timeout_at(deadline, fut).await {
            Ok(result) => Some(result),
            Err(_) => {
                debug!(operation = %self.name, "Hard timeout reached, abandoning call");
                None
            }
        }
    }
}

/// Run a blocking call with explicit soft/hard timeouts.
pub async fn run_bounded<T, E, F, S>(
    op: F,
    soft_timeout: Duration,
    hard_timeout: Duration,
    on_soft_timeout: S,
) -> Result<T, BoundedError<E>>
where
    F: FnOnce() -> Result<T, E> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
    S: FnOnce(),
{
    BoundedOperation::new("operation")
        .soft_timeout(soft_timeout)
        .hard_timeout(hard_timeout)
        .run_blocking(op, on_soft_timeout)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fast_call_skips_soft_callback() {
        let fired = AtomicUsize::new(0);
        let op = BoundedOperation::new("fast");

        let result: Result<u32, BoundedError<std::io::Error>> = op
            .run(
                async {
                    sleep(Duration::from_millis(100)).await;
                    Ok(7)
                },
                || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_call_fires_soft_callback_once() {
        let fired = AtomicUsize::new(0);
        let op = BoundedOperation::new("slow");

        let result: Result<&str, BoundedError<std::io::Error>> = op
            .run(
                async {
                    sleep(Duration::from_secs(3)).await;
                    Ok("done")
                },
                || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_call_times_out_at_hard_deadline() {
        let start = Instant::now();
        let op = BoundedOperation::new("hung");

        let result: Result<(), BoundedError<std::io::Error>> =
            op.run(std::future::pending(), || {}).await;

        let err = result.unwrap_err();
        assert!(err.is_timeout());
        let elapsed = start.elapsed();
        assert!(elapsed >= DEFAULT_HARD_TIMEOUT);
        assert!(elapsed < DEFAULT_HARD_TIMEOUT + Duration::from_millis(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_not_fired_when_soft_exceeds_hard() {
        let fired = AtomicUsize::new(0);
        let op = BoundedOperation::new("odd")
            .soft_timeout(Duration::from_secs(5))
            .hard_timeout(Duration::from_secs(2));

        let result: Result<(), BoundedError<std::io::Error>> = op
            .run(std::future::pending(), || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        assert!(result.unwrap_err().is_timeout());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_blocking_call_error_is_not_timeout() {
        let op = BoundedOperation::new("refuses");

        let result: Result<(), BoundedError<String>> = op
            .run_blocking(|| Err("daemon said no".to_string()), || {})
            .await;

        match result {
            Err(BoundedError::Failed(msg)) => assert_eq!(msg, "daemon said no"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_blocking_call_between_soft_and_hard() {
        let fired = AtomicUsize::new(0);
        let op = BoundedOperation::new("sluggish")
            .soft_timeout(Duration::from_millis(50))
            .hard_timeout(Duration::from_secs(5));

        let result: Result<u8, BoundedError<String>> = op
            .run_blocking(
                || {
                    std::thread::sleep(Duration::from_millis(300));
                    Ok(42)
                },
                || {
                    fired.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_bounded_uses_given_timeouts() {
        let fired = AtomicUsize::new(0);

        let value: Result<&str, BoundedError<String>> = run_bounded(
            || Ok("pong"),
            Duration::from_millis(20),
            Duration::from_millis(200),
            || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        assert_eq!(value.unwrap(), "pong");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        let hung: Result<(), BoundedError<String>> = run_bounded(
            || -> Result<(), String> {
                loop {
                    std::thread::park();
                }
            },
            Duration::from_millis(20),
            Duration::from_millis(200),
            || {
                fired.fetch_add(1, Ordering::SeqCst);
            },
        )
        .await;
        match hung {
            Err(BoundedError::TimedOut { after, .. }) => assert_eq!(after, Duration::from_millis(200)),
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_blocking_call_panic_is_lost() {
        let op = BoundedOperation::new("panics");

        let result: Result<(), BoundedError<String>> =
            op.run_blocking(|| panic!("boom"), || {}).await;

        assert!(matches!(result, Err(BoundedError::Lost { .. })));
    }

    #[test]
    fn test_timeout_converts_to_timeout_kind() {
        let err: BoundedError<DebugError> = BoundedError::TimedOut {
            operation: "docker info".to_string(),
            after: Duration::from_secs(10),
        };
        let converted: DebugError = err.into();
        assert_eq!(converted.kind(), crate::error::ErrorKind::Timeout);
    }
}
