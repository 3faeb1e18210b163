// Pool of pre-opened gateway connections with bounded, retried warm-up.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use courier_transport::{Connection, Dial};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;

use crate::config::ClientConfig;
use crate::{ClientError, ErrorHook, counters, notify_hook};

/// Pool sizing and retry policy.
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub max_concurrent_opens: usize,
    pub open_attempts: u32,
    pub open_backoff: Duration,
    pub open_backoff_max: Duration,
    pub teardown_timeout: Duration,
}

impl From<&ClientConfig> for PoolSettings {
    fn from(config: &ClientConfig) -> Self {
        Self {
            size: config.pool_size,
            max_concurrent_opens: config.max_concurrent_opens,
            open_attempts: config.open_attempts,
            open_backoff: config.open_backoff,
            open_backoff_max: config.open_backoff_max,
            teardown_timeout: config.teardown_timeout,
        }
    }
}

type OpenResult = Result<Connection, ClientError>;

struct PoolInner<D> {
    dialer: D,
    settings: PoolSettings,
    hook: Option<ErrorHook>,
    opens: Semaphore,
    ready_tx: mpsc::UnboundedSender<OpenResult>,
    // Holding this lock is what makes a caller the single consumer of the
    // next warm connection.
    ready_rx: Mutex<mpsc::UnboundedReceiver<OpenResult>>,
    // Opens whose result has not been taken off the channel yet.
    outstanding: AtomicUsize,
    tasks: StdMutex<JoinSet<()>>,
    closed: AtomicBool,
}

/// Warm connections to one endpoint.
///
/// Opens run in background tasks, at most `max_concurrent_opens` at a time,
/// and each one retries with exponential backoff before giving up. Callers of
/// [`ConnectionPool::acquire`] wait for the next warm connection instead of
/// failing while opens are still in flight.
pub struct ConnectionPool<D: Dial> {
    inner: Arc<PoolInner<D>>,
}

impl<D: Dial> Clone for ConnectionPool<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Dial> ConnectionPool<D> {
    pub fn new(dialer: D, settings: PoolSettings, hook: Option<ErrorHook>) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let opens = Semaphore::new(settings.max_concurrent_opens.max(1));
        Self {
            inner: Arc::new(PoolInner {
                dialer,
                settings,
                hook,
                opens,
                ready_tx,
                ready_rx: Mutex::new(ready_rx),
                outstanding: AtomicUsize::new(0),
                tasks: StdMutex::new(JoinSet::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    /// Start opens until `target` connections are ready or on their way.
    pub fn fill(&self, target: usize) {
        while self.inner.outstanding.load(Ordering::Acquire) < target {
            if !self.spawn_open() {
                break;
            }
        }
    }

    /// Wait for the next warm connection and start one replacement.
    ///
    /// Fails only when every open has given up and none is left in flight.
    pub async fn acquire(&self) -> Result<Connection, ClientError> {
        let mut ready = self.inner.ready_rx.lock().await;
        loop {
            if self.inner.closed.load(Ordering::Acquire) && ready.is_empty() {
                return Err(ClientError::PoolClosed);
            }
            if self.inner.outstanding.load(Ordering::Acquire) == 0 {
                self.spawn_open();
            }
            let Some(result) = ready.recv().await else {
                return Err(ClientError::PoolClosed);
            };
            let remaining = self.inner.outstanding.fetch_sub(1, Ordering::AcqRel) - 1;
            match result {
                Ok(connection) => {
                    tracing::debug!(conn_id = %connection.id(), remaining, "connection acquired");
                    self.fill(self.inner.settings.size);
                    return Ok(connection);
                }
                Err(err) if remaining == 0 => {
                    tracing::error!(error = %err, "no connection could be opened");
                    return Err(err);
                }
                Err(err) => {
                    tracing::warn!(error = %err, remaining, "open gave up; waiting on the rest");
                    notify_hook(self.inner.hook.as_ref(), &err);
                }
            }
        }
    }

    /// Close every queued connection and stop outstanding opens.
    ///
    /// Opens still running after `teardown_timeout` are aborted; their
    /// half-open sockets are dropped with the task.
    pub async fn drain_and_close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.opens.close();

        let mut tasks = std::mem::take(&mut *self.tasks());
        let joined = tokio::time::timeout(self.inner.settings.teardown_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if joined.is_err() {
            tracing::warn!(
                pending = tasks.len(),
                "opens still running at teardown; aborting"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }

        let mut ready = self.inner.ready_rx.lock().await;
        ready.close();
        let mut closed = 0usize;
        while let Ok(result) = ready.try_recv() {
            if let Ok(mut connection) = result {
                connection.close().await;
                closed += 1;
            }
        }
        self.inner.outstanding.store(0, Ordering::Release);
        tracing::debug!(closed, "connection pool drained");
    }

    fn tasks(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.inner
            .tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn spawn_open(&self) -> bool {
        if self.inner.closed.load(Ordering::Acquire) {
            return false;
        }
        self.inner.outstanding.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.inner);
        let mut tasks = self.tasks();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            let result = open_with_retry(&inner).await;
            if let Err(mpsc::error::SendError(Ok(mut connection))) = inner.ready_tx.send(result) {
                connection.close().await;
            }
        });
        true
    }
}

async fn open_with_retry<D: Dial>(inner: &PoolInner<D>) -> OpenResult {
    let attempts = inner.settings.open_attempts.max(1);
    let mut attempt = 0;
    loop {
        let result = {
            let Ok(_permit) = inner.opens.acquire().await else {
                return Err(ClientError::PoolClosed);
            };
            Connection::connect(&inner.dialer).await
        };
        attempt += 1;
        match result {
            Ok(connection) => return Ok(connection),
            Err(err) => {
                counters::record_open_failure();
                tracing::warn!(
                    endpoint = %inner.dialer.endpoint(),
                    attempt,
                    attempts,
                    error = %err,
                    "connection open failed"
                );
                if attempt >= attempts {
                    return Err(ClientError::PoolExhausted {
                        attempts,
                        source: err,
                    });
                }
                notify_hook(inner.hook.as_ref(), &ClientError::Transport(err));
                let delay = backoff_delay(
                    inner.settings.open_backoff,
                    inner.settings.open_backoff_max,
                    attempt - 1,
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// `base * 2^attempt`, capped at `max`.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16)).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{GatewayScript, MemoryDialer};
    use std::collections::HashSet;

    fn settings(size: usize) -> PoolSettings {
        PoolSettings {
            size,
            max_concurrent_opens: 2,
            open_attempts: 3,
            open_backoff: Duration::from_millis(1),
            open_backoff_max: Duration::from_millis(5),
            teardown_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn backoff_doubles_until_capped() {
        let base = Duration::from_millis(200);
        let max = Duration::from_secs(5);
        assert_eq!(backoff_delay(base, max, 0), Duration::from_millis(200));
        assert_eq!(backoff_delay(base, max, 1), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, max, 3), Duration::from_millis(1600));
        assert_eq!(backoff_delay(base, max, 10), max);
        assert_eq!(backoff_delay(base, max, u32::MAX), max);
    }

    #[tokio::test]
    async fn concurrent_acquires_get_distinct_connections() {
        let (dialer, _gateway) = MemoryDialer::with_gateway(GatewayScript::default());
        let pool = ConnectionPool::new(dialer, settings(2), None);
        pool.fill(2);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                let connection = pool.acquire().await.expect("acquire");
                assert!(connection.is_open());
                connection.id()
            }));
        }
        let mut ids = HashSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await.expect("join")), "connection handed out twice");
        }
        assert_eq!(ids.len(), 8);
        pool.drain_and_close().await;
    }

    #[tokio::test]
    async fn open_failures_are_retried() {
        let (dialer, _gateway) = MemoryDialer::with_gateway(GatewayScript::default());
        dialer.fail_next(2);
        let failures = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&failures);
        let hook: ErrorHook = Arc::new(move |_err| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let pool = ConnectionPool::new(dialer.clone(), settings(1), Some(hook));
        pool.fill(1);
        let connection = pool.acquire().await.expect("acquire after retries");
        assert!(connection.is_open());
        assert_eq!(failures.load(Ordering::SeqCst), 2);
        pool.drain_and_close().await;
    }

    #[tokio::test]
    async fn abandoned_open_is_reported_while_others_succeed() {
        let (dialer, _gateway) = MemoryDialer::with_gateway(GatewayScript::default());
        dialer.fail_next(1);
        let messages = Arc::new(StdMutex::new(Vec::new()));
        let seen = Arc::clone(&messages);
        let hook: ErrorHook = Arc::new(move |err| {
            seen.lock().expect("messages").push(err.to_string());
        });
        let settings = PoolSettings {
            max_concurrent_opens: 1,
            open_attempts: 1,
            ..settings(2)
        };
        let pool = ConnectionPool::new(dialer.clone(), settings, Some(hook));
        pool.fill(2);

        let connection = pool.acquire().await.expect("second open succeeds");
        assert!(connection.is_open());
        let messages = messages.lock().expect("messages").clone();
        assert_eq!(messages.len(), 1, "{messages:?}");
        assert!(
            messages[0].contains("could not open a connection after 1 attempts"),
            "{messages:?}"
        );
        pool.drain_and_close().await;
    }

    #[tokio::test]
    async fn exhausted_opens_fail_acquire_once() {
        let (dialer, _gateway) = MemoryDialer::with_gateway(GatewayScript::default());
        dialer.fail_next(usize::MAX);
        let pool = ConnectionPool::new(dialer.clone(), settings(3), None);
        pool.fill(3);
        let err = pool.acquire().await.expect_err("exhausted");
        assert!(matches!(err, ClientError::PoolExhausted { attempts: 3, .. }), "{err}");
        assert_eq!(dialer.dials(), 9);
        pool.drain_and_close().await;
    }

    #[tokio::test]
    async fn drain_closes_queued_connections() {
        let (dialer, gateway) = MemoryDialer::with_gateway(GatewayScript::default());
        let pool = ConnectionPool::new(dialer, settings(3), None);
        pool.fill(3);
        let connection = pool.acquire().await.expect("acquire");
        drop(connection);
        pool.drain_and_close().await;
        assert!(matches!(pool.acquire().await, Err(ClientError::PoolClosed)));
        // Every accepted stream on the gateway side has been hung up.
        gateway.wait_idle().await;
    }
}
