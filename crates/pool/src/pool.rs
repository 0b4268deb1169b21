//! Pool - bounded set of workers draining a shared task queue

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use servprobe_common::{FingerprintError, FingerprintResult, MatchResult};
use servprobe_engine::{ConfigOption, Matcher};

use crate::progress::{PoolStats, ProgressTracker};
use crate::rate_limiter::RateLimiter;

/// One match request.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub host: String,
    pub port: u16,
    pub options: Vec<ConfigOption>,
}

impl Task {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            options: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<ConfigOption>) -> Self {
        self.options = options;
        self
    }
}

/// Invoked once per finished task, in completion order.
pub type PoolCallback = Arc<dyn Fn(&Task, &FingerprintResult<MatchResult>) + Send + Sync>;

type SharedQueue = Arc<Mutex<mpsc::UnboundedReceiver<Task>>>;

/// Runs match requests on a fixed number of workers.
///
/// Workers start in `new` and pull from one queue. `close_and_wait` stops
/// intake and returns once every queued task has been handled.
pub struct Pool {
    sender: Option<mpsc::UnboundedSender<Task>>,
    workers: Vec<JoinHandle<()>>,
    callbacks: Arc<RwLock<Vec<PoolCallback>>>,
    progress: Arc<ProgressTracker>,
    cancel: CancellationToken,
}

struct Worker {
    matcher: Arc<Matcher>,
    queue: SharedQueue,
    callbacks: Arc<RwLock<Vec<PoolCallback>>>,
    progress: Arc<ProgressTracker>,
    rate_limiter: Option<Arc<RateLimiter>>,
    cancel: CancellationToken,
}

impl Pool {
    /// A pool of `size` workers; zero takes the matcher's configured pool size.
    pub fn new(matcher: Arc<Matcher>, size: usize) -> Self {
        Self::build(matcher, size, None)
    }

    /// Like `new`, with at most `per_second` requests started each second.
    pub fn with_rate_limit(matcher: Arc<Matcher>, size: usize, per_second: u32) -> Self {
        Self::build(matcher, size, RateLimiter::new(per_second).map(Arc::new))
    }

    fn build(matcher: Arc<Matcher>, size: usize, rate_limiter: Option<Arc<RateLimiter>>) -> Self {
        let size = if size == 0 {
            matcher.config().pool_size.max(1)
        } else {
            size
        };
        let (sender, receiver) = mpsc::unbounded_channel();
        let queue: SharedQueue = Arc::new(Mutex::new(receiver));
        let callbacks: Arc<RwLock<Vec<PoolCallback>>> = Arc::new(RwLock::new(Vec::new()));
        let progress = Arc::new(ProgressTracker::new());
        let cancel = CancellationToken::new();

        let workers = (0..size)
            .map(|id| {
                let worker = Worker {
                    matcher: Arc::clone(&matcher),
                    queue: Arc::clone(&queue),
                    callbacks: Arc::clone(&callbacks),
                    progress: Arc::clone(&progress),
                    rate_limiter: rate_limiter.clone(),
                    cancel: cancel.clone(),
                };
                tokio::spawn(worker.run(id))
            })
            .collect();

        info!(workers = size, "pool started");
        Self {
            sender: Some(sender),
            workers,
            callbacks,
            progress,
            cancel,
        }
    }

    /// Register a callback; it sees every task that finishes afterwards.
    pub fn add_callback<F>(&self, callback: F)
    where
        F: Fn(&Task, &FingerprintResult<MatchResult>) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Queue a task. Fails once the pool is closed.
    pub fn submit(&self, task: Task) -> FingerprintResult<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| FingerprintError::Config("pool is closed".into()))?;
        sender
            .send(task)
            .map_err(|_| FingerprintError::Config("pool workers have stopped".into()))?;
        self.progress.increment_submitted();
        Ok(())
    }

    /// Fail whatever is still queued. In-flight requests stop dispatching new
    /// probes and return `Cancelled` once the ones on the wire finish.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.progress.snapshot()
    }

    /// Stop accepting tasks and wait for the queue to drain.
    #[instrument(skip(self))]
    pub async fn close_and_wait(mut self) -> PoolStats {
        self.sender.take();
        for worker in self.workers.drain(..) {
            if let Err(e) = worker.await {
                warn!(error = %e, "pool worker aborted");
            }
        }
        self.progress.print_summary();
        self.progress.snapshot()
    }
}

impl Worker {
    async fn run(self, id: usize) {
        loop {
            let next = {
                let mut queue = self.queue.lock().await;
                queue.recv().await
            };
            let Some(task) = next else {
                debug!(worker = id, "queue closed, worker exiting");
                break;
            };

            let outcome = if self.cancel.is_cancelled() {
                Err(FingerprintError::Cancelled)
            } else {
                if let Some(limiter) = &self.rate_limiter {
                    limiter.acquire().await;
                }
                self.matcher
                    .match_with_cancel(&self.cancel, &task.host, task.port, &task.options)
                    .await
            };

            self.progress.record(&outcome);
            let callbacks: Vec<PoolCallback> = self.callbacks.read().clone();
            for callback in &callbacks {
                callback(&task, &outcome);
            }
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.workers.len())
            .field("closed", &self.sender.is_none())
            .field("stats", &self.progress.snapshot())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use servprobe_common::PortState;
    use servprobe_engine::Config;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn matcher() -> Arc<Matcher> {
        let config = Config::default()
            .with_probe_timeout(Duration::from_secs(1))
            .with_probes_max(1);
        Arc::new(Matcher::new(config).unwrap())
    }

    async fn ssh_server() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let _ = sock.write_all(b"SSH-2.0-OpenSSH_9.3\r\n").await;
                    tokio::time::sleep(Duration::from_millis(200)).await;
                });
            }
        });
        port
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    #[tokio::test]
    async fn every_task_reaches_callbacks() {
        let open = ssh_server().await;
        let closed = closed_port().await;
        let pool = Pool::new(matcher(), 2);

        let seen: Arc<parking_lot::Mutex<Vec<(u16, PortState)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        pool.add_callback(move |task, outcome| {
            let state = outcome.as_ref().map(|r| r.state).unwrap_or(PortState::Unknown);
            sink.lock().push((task.port, state));
        });

        pool.submit(Task::new("127.0.0.1", open)).unwrap();
        pool.submit(Task::new("127.0.0.1", closed)).unwrap();
        pool.submit(Task::new("127.0.0.1", open).with_options(vec![ConfigOption::RarityMax(1)]))
            .unwrap();

        let stats = pool.close_and_wait().await;
        assert_eq!(stats.submitted, 3);
        assert_eq!(stats.completed, 3);
        assert_eq!(stats.open, 2);

        let mut seen = seen.lock().clone();
        seen.sort();
        assert_eq!(
            seen,
            {
                let mut expected = vec![
                    (open, PortState::Open),
                    (open, PortState::Open),
                    (closed, PortState::Closed),
                ];
                expected.sort();
                expected
            }
        );
    }

    #[tokio::test]
    async fn bad_options_count_as_failures() {
        let pool = Pool::new(matcher(), 1);
        let task = Task::new("127.0.0.1", 1).with_options(vec![
            ConfigOption::OnlyWebFingerprint(true),
            ConfigOption::DisableWebFingerprint(true),
        ]);
        pool.submit(task).unwrap();
        let stats = pool.close_and_wait().await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn cancelled_pool_fails_queued_tasks() {
        let pool = Pool::new(matcher(), 1);
        pool.cancel();
        let port = ssh_server().await;
        for _ in 0..3 {
            pool.submit(Task::new("127.0.0.1", port)).unwrap();
        }
        let stats = pool.close_and_wait().await;
        assert_eq!(stats.failed, 3);
    }

    #[tokio::test]
    async fn rate_limited_pool_still_drains() {
        let port = closed_port().await;
        let pool = Pool::with_rate_limit(matcher(), 0, 50);
        for _ in 0..5 {
            pool.submit(Task::new("127.0.0.1", port)).unwrap();
        }
        let stats = pool.close_and_wait().await;
        assert_eq!(stats.completed, 5);
        assert_eq!(stats.open, 0);
    }
}
