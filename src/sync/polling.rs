use crate::error::AppError;
use crate::sync::config::SyncConfig;
use crate::sync::observer::{ListenerRegistry, Subscription};
use crate::sync::types::Snapshot;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Stateless request/response source of the full server table.
#[async_trait]
pub trait SnapshotSource: Send + Sync + 'static {
    async fn fetch_snapshot(&self) -> Result<Snapshot, AppError>;
}

/// Decides on every tick whether a scheduled fetch is worth issuing.
pub type PollGate = Arc<dyn Fn() -> bool + Send + Sync>;

#[derive(Clone)]
struct Fetcher {
    source: Arc<dyn SnapshotSource>,
    attempts: u32,
    retry_delay: Duration,
    timeout: Duration,
}

impl Fetcher {
    async fn fetch(&self) -> Result<Snapshot, AppError> {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, self.source.fetch_snapshot()).await
            {
                Ok(result) => result,
                Err(elapsed) => Err(AppError::from(elapsed)),
            };

            match result {
                Ok(snapshot) => return Ok(snapshot),
                Err(error) if error.is_transient() && attempt < self.attempts => {
                    debug!(%error, attempt, "poll fetch failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}

struct Ticker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct PollingFallback {
    fetcher: Fetcher,
    gate: PollGate,
    listeners: ListenerRegistry<Snapshot>,
    ticker: Mutex<Option<Ticker>>,
}

impl PollingFallback {
    pub fn new(source: Arc<dyn SnapshotSource>, config: &SyncConfig) -> Self {
        Self {
            fetcher: Fetcher {
                source,
                attempts: config.poll_retries.saturating_add(1),
                retry_delay: config.poll_retry_delay,
                timeout: config.poll_timeout,
            },
            gate: Arc::new(|| true),
            listeners: ListenerRegistry::new("poll.snapshot"),
            ticker: Mutex::new(None),
        }
    }

    pub fn with_gate(mut self, gate: PollGate) -> Self {
        self.gate = gate;
        self
    }

    /// Starts (or restarts) the periodic fetch loop. Results reach `on_snapshot` listeners.
    pub fn start(&self, interval: Duration) {
        let cancel = CancellationToken::new();
        let fetcher = self.fetcher.clone();
        let gate = Arc::clone(&self.gate);
        let listeners = self.listeners.clone();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; scheduled polls begin one interval in.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if !gate() {
                            debug!("scheduled poll suppressed");
                            continue;
                        }
                        let fetched = tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            fetched = fetcher.fetch() => fetched,
                        };
                        match fetched {
                            Ok(snapshot) => {
                                listeners.notify(&snapshot);
                            }
                            Err(error) => warn!(%error, "scheduled poll failed"),
                        }
                    }
                }
            }
        });

        if let Some(previous) = self.ticker.lock().replace(Ticker { cancel, handle }) {
            previous.cancel.cancel();
        }
    }

    pub fn stop(&self) {
        if let Some(ticker) = self.ticker.lock().take() {
            ticker.cancel.cancel();
            ticker.handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.ticker
            .lock()
            .as_ref()
            .map(|ticker| !ticker.handle.is_finished())
            .unwrap_or(false)
    }

    /// One full fetch with bounded retries, bypassing the gate. Does not notify listeners.
    pub async fn fetch_now(&self) -> Result<Snapshot, AppError> {
        self.fetcher.fetch().await
    }

    pub fn on_snapshot<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.listeners.register(handler)
    }
}

impl Drop for PollingFallback {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Returns scripted results, then repeats the fallback snapshot.
    pub(crate) struct ScriptedSource {
        script: Mutex<VecDeque<Result<Snapshot, AppError>>>,
        fallback: Mutex<Option<Snapshot>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedSource {
        pub(crate) fn new(delay: Duration) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                delay,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn push(&self, result: Result<Snapshot, AppError>) {
            self.script.lock().push_back(result);
        }

        pub(crate) fn set_fallback(&self, snapshot: Snapshot) {
            *self.fallback.lock() = Some(snapshot);
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SnapshotSource for ScriptedSource {
        async fn fetch_snapshot(&self) -> Result<Snapshot, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            match next {
                Some(result) => result,
                None => self.fallback.lock().clone().ok_or(AppError::NotConnected),
            }
        }
    }
}
