use crate::error::AppError;
use crate::sync::observer::{ListenerRegistry, Subscription};
use crate::sync::store::{load_queue, save_queue, PersistentStore};
use crate::sync::types::{ActionOutcome, PermanentFailure, QueuedAction};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Delivers one queued mutation to the server.
#[async_trait]
pub trait ActionSender: Send + Sync + 'static {
    async fn send(&self, action: &QueuedAction) -> Result<(), AppError>;
}

/// Handed to whoever enqueued a mutation; resolves once the action is delivered
/// or evicted. Dropping it is fine, the outcome is then only logged.
#[derive(Debug)]
pub struct MutationReceipt {
    action_id: String,
    outcome: oneshot::Receiver<ActionOutcome>,
}

impl MutationReceipt {
    pub(crate) fn settled(action_id: String, outcome: ActionOutcome) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(outcome);
        Self {
            action_id,
            outcome: receiver,
        }
    }

    pub fn action_id(&self) -> &str {
        &self.action_id
    }

    pub async fn outcome(self) -> Result<ActionOutcome, AppError> {
        self.outcome.await.map_err(|_| AppError::ChannelClosed)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    pub retried: usize,
    pub failed_permanently: usize,
    pub remaining: usize,
    /// Another drain was already running, so this call did nothing.
    pub skipped: bool,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Durable FIFO of mutations waiting for connectivity.
pub struct OfflineActionQueue {
    store: Arc<dyn PersistentStore>,
    retry_ceiling: u32,
    actions: Mutex<VecDeque<QueuedAction>>,
    waiters: Mutex<HashMap<String, oneshot::Sender<ActionOutcome>>>,
    draining: AtomicBool,
    persist_lock: tokio::sync::Mutex<()>,
    failure_listeners: ListenerRegistry<PermanentFailure>,
}

impl OfflineActionQueue {
    /// Restores the persisted queue. A corrupt record is discarded so the queue
    /// starts empty rather than blocking startup.
    pub async fn load(store: Arc<dyn PersistentStore>, retry_ceiling: u32) -> Self {
        let restored = match load_queue(store.as_ref()).await {
            Ok(actions) => actions,
            Err(error) => {
                warn!(%error, "discarding unreadable offline queue");
                Vec::new()
            }
        };
        if !restored.is_empty() {
            info!(pending = restored.len(), "restored offline action queue");
        }

        Self {
            store,
            retry_ceiling,
            actions: Mutex::new(restored.into()),
            waiters: Mutex::new(HashMap::new()),
            draining: AtomicBool::new(false),
            persist_lock: tokio::sync::Mutex::new(()),
            failure_listeners: ListenerRegistry::new("queue.permanent_failure"),
        }
    }

    /// Appends and persists the action before handing back its receipt.
    pub async fn enqueue(&self, action: QueuedAction) -> MutationReceipt {
        let (sender, receiver) = oneshot::channel();
        let action_id = action.id.clone();
        debug!(id = %action_id, kind = action.kind.as_str(), "queueing offline action");

        self.waiters.lock().insert(action_id.clone(), sender);
        self.actions.lock().push_back(action);
        self.persist().await;

        MutationReceipt {
            action_id,
            outcome: receiver,
        }
    }

    /// Replays queued actions in enqueue order, each at most once per call.
    ///
    /// A failing action stays in place with its retry count bumped and the drain moves
    /// on; once the count passes the ceiling the action is evicted and reported.
    pub async fn drain(&self, sender: &dyn ActionSender) -> DrainReport {
        if self.draining.swap(true, Ordering::SeqCst) {
            debug!("drain already in progress");
            return DrainReport {
                skipped: true,
                remaining: self.size(),
                ..DrainReport::default()
            };
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport::default();
        let mut attempted = HashSet::new();

        loop {
            let next = self
                .actions
                .lock()
                .iter()
                .find(|action| !attempted.contains(&action.id))
                .cloned();
            let Some(action) = next else {
                break;
            };
            attempted.insert(action.id.clone());

            match sender.send(&action).await {
                Ok(()) => {
                    self.remove(&action.id);
                    self.persist().await;
                    self.resolve(&action.id, ActionOutcome::Delivered);
                    report.delivered += 1;
                }
                Err(error) => {
                    let evicted = self.record_failure(&action.id);
                    self.persist().await;
                    match evicted {
                        Some(retry_count) => {
                            warn!(
                                id = %action.id,
                                kind = action.kind.as_str(),
                                retry_count,
                                %error,
                                "offline action permanently failed"
                            );
                            report.failed_permanently += 1;
                            let reason = error.to_string();
                            self.resolve(
                                &action.id,
                                ActionOutcome::PermanentlyFailed {
                                    retry_count,
                                    reason: reason.clone(),
                                },
                            );
                            self.failure_listeners.notify(&PermanentFailure {
                                action_id: action.id.clone(),
                                kind: action.kind,
                                retry_count,
                                reason,
                            });
                        }
                        None => {
                            debug!(id = %action.id, %error, "offline action failed, kept for retry");
                            report.retried += 1;
                        }
                    }
                }
            }
        }

        report.remaining = self.size();
        if report.delivered + report.failed_permanently > 0 {
            info!(
                delivered = report.delivered,
                failed = report.failed_permanently,
                remaining = report.remaining,
                "offline queue drained"
            );
        }
        report
    }

    pub fn size(&self) -> usize {
        self.actions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.lock().is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> Vec<QueuedAction> {
        self.actions.lock().iter().cloned().collect()
    }

    /// Drops every pending action. Outstanding receipts resolve with `ChannelClosed`.
    pub async fn clear(&self) {
        self.actions.lock().clear();
        self.waiters.lock().clear();
        self.persist().await;
    }

    pub fn on_permanent_failure<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PermanentFailure) + Send + Sync + 'static,
    {
        self.failure_listeners.register(handler)
    }

    fn remove(&self, id: &str) {
        self.actions.lock().retain(|action| action.id != id);
    }

    /// Bumps the retry count; returns the final count when the action was evicted.
    fn record_failure(&self, id: &str) -> Option<u32> {
        let mut actions = self.actions.lock();
        let position = actions.iter().position(|action| action.id == id)?;
        let action = &mut actions[position];
        action.retry_count = action.retry_count.saturating_add(1);
        let retry_count = action.retry_count;
        if retry_count > self.retry_ceiling {
            actions.remove(position);
            return Some(retry_count);
        }
        None
    }

    fn resolve(&self, id: &str, outcome: ActionOutcome) {
        if let Some(waiter) = self.waiters.lock().remove(id) {
            let _ = waiter.send(outcome);
        }
    }

    async fn persist(&self) {
        let _write = self.persist_lock.lock().await;
        let actions: Vec<QueuedAction> = self.actions.lock().iter().cloned().collect();
        if let Err(error) = save_queue(self.store.as_ref(), &actions).await {
            warn!(%error, pending = actions.len(), "failed to persist offline queue");
        }
    }
}
