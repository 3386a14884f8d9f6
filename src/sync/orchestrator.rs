use crate::error::AppError;
use crate::sync::config::SyncConfig;
use crate::sync::connectivity::ConnectivityMonitor;
use crate::sync::merge::{merge_deltas, merge_snapshot, MergeReport};
use crate::sync::observer::{ListenerRegistry, Subscription};
use crate::sync::polling::{PollGate, PollingFallback, SnapshotSource};
use crate::sync::push::{PushChannel, PushConnector};
use crate::sync::queue::{ActionSender, DrainReport, MutationReceipt, OfflineActionQueue};
use crate::sync::store::{load_snapshot, reset_snapshot, save_snapshot, PersistentStore};
use crate::sync::types::{
    now_unix_ms, ActionOutcome, ConnectivityState, DeltaBatch, PermanentFailure,
    PriceTable, PushChannelState, QueuedAction, Snapshot, SnapshotOrigin, SyncPhase,
    SyncStatusSnapshot,
};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Network and storage edges the orchestrator is assembled from.
pub struct SyncDependencies {
    pub connector: Arc<dyn PushConnector>,
    pub source: Arc<dyn SnapshotSource>,
    pub sender: Arc<dyn ActionSender>,
    pub store: Arc<dyn PersistentStore>,
    pub connectivity: Arc<ConnectivityMonitor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Applied(MergeReport),
    Offline,
    Failed(String),
}

#[derive(Debug, Clone)]
struct TableView {
    table: Arc<PriceTable>,
    captured_at: Option<i64>,
    origin: Option<SnapshotOrigin>,
    last_update_ms: Option<i64>,
    last_push_ms: Option<i64>,
    phase: SyncPhase,
    reason: Option<String>,
}

impl Default for TableView {
    fn default() -> Self {
        Self {
            table: Arc::new(PriceTable::new()),
            captured_at: None,
            origin: None,
            last_update_ms: None,
            last_push_ms: None,
            phase: SyncPhase::Bootstrapping,
            reason: None,
        }
    }
}

enum Update {
    Snapshot {
        snapshot: Snapshot,
        ack: Option<oneshot::Sender<MergeReport>>,
    },
    Delta(DeltaBatch),
}

enum Ingest {
    Update(Update),
    ReconcileFinished(Option<DrainReport>),
    Reset(oneshot::Sender<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PushDirective {
    Hold,
    Connect,
    Disconnect,
}

type RefreshFuture = Shared<BoxFuture<'static, RefreshOutcome>>;

/// Coalesces concurrent refresh requests onto one in-flight fetch.
struct Refresher {
    polling: Arc<PollingFallback>,
    ingest: mpsc::UnboundedSender<Ingest>,
    connectivity: Arc<ConnectivityMonitor>,
    inflight: Mutex<Option<(u64, RefreshFuture)>>,
    next_id: AtomicU64,
}

impl Refresher {
    async fn refresh(&self) -> RefreshOutcome {
        if self.connectivity.current() == ConnectivityState::Disconnected {
            return RefreshOutcome::Offline;
        }

        let (id, pending) = {
            let mut inflight = self.inflight.lock();
            match inflight.as_ref() {
                Some((id, pending)) => (*id, pending.clone()),
                None => {
                    let id = self.next_id.fetch_add(1, Ordering::SeqCst);
                    let pending =
                        fetch_and_apply(Arc::clone(&self.polling), self.ingest.clone())
                            .boxed()
                            .shared();
                    *inflight = Some((id, pending.clone()));
                    (id, pending)
                }
            }
        };

        let outcome = pending.await;

        let mut inflight = self.inflight.lock();
        if inflight.as_ref().map(|(current, _)| *current == id).unwrap_or(false) {
            inflight.take();
        }
        outcome
    }
}

async fn fetch_and_apply(
    polling: Arc<PollingFallback>,
    ingest: mpsc::UnboundedSender<Ingest>,
) -> RefreshOutcome {
    let snapshot = match polling.fetch_now().await {
        Ok(snapshot) => snapshot,
        Err(error) => {
            warn!(%error, "refresh fetch failed, keeping held data");
            return RefreshOutcome::Failed(error.to_string());
        }
    };

    let (ack, applied) = oneshot::channel();
    let update = Update::Snapshot {
        snapshot,
        ack: Some(ack),
    };
    if ingest.send(Ingest::Update(update)).is_err() {
        return RefreshOutcome::Failed(AppError::ChannelClosed.to_string());
    }
    match applied.await {
        Ok(report) => RefreshOutcome::Applied(report),
        Err(_) => RefreshOutcome::Failed(AppError::ChannelClosed.to_string()),
    }
}

pub struct SyncOrchestrator {
    config: SyncConfig,
    view: Arc<RwLock<TableView>>,
    connectivity: Arc<ConnectivityMonitor>,
    push: Arc<PushChannel>,
    polling: Arc<PollingFallback>,
    queue: Arc<OfflineActionQueue>,
    sender: Arc<dyn ActionSender>,
    refresher: Arc<Refresher>,
    table_listeners: ListenerRegistry<Arc<PriceTable>>,
    subscriptions: Mutex<BTreeSet<String>>,
    ingest: mpsc::UnboundedSender<Ingest>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    source_listeners: Mutex<Vec<Subscription>>,
}

impl SyncOrchestrator {
    /// Loads the cached snapshot and queue, then starts the writer, the subscriber
    /// dispatcher, the poll schedule and the first push connection.
    pub async fn start(config: SyncConfig, deps: SyncDependencies) -> Arc<Self> {
        let initial_connectivity = deps.connectivity.current();
        let mut view = TableView::default();
        let mut table = PriceTable::new();

        match load_snapshot(deps.store.as_ref()).await {
            Ok(Some(cached)) => {
                let captured_at = cached.captured_at;
                merge_snapshot(
                    &mut table,
                    Snapshot {
                        origin: SnapshotOrigin::Cache,
                        ..cached
                    },
                );
                view.table = Arc::new(table.clone());
                view.captured_at = Some(captured_at);
                view.origin = Some(SnapshotOrigin::Cache);
                view.last_update_ms = Some(captured_at);
                info!(codes = table.len(), captured_at, "loaded cached price snapshot");
            }
            Ok(None) => debug!("no cached price snapshot"),
            Err(error) => warn!(%error, "ignoring unreadable price snapshot"),
        }
        if initial_connectivity == ConnectivityState::Disconnected {
            view.phase = SyncPhase::Offline;
            view.reason = Some("starting without connectivity".to_string());
        }

        let persisted_captured_at = view.captured_at;
        let (table_tx, table_rx) = watch::channel(Arc::clone(&view.table));
        let view = Arc::new(RwLock::new(view));

        let queue = Arc::new(
            OfflineActionQueue::load(Arc::clone(&deps.store), config.retry_ceiling).await,
        );
        let push = Arc::new(PushChannel::new(deps.connector, &config));
        let polling = Arc::new(
            PollingFallback::new(deps.source, &config).with_gate(poll_gate(
                &config,
                Arc::clone(&view),
                Arc::clone(&deps.connectivity),
                Arc::clone(&push),
            )),
        );

        let (ingest_tx, ingest_rx) = mpsc::unbounded_channel();
        let (push_control, push_directives) = watch::channel(PushDirective::Hold);
        let cancel = CancellationToken::new();

        let snapshot_ingest = ingest_tx.clone();
        let delta_ingest = ingest_tx.clone();
        let poll_ingest = ingest_tx.clone();
        let source_listeners = vec![
            push.on_snapshot(move |snapshot| {
                let _ = snapshot_ingest.send(Ingest::Update(Update::Snapshot {
                    snapshot: snapshot.clone(),
                    ack: None,
                }));
            }),
            push.on_delta(move |batch| {
                let _ = delta_ingest.send(Ingest::Update(Update::Delta(batch.clone())));
            }),
            polling.on_snapshot(move |snapshot| {
                let _ = poll_ingest.send(Ingest::Update(Update::Snapshot {
                    snapshot: snapshot.clone(),
                    ack: None,
                }));
            }),
        ];

        let refresher = Arc::new(Refresher {
            polling: Arc::clone(&polling),
            ingest: ingest_tx.clone(),
            connectivity: Arc::clone(&deps.connectivity),
            inflight: Mutex::new(None),
            next_id: AtomicU64::new(1),
        });
        let table_listeners = ListenerRegistry::new("table");

        let writer = Writer {
            config: config.clone(),
            view: Arc::clone(&view),
            table,
            table_tx,
            store: Arc::clone(&deps.store),
            connectivity: Arc::clone(&deps.connectivity),
            push_control,
            queue: Arc::clone(&queue),
            sender: Arc::clone(&deps.sender),
            ingest: ingest_tx.clone(),
            deferred: Vec::new(),
            dirty_updates: 0,
            persisted_captured_at,
            reconcile: None,
        };
        let mut tasks = vec![
            tokio::spawn(writer.run(
                ingest_rx,
                deps.connectivity.watch(),
                push.watch_state(),
                cancel.clone(),
                initial_connectivity,
            )),
            tokio::spawn(drive_push(
                Arc::clone(&push),
                push_directives,
                cancel.clone(),
            )),
            tokio::spawn(dispatch_table_updates(
                table_rx,
                table_listeners.clone(),
                config.dispatch_timeout,
                cancel.clone(),
            )),
        ];

        polling.start(config.poll_interval);

        if initial_connectivity != ConnectivityState::Disconnected {
            let grace_cancel = cancel.clone();
            let grace_push = Arc::clone(&push);
            let grace_view = Arc::clone(&view);
            let grace_refresher = Arc::clone(&refresher);
            let grace = config.bootstrap_grace;
            tasks.push(tokio::spawn(async move {
                tokio::select! {
                    _ = grace_cancel.cancelled() => return,
                    _ = tokio::time::sleep(grace) => {}
                }
                let bootstrapping = grace_view.read().phase == SyncPhase::Bootstrapping;
                if bootstrapping && !grace_push.is_connected() {
                    info!("push channel not up within grace window, polling instead");
                    let outcome = grace_refresher.refresh().await;
                    debug!(?outcome, "bootstrap refresh finished");
                }
            }));
        }

        Arc::new(Self {
            config,
            view,
            connectivity: deps.connectivity,
            push,
            polling,
            queue,
            sender: deps.sender,
            refresher,
            table_listeners,
            subscriptions: Mutex::new(BTreeSet::new()),
            ingest: ingest_tx,
            cancel,
            tasks: Mutex::new(tasks),
            source_listeners: Mutex::new(source_listeners),
        })
    }

    pub fn current_table(&self) -> Arc<PriceTable> {
        Arc::clone(&self.view.read().table)
    }

    /// Handlers see the latest committed table; intermediate tables may be skipped
    /// when updates arrive faster than a handler returns.
    pub fn subscribe_to_table<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Arc<PriceTable>) + Send + Sync + 'static,
    {
        self.table_listeners.register(handler)
    }

    pub fn is_stale(&self) -> bool {
        let last_update_ms = self.view.read().last_update_ms;
        match last_update_ms {
            Some(updated) => {
                now_unix_ms().saturating_sub(updated) > self.config.stale_after.as_millis() as i64
            }
            None => true,
        }
    }

    pub fn is_offline(&self) -> bool {
        self.connectivity.current() == ConnectivityState::Disconnected
    }

    pub fn phase(&self) -> SyncPhase {
        self.view.read().phase
    }

    /// Fetches a full snapshot now. A call made while one is in flight shares its result.
    pub async fn request_refresh(&self) -> RefreshOutcome {
        self.refresher.refresh().await
    }

    /// Sends directly when live with nothing queued ahead; otherwise the action is
    /// persisted in the offline queue and replayed on the next reconnect.
    pub async fn enqueue_mutation(&self, action: QueuedAction) -> MutationReceipt {
        let direct = self.connectivity.is_connected()
            && self.phase() == SyncPhase::Live
            && self.queue.is_empty()
            && !self.queue.is_draining();

        if direct {
            match tokio::time::timeout(self.config.send_timeout, self.sender.send(&action)).await {
                Ok(Ok(())) => {
                    debug!(id = %action.id, kind = action.kind.as_str(), "mutation sent");
                    return MutationReceipt::settled(action.id, ActionOutcome::Delivered);
                }
                Ok(Err(error)) => {
                    warn!(id = %action.id, %error, "direct send failed, queueing mutation")
                }
                Err(_) => warn!(id = %action.id, "direct send timed out, queueing mutation"),
            }
        }

        self.queue.enqueue(action).await
    }

    pub fn on_permanent_failure<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&PermanentFailure) + Send + Sync + 'static,
    {
        self.queue.on_permanent_failure(handler)
    }

    pub fn pending_actions(&self) -> Vec<QueuedAction> {
        self.queue.pending()
    }

    pub fn subscribe_codes<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let added: Vec<String> = {
            let mut subscriptions = self.subscriptions.lock();
            codes
                .into_iter()
                .map(Into::into)
                .filter(|code| subscriptions.insert(code.clone()))
                .collect()
        };
        self.push.subscribe(added);
    }

    pub fn unsubscribe_codes<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let removed: Vec<String> = {
            let mut subscriptions = self.subscriptions.lock();
            codes
                .into_iter()
                .map(Into::into)
                .filter(|code| subscriptions.remove(code))
                .collect()
        };
        self.push.unsubscribe(removed);
    }

    pub fn subscribed_codes(&self) -> BTreeSet<String> {
        self.subscriptions.lock().clone()
    }

    /// Empties the table and deletes the persisted snapshot.
    pub async fn reset_cache(&self) -> Result<(), AppError> {
        let (ack, done) = oneshot::channel();
        self.ingest
            .send(Ingest::Reset(ack))
            .map_err(|_| AppError::ChannelClosed)?;
        done.await.map_err(|_| AppError::ChannelClosed)
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        let view = self.view.read().clone();
        let connectivity = self.connectivity.current();
        SyncStatusSnapshot {
            phase: view.phase,
            connectivity,
            push_state: self.push.state(),
            stale: self.is_stale(),
            offline: connectivity == ConnectivityState::Disconnected,
            origin: view.origin,
            codes: view.table.len(),
            last_update_ms: view.last_update_ms,
            captured_at: view.captured_at,
            pending_actions: self.queue.size(),
            reason: view.reason,
        }
    }

    /// Stops every task, flushing unsaved table changes first.
    pub async fn shutdown(&self) {
        self.polling.stop();
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.push.disconnect().await;
        self.source_listeners.lock().clear();
        info!("sync orchestrator stopped");
    }
}

fn poll_gate(
    config: &SyncConfig,
    view: Arc<RwLock<TableView>>,
    connectivity: Arc<ConnectivityMonitor>,
    push: Arc<PushChannel>,
) -> PollGate {
    let min_age_ms = config.poll_min_age.as_millis() as i64;
    let push_fresh_ms = config.push_fresh.as_millis() as i64;

    Arc::new(move || {
        if connectivity.current() == ConnectivityState::Disconnected {
            return false;
        }
        let (last_update_ms, last_push_ms) = {
            let view = view.read();
            (view.last_update_ms, view.last_push_ms)
        };
        let now = now_unix_ms();

        if let Some(updated) = last_update_ms {
            if now.saturating_sub(updated) < min_age_ms {
                return false;
            }
        }
        let push_fresh = last_push_ms
            .map(|pushed| now.saturating_sub(pushed) < push_fresh_ms)
            .unwrap_or(false);
        !(push.is_connected() && push_fresh)
    })
}

/// Applies the latest directive the writer published. Connecting and tearing down
/// a socket happen here so the writer never waits on the network.
async fn drive_push(
    push: Arc<PushChannel>,
    mut directives: watch::Receiver<PushDirective>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = directives.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let directive = *directives.borrow_and_update();
        match directive {
            PushDirective::Hold => {}
            PushDirective::Connect => push.connect().await,
            PushDirective::Disconnect => push.disconnect().await,
        }
    }
}

fn log_delivery(delivery: Result<usize, tokio::task::JoinError>) {
    match delivery {
        Ok(0) => {}
        Ok(panicked) => debug!(panicked, "table subscribers panicked"),
        Err(error) => warn!(%error, "table dispatch task failed"),
    }
}

/// At most one blocking delivery is outstanding. A delivery that overruns the timeout
/// is awaited before the next one starts; the watch keeps only the newest table.
async fn dispatch_table_updates(
    mut updates: watch::Receiver<Arc<PriceTable>>,
    listeners: ListenerRegistry<Arc<PriceTable>>,
    dispatch_timeout: Duration,
    cancel: CancellationToken,
) {
    let mut overrun: Option<JoinHandle<usize>> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        if let Some(previous) = overrun.as_mut() {
            let finished = tokio::select! {
                _ = cancel.cancelled() => break,
                finished = previous => finished,
            };
            overrun = None;
            log_delivery(finished);
        }

        let table = Arc::clone(&updates.borrow_and_update());
        if listeners.is_empty() {
            continue;
        }

        let registry = listeners.clone();
        let mut delivery = tokio::task::spawn_blocking(move || registry.notify(&table));
        match tokio::time::timeout(dispatch_timeout, &mut delivery).await {
            Ok(finished) => log_delivery(finished),
            Err(_) => {
                warn!(
                    timeout_ms = dispatch_timeout.as_millis() as u64,
                    "table subscribers exceeded dispatch timeout"
                );
                overrun = Some(delivery);
            }
        }
    }
}

struct Writer {
    config: SyncConfig,
    view: Arc<RwLock<TableView>>,
    table: PriceTable,
    table_tx: watch::Sender<Arc<PriceTable>>,
    store: Arc<dyn PersistentStore>,
    connectivity: Arc<ConnectivityMonitor>,
    push_control: watch::Sender<PushDirective>,
    queue: Arc<OfflineActionQueue>,
    sender: Arc<dyn ActionSender>,
    ingest: mpsc::UnboundedSender<Ingest>,
    deferred: Vec<Update>,
    dirty_updates: u32,
    persisted_captured_at: Option<i64>,
    reconcile: Option<JoinHandle<()>>,
}

impl Writer {
    async fn run(
        mut self,
        mut ingest: mpsc::UnboundedReceiver<Ingest>,
        mut connectivity: watch::Receiver<ConnectivityState>,
        mut push_state: watch::Receiver<PushChannelState>,
        cancel: CancellationToken,
        initial: ConnectivityState,
    ) {
        match initial {
            ConnectivityState::Connected => self.on_connectivity(initial).await,
            ConnectivityState::ReachabilityUnknown => {
                self.push_control.send_replace(PushDirective::Connect);
            }
            ConnectivityState::Disconnected => {}
        }

        let persist_interval = self.config.persist_interval;
        let mut persist_tick =
            tokio::time::interval_at(Instant::now() + persist_interval, persist_interval);
        persist_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *connectivity.borrow_and_update();
                    self.on_connectivity(state).await;
                }
                changed = push_state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *push_state.borrow_and_update();
                    self.on_push_state(state);
                }
                message = ingest.recv() => {
                    let Some(message) = message else {
                        break;
                    };
                    self.on_ingest(message).await;
                }
                _ = persist_tick.tick() => {
                    if self.dirty_updates > 0 {
                        self.persist().await;
                    }
                }
            }
        }

        if let Some(reconcile) = self.reconcile.take() {
            reconcile.abort();
        }
        if self.dirty_updates > 0 {
            self.persist().await;
        }
    }

    async fn on_connectivity(&mut self, state: ConnectivityState) {
        match state {
            ConnectivityState::Disconnected => {
                if let Some(reconcile) = self.reconcile.take() {
                    reconcile.abort();
                }
                if !self.deferred.is_empty() {
                    debug!(
                        dropped = self.deferred.len(),
                        "discarding updates received before the drain finished"
                    );
                    self.deferred.clear();
                }
                self.set_phase(SyncPhase::Offline, Some("connectivity lost".to_string()));
                self.push_control.send_replace(PushDirective::Disconnect);
                self.maybe_persist().await;
            }
            ConnectivityState::Connected => {
                if self.phase() == SyncPhase::Reconciling {
                    return;
                }
                self.set_phase(SyncPhase::Reconciling, None);
                self.start_reconcile();
                self.push_control.send_replace(PushDirective::Connect);
            }
            ConnectivityState::ReachabilityUnknown => {}
        }
    }

    fn on_push_state(&mut self, state: PushChannelState) {
        match state {
            // An open socket is proof of reachability when nothing else has reported yet.
            PushChannelState::Connected
                if self.connectivity.current() == ConnectivityState::ReachabilityUnknown =>
            {
                self.connectivity.report(ConnectivityState::Connected);
            }
            PushChannelState::Exhausted => {
                warn!("push channel gave up reconnecting, relying on polling");
                self.view.write().reason = Some("push channel unavailable".to_string());
            }
            _ => {}
        }
    }

    async fn on_ingest(&mut self, message: Ingest) {
        match message {
            Ingest::Update(update) => {
                if self.phase() == SyncPhase::Reconciling {
                    self.deferred.push(update);
                    return;
                }
                self.apply(update);
                self.maybe_persist().await;
            }
            Ingest::ReconcileFinished(report) => {
                self.reconcile = None;
                if self.phase() != SyncPhase::Reconciling {
                    return;
                }
                match report {
                    Some(report) => debug!(?report, "reconcile drain finished"),
                    None => warn!(
                        timeout_ms = self.config.drain_timeout.as_millis() as u64,
                        "reconcile drain timed out"
                    ),
                }
                self.apply_deferred();
                self.set_phase(SyncPhase::Live, None);
                self.maybe_persist().await;
            }
            Ingest::Reset(ack) => {
                self.reset().await;
                let _ = ack.send(());
            }
        }
    }

    fn start_reconcile(&mut self) {
        let queue = Arc::clone(&self.queue);
        let sender = Arc::clone(&self.sender);
        let ingest = self.ingest.clone();
        let drain_timeout = self.config.drain_timeout;

        self.reconcile = Some(tokio::spawn(async move {
            let report = tokio::time::timeout(drain_timeout, queue.drain(sender.as_ref()))
                .await
                .ok();
            let _ = ingest.send(Ingest::ReconcileFinished(report));
        }));
    }

    fn apply_deferred(&mut self) {
        for update in std::mem::take(&mut self.deferred) {
            self.apply(update);
        }
    }

    fn apply(&mut self, update: Update) {
        match update {
            Update::Snapshot { snapshot, ack } => {
                let origin = snapshot.origin;
                let captured_at = snapshot.captured_at;
                let report = merge_snapshot(&mut self.table, snapshot);
                self.commit(report, origin, captured_at);
                if let Some(ack) = ack {
                    let _ = ack.send(report);
                }
            }
            Update::Delta(batch) => {
                let report = merge_deltas(&mut self.table, &batch);
                self.commit(report, SnapshotOrigin::Push, batch.timestamp);
            }
        }
    }

    fn commit(&mut self, report: MergeReport, origin: SnapshotOrigin, captured_at: i64) {
        let now = now_unix_ms();
        let mut view = self.view.write();

        view.captured_at = Some(view.captured_at.map_or(captured_at, |held| held.max(captured_at)));
        if view.phase == SyncPhase::Bootstrapping {
            info!(?origin, "first live data received");
            view.phase = SyncPhase::Live;
            view.reason = None;
        }
        if report.stale > 0 || report.ignored > 0 {
            debug!(
                stale = report.stale,
                ignored = report.ignored,
                "skipped outdated or incomplete price updates"
            );
        }
        if !report.changed() {
            return;
        }

        view.origin = Some(origin);
        view.last_update_ms = Some(now);
        if origin == SnapshotOrigin::Push {
            view.last_push_ms = Some(now);
        }
        let table = Arc::new(self.table.clone());
        view.table = Arc::clone(&table);
        drop(view);

        self.table_tx.send_replace(table);
        self.dirty_updates = self.dirty_updates.saturating_add(1);
    }

    async fn maybe_persist(&mut self) {
        if self.dirty_updates >= self.config.persist_every_updates {
            self.persist().await;
        }
    }

    async fn persist(&mut self) {
        let (captured_at, origin) = {
            let view = self.view.read();
            (
                view.captured_at.unwrap_or_default(),
                view.origin.unwrap_or(SnapshotOrigin::Cache),
            )
        };
        if self
            .persisted_captured_at
            .map(|persisted| captured_at < persisted)
            .unwrap_or(false)
        {
            debug!(captured_at, "skipping snapshot write older than the persisted one");
            self.dirty_updates = 0;
            return;
        }

        let snapshot = Snapshot {
            records: self.table.clone(),
            captured_at,
            origin,
        };
        match save_snapshot(self.store.as_ref(), &snapshot).await {
            Ok(()) => {
                debug!(codes = snapshot.records.len(), captured_at, "price snapshot persisted");
                self.persisted_captured_at = Some(captured_at);
                self.dirty_updates = 0;
            }
            Err(error) => warn!(%error, "failed to persist price snapshot, continuing in memory"),
        }
    }

    async fn reset(&mut self) {
        self.table.clear();
        self.deferred.clear();
        self.dirty_updates = 0;
        self.persisted_captured_at = None;

        let table = Arc::new(PriceTable::new());
        {
            let mut view = self.view.write();
            view.table = Arc::clone(&table);
            view.captured_at = None;
            view.origin = None;
            view.last_update_ms = None;
            view.last_push_ms = None;
        }
        self.table_tx.send_replace(table);

        if let Err(error) = reset_snapshot(self.store.as_ref()).await {
            warn!(%error, "failed to delete persisted price snapshot");
        }
        info!("price cache reset");
    }

    fn phase(&self) -> SyncPhase {
        self.view.read().phase
    }

    fn set_phase(&self, phase: SyncPhase, reason: Option<String>) {
        let mut view = self.view.write();
        if view.phase != phase {
            info!(from = ?view.phase, to = ?phase, "sync phase transition");
        }
        view.phase = phase;
        view.reason = reason;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::polling::testing::ScriptedSource;
    use crate::sync::push::testing::ScriptedConnector;
    use crate::sync::queue::testing::RecordingSender;
    use crate::sync::store::MemoryStore;
    use crate::sync::types::{ActionKind, CurrencyKind, PriceRecord};
    use serde_json::json;

    struct Harness {
        connector: Arc<ScriptedConnector>,
        source: Arc<ScriptedSource>,
        sender: Arc<RecordingSender>,
        store: Arc<MemoryStore>,
        connectivity: Arc<ConnectivityMonitor>,
    }

    impl Harness {
        fn new(initial: ConnectivityState) -> Self {
            Self {
                connector: Arc::new(ScriptedConnector::default()),
                source: Arc::new(ScriptedSource::new(Duration::ZERO)),
                sender: Arc::new(RecordingSender::default()),
                store: Arc::new(MemoryStore::new()),
                connectivity: Arc::new(ConnectivityMonitor::new(initial)),
            }
        }

        async fn start(&self, config: SyncConfig) -> Arc<SyncOrchestrator> {
            SyncOrchestrator::start(
                config,
                SyncDependencies {
                    connector: self.connector.clone(),
                    source: self.source.clone(),
                    sender: self.sender.clone(),
                    store: self.store.clone(),
                    connectivity: Arc::clone(&self.connectivity),
                },
            )
            .await
        }
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            backoff_initial: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            max_reconnect_attempts: 2,
            connect_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_secs(3600),
            poll_retries: 1,
            poll_retry_delay: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(500),
            drain_timeout: Duration::from_secs(2),
            send_timeout: Duration::from_millis(500),
            bootstrap_grace: Duration::from_secs(3600),
            persist_every_updates: 1000,
            persist_interval: Duration::from_secs(3600),
            dispatch_timeout: Duration::from_millis(500),
            ..SyncConfig::default()
        }
    }

    fn record(code: &str, buy: f64, sell: f64, updated_at: i64) -> PriceRecord {
        PriceRecord {
            code: code.to_string(),
            display_name: code.to_string(),
            buy,
            sell,
            change_absolute: 0.0,
            change_percent: 0.0,
            currency: CurrencyKind::Foreign,
            updated_at,
        }
    }

    fn snapshot_frame(code: &str, updated_at: i64) -> String {
        format!(
            r#"{{"event":"prices:snapshot","success":true,"timestamp":{updated_at},"data":[{{"code":"{code}","buy":1,"sell":2,"updatedAt":{updated_at}}}]}}"#
        )
    }

    async fn eventually<F: Fn() -> bool>(what: &str, condition: F) {
        let reached = tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "timed out waiting for {what}");
    }

    #[tokio::test]
    async fn serves_cached_snapshot_while_offline() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        let cached = Snapshot::from_records(
            vec![record("XAUUSD", 2000.0, 2001.0, 10)],
            now_unix_ms() - 600_000,
            SnapshotOrigin::Push,
        );
        save_snapshot(harness.store.as_ref(), &cached)
            .await
            .expect("cache should persist");

        let orchestrator = harness.start(test_config()).await;

        assert_eq!(orchestrator.current_table().as_ref(), &cached.records);
        assert!(orchestrator.is_offline());
        assert!(orchestrator.is_stale());
        let status = orchestrator.status();
        assert_eq!(status.phase, SyncPhase::Offline);
        assert_eq!(status.origin, Some(SnapshotOrigin::Cache));
        assert_eq!(harness.connector.open_count(), 0);
        assert_eq!(
            orchestrator.request_refresh().await,
            RefreshOutcome::Offline
        );

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn push_snapshot_reaches_table_and_subscribers() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = orchestrator.subscribe_to_table(move |table| {
            let _ = tx.send(table.len());
        });

        server.push_text(&snapshot_frame("XAUUSD", 10));

        let seen = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("subscriber should be notified")
            .expect("subscriber channel open");
        assert_eq!(seen, 1);
        assert!(orchestrator.current_table().contains_key("XAUUSD"));
        eventually("live phase", || orchestrator.phase() == SyncPhase::Live).await;
        assert!(!orchestrator.is_stale());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn polls_when_push_misses_bootstrap_grace() {
        let harness = Harness::new(ConnectivityState::ReachabilityUnknown);
        harness.source.set_fallback(Snapshot::from_records(
            vec![record("XAGUSD", 24.0, 24.5, 5)],
            5,
            SnapshotOrigin::Poll,
        ));
        let config = SyncConfig {
            bootstrap_grace: Duration::from_millis(20),
            ..test_config()
        };

        let orchestrator = harness.start(config).await;

        eventually("poll data", || orchestrator.current_table().contains_key("XAGUSD")).await;
        assert_eq!(orchestrator.status().origin, Some(SnapshotOrigin::Poll));
        assert_eq!(orchestrator.phase(), SyncPhase::Live);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_refreshes_share_one_fetch() {
        let harness = Harness {
            source: Arc::new(ScriptedSource::new(Duration::from_millis(50))),
            ..Harness::new(ConnectivityState::ReachabilityUnknown)
        };
        harness.source.set_fallback(Snapshot::from_records(
            vec![record("XAUUSD", 1.0, 2.0, 3)],
            3,
            SnapshotOrigin::Poll,
        ));
        let orchestrator = harness.start(test_config()).await;

        let (first, second) = tokio::join!(
            orchestrator.request_refresh(),
            orchestrator.request_refresh()
        );

        assert_eq!(harness.source.calls(), 1);
        assert_eq!(first, second);
        assert!(matches!(first, RefreshOutcome::Applied(report) if report.applied == 1));

        orchestrator.request_refresh().await;
        assert_eq!(harness.source.calls(), 2);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn failed_refresh_keeps_held_data() {
        let harness = Harness::new(ConnectivityState::ReachabilityUnknown);
        let cached = Snapshot::from_records(vec![record("XAUUSD", 1.0, 2.0, 3)], 3, SnapshotOrigin::Poll);
        save_snapshot(harness.store.as_ref(), &cached)
            .await
            .expect("cache should persist");
        let orchestrator = harness.start(test_config()).await;

        let outcome = orchestrator.request_refresh().await;

        assert!(matches!(outcome, RefreshOutcome::Failed(_)));
        assert_eq!(orchestrator.current_table().as_ref(), &cached.records);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn offline_mutations_are_queued_and_drained_on_reconnect() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        let orchestrator = harness.start(test_config()).await;

        let receipt = orchestrator
            .enqueue_mutation(QueuedAction::new(
                ActionKind::CreateAlert,
                json!({ "code": "XAUUSD", "target": 2100 }),
            ))
            .await;
        assert_eq!(orchestrator.pending_actions().len(), 1);
        assert!(harness.sender.sent().is_empty());

        harness.connectivity.report(ConnectivityState::Connected);

        let outcome = tokio::time::timeout(Duration::from_secs(5), receipt.outcome())
            .await
            .expect("drain should finish")
            .expect("receipt should resolve");
        assert_eq!(outcome, ActionOutcome::Delivered);
        assert!(orchestrator.pending_actions().is_empty());
        eventually("live phase", || orchestrator.phase() == SyncPhase::Live).await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn live_mutation_is_sent_directly() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;
        server.push_text(&snapshot_frame("XAUUSD", 10));
        eventually("live phase", || orchestrator.phase() == SyncPhase::Live).await;

        let action = QueuedAction::new(ActionKind::DeleteHolding, json!({ "id": "h-1" }));
        let action_id = action.id.clone();
        let receipt = orchestrator.enqueue_mutation(action).await;

        assert_eq!(
            receipt.outcome().await.expect("receipt should resolve"),
            ActionOutcome::Delivered
        );
        assert_eq!(harness.sender.sent(), vec![action_id]);
        assert!(orchestrator.pending_actions().is_empty());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn push_data_waits_for_reconcile_drain() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        harness.sender.set_delay(Duration::from_millis(300));
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;
        let _receipt = orchestrator
            .enqueue_mutation(QueuedAction::new(
                ActionKind::AddHolding,
                json!({ "code": "XAUUSD", "qty": 1 }),
            ))
            .await;

        harness.connectivity.report(ConnectivityState::Connected);
        eventually("reconciling phase", || {
            orchestrator.phase() == SyncPhase::Reconciling
        })
        .await;
        server.push_text(&snapshot_frame("XAUUSD", 10));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(orchestrator.phase(), SyncPhase::Reconciling);
        assert!(orchestrator.current_table().is_empty());

        eventually("live phase", || orchestrator.phase() == SyncPhase::Live).await;
        assert!(orchestrator.current_table().contains_key("XAUUSD"));

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn connectivity_loss_mid_drain_discards_deferred_data() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        harness.sender.set_delay(Duration::from_millis(300));
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;
        let _receipt = orchestrator
            .enqueue_mutation(QueuedAction::new(
                ActionKind::CreateAlert,
                json!({ "code": "XAUUSD", "target": 2100 }),
            ))
            .await;

        harness.connectivity.report(ConnectivityState::Connected);
        eventually("reconciling phase", || {
            orchestrator.phase() == SyncPhase::Reconciling
        })
        .await;
        server.push_text(&snapshot_frame("XAUUSD", 10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.current_table().is_empty());

        harness.connectivity.report(ConnectivityState::Disconnected);
        eventually("offline phase", || orchestrator.phase() == SyncPhase::Offline).await;
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(orchestrator.phase(), SyncPhase::Offline);
        assert!(orchestrator.current_table().is_empty());
        assert_eq!(orchestrator.pending_actions().len(), 1);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn reconcile_gives_up_on_drain_after_timeout() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        harness.sender.set_delay(Duration::from_secs(3600));
        let server = harness.connector.accept_next();
        let config = SyncConfig {
            drain_timeout: Duration::from_millis(100),
            ..test_config()
        };
        let orchestrator = harness.start(config).await;
        let _receipt = orchestrator
            .enqueue_mutation(QueuedAction::new(
                ActionKind::AddHolding,
                json!({ "code": "XAGUSD", "qty": 2 }),
            ))
            .await;

        let reconnected_at = Instant::now();
        harness.connectivity.report(ConnectivityState::Connected);
        server.push_text(&snapshot_frame("XAUUSD", 10));

        eventually("live phase", || orchestrator.phase() == SyncPhase::Live).await;
        assert!(reconnected_at.elapsed() >= Duration::from_millis(100));
        eventually("deferred push data", || {
            orchestrator.current_table().contains_key("XAUUSD")
        })
        .await;
        assert_eq!(orchestrator.pending_actions().len(), 1);
        eventually("drain guard released", || !orchestrator.queue.is_draining()).await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn persists_on_interval_below_update_threshold() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let config = SyncConfig {
            persist_interval: Duration::from_millis(50),
            ..test_config()
        };
        let orchestrator = harness.start(config).await;

        server.push_text(&snapshot_frame("XAUUSD", 10));

        eventually("interval persist", || {
            futures_util::FutureExt::now_or_never(load_snapshot(harness.store.as_ref()))
                .and_then(Result::ok)
                .flatten()
                .map(|snapshot| snapshot.records.contains_key("XAUUSD"))
                .unwrap_or(false)
        })
        .await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn polling_takes_over_when_push_is_exhausted() {
        let harness = Harness::new(ConnectivityState::Connected);
        harness.source.set_fallback(Snapshot::from_records(
            vec![record("XAGUSD", 24.0, 24.5, 5)],
            5,
            SnapshotOrigin::Poll,
        ));
        let config = SyncConfig {
            poll_interval: Duration::from_millis(30),
            poll_min_age: Duration::ZERO,
            ..test_config()
        };

        let orchestrator = harness.start(config).await;

        eventually("push exhausted", || {
            orchestrator.status().push_state == PushChannelState::Exhausted
        })
        .await;
        eventually("poll data", || orchestrator.current_table().contains_key("XAGUSD")).await;
        assert_eq!(orchestrator.status().origin, Some(SnapshotOrigin::Poll));
        assert_eq!(orchestrator.phase(), SyncPhase::Live);
        assert!(!orchestrator.is_stale());

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn outdated_refresh_does_not_count_as_fresh_data() {
        let harness = Harness::new(ConnectivityState::Connected);
        harness.source.push(Ok(Snapshot::from_records(
            vec![record("XAUUSD", 1.0, 2.0, 100)],
            100,
            SnapshotOrigin::Poll,
        )));
        harness.source.push(Ok(Snapshot::from_records(
            vec![record("XAUUSD", 0.5, 1.5, 50)],
            50,
            SnapshotOrigin::Poll,
        )));
        let orchestrator = harness.start(test_config()).await;

        let first = orchestrator.request_refresh().await;
        assert!(matches!(first, RefreshOutcome::Applied(report) if report.applied == 1));
        let refreshed_at = orchestrator.status().last_update_ms;
        assert!(refreshed_at.is_some());
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = orchestrator.request_refresh().await;

        assert!(matches!(second, RefreshOutcome::Applied(report) if report.stale == 1 && !report.changed()));
        assert_eq!(orchestrator.status().last_update_ms, refreshed_at);
        assert_eq!(
            orchestrator.current_table().get("XAUUSD").map(|record| record.buy),
            Some(1.0)
        );

        orchestrator.shutdown().await;
    }

    #[test]
    fn blocking_subscriber_holds_at_most_one_blocking_thread() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .max_blocking_threads(2)
            .enable_all()
            .build()
            .expect("runtime should build");
        let (release, parked) = std::sync::mpsc::channel::<()>();
        let parked = std::sync::Mutex::new(parked);

        runtime.block_on(async move {
            let harness = Harness::new(ConnectivityState::Connected);
            let server = harness.connector.accept_next();
            let config = SyncConfig {
                dispatch_timeout: Duration::from_millis(30),
                ..test_config()
            };
            let orchestrator = harness.start(config).await;
            let _blocked = orchestrator.subscribe_to_table(move |_| {
                if let Ok(parked) = parked.lock() {
                    let _ = parked.recv_timeout(Duration::from_secs(30));
                }
            });

            let codes = ["XAUUSD", "XAGUSD", "XPTUSD", "XPDUSD", "EURUSD", "GBPUSD"];
            for (index, code) in codes.iter().enumerate() {
                server.push_text(&snapshot_frame(code, 10 + index as i64));
                tokio::time::sleep(Duration::from_millis(80)).await;
            }

            eventually("every snapshot ingested", || {
                orchestrator.current_table().len() == codes.len()
            })
            .await;
            let unrelated =
                tokio::time::timeout(Duration::from_secs(2), tokio::task::spawn_blocking(|| 1))
                    .await;
            assert!(matches!(unrelated, Ok(Ok(1))));

            drop(release);
            orchestrator.shutdown().await;
        });
    }

    #[tokio::test]
    async fn connectivity_loss_moves_to_offline_and_keeps_table() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;
        server.push_text(&snapshot_frame("XAUUSD", 10));
        eventually("live data", || {
            orchestrator.current_table().contains_key("XAUUSD")
        })
        .await;

        harness.connectivity.report(ConnectivityState::Disconnected);

        eventually("offline phase", || orchestrator.phase() == SyncPhase::Offline).await;
        assert!(orchestrator.is_offline());
        assert!(orchestrator.current_table().contains_key("XAUUSD"));
        eventually("push stopped", || {
            orchestrator.status().push_state == PushChannelState::Stopped
        })
        .await;

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn persists_after_update_threshold_without_regressing_captured_at() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let config = SyncConfig {
            persist_every_updates: 2,
            ..test_config()
        };
        let orchestrator = harness.start(config).await;

        server.push_text(&snapshot_frame("XAUUSD", 100));
        server.push_text(
            r#"{"event":"price:change","success":true,"timestamp":150,"data":{"code":"XAUUSD","sell":5,"updatedAt":150}}"#,
        );
        eventually("first persisted snapshot", || {
            futures_util::FutureExt::now_or_never(load_snapshot(harness.store.as_ref()))
                .and_then(Result::ok)
                .flatten()
                .is_some()
        })
        .await;
        let persisted = load_snapshot(harness.store.as_ref())
            .await
            .expect("snapshot should load")
            .expect("snapshot should exist");
        assert_eq!(persisted.captured_at, 150);
        assert_eq!(persisted.records["XAUUSD"].sell, 5.0);

        server.push_text(&snapshot_frame("XAGUSD", 50));
        server.push_text(&snapshot_frame("XPTUSD", 60));
        eventually("second persisted snapshot", || {
            futures_util::FutureExt::now_or_never(load_snapshot(harness.store.as_ref()))
                .and_then(Result::ok)
                .flatten()
                .map(|snapshot| snapshot.records.len() == 3)
                .unwrap_or(false)
        })
        .await;
        let persisted = load_snapshot(harness.store.as_ref())
            .await
            .expect("snapshot should load")
            .expect("snapshot should exist");
        assert_eq!(persisted.captured_at, 150);

        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_flushes_pending_snapshot() {
        let harness = Harness::new(ConnectivityState::Connected);
        let server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;

        server.push_text(&snapshot_frame("XAUUSD", 10));
        eventually("live data", || {
            orchestrator.current_table().contains_key("XAUUSD")
        })
        .await;
        assert_eq!(
            load_snapshot(harness.store.as_ref())
                .await
                .expect("load should succeed"),
            None
        );

        orchestrator.shutdown().await;

        let persisted = load_snapshot(harness.store.as_ref())
            .await
            .expect("load should succeed")
            .expect("shutdown should flush");
        assert!(persisted.records.contains_key("XAUUSD"));
    }

    #[tokio::test]
    async fn reset_cache_clears_table_and_store() {
        let harness = Harness::new(ConnectivityState::Disconnected);
        save_snapshot(
            harness.store.as_ref(),
            &Snapshot::from_records(vec![record("XAUUSD", 1.0, 2.0, 3)], 3, SnapshotOrigin::Push),
        )
        .await
        .expect("cache should persist");
        let orchestrator = harness.start(test_config()).await;

        orchestrator.reset_cache().await.expect("reset should succeed");

        assert!(orchestrator.current_table().is_empty());
        assert_eq!(
            load_snapshot(harness.store.as_ref())
                .await
                .expect("load should succeed"),
            None
        );
        orchestrator.shutdown().await;
    }

    #[tokio::test]
    async fn subscription_set_is_mirrored_into_push_channel() {
        let harness = Harness::new(ConnectivityState::Connected);
        let mut server = harness.connector.accept_next();
        let orchestrator = harness.start(test_config()).await;
        orchestrator.subscribe_codes(["XAUUSD", "XAGUSD"]);

        eventually("push connected", || {
            orchestrator.status().push_state == PushChannelState::Connected
        })
        .await;
        let first = server.next_sent().await;
        assert!(first.contains("XAGUSD") && first.contains("XAUUSD"));

        orchestrator.unsubscribe_codes(["XAGUSD"]);
        assert_eq!(
            orchestrator.subscribed_codes(),
            BTreeSet::from(["XAUUSD".to_string()])
        );
        assert_eq!(
            server.next_sent().await,
            r#"{"event":"unsubscribe","codes":["XAGUSD"]}"#
        );

        orchestrator.shutdown().await;
    }
}
