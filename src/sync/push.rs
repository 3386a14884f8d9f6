use crate::error::AppError;
use crate::sync::config::SyncConfig;
use crate::sync::observer::{ListenerRegistry, Subscription};
use crate::sync::types::{
    parse_push_message, ClientMessage, DeltaBatch, PushChannelState, PushMessage, Snapshot,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl PushFrame {
    fn into_bytes(self) -> Vec<u8> {
        match self {
            Self::Text(text) => text.into_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// One open bidirectional connection.
#[async_trait]
pub trait PushConnection: Send {
    async fn send_text(&mut self, text: String) -> Result<(), AppError>;
    /// `None` once the remote side has closed the connection.
    async fn next_frame(&mut self) -> Option<Result<PushFrame, AppError>>;
    async fn close(&mut self);
}

#[async_trait]
pub trait PushConnector: Send + Sync + 'static {
    async fn open(&self) -> Result<Box<dyn PushConnection>, AppError>;
}

#[derive(Debug)]
enum ChannelCommand {
    Send(ClientMessage),
}

struct Session {
    cancel: CancellationToken,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    run_handle: JoinHandle<()>,
    dispatch_handle: JoinHandle<()>,
}

impl Session {
    fn is_active(&self) -> bool {
        !self.run_handle.is_finished()
    }
}

#[derive(Debug, Clone)]
struct BackoffPolicy {
    initial: Duration,
    max: Duration,
    max_attempts: u32,
    connect_timeout: Duration,
    protocol_error_threshold: u32,
}

impl From<&SyncConfig> for BackoffPolicy {
    fn from(config: &SyncConfig) -> Self {
        Self {
            initial: config.backoff_initial,
            max: config.backoff_max,
            max_attempts: config.max_reconnect_attempts,
            connect_timeout: config.connect_timeout,
            protocol_error_threshold: config.protocol_error_threshold,
        }
    }
}

/// Long-lived push connection with subscription replay and bounded reconnection.
///
/// Each [`PushChannel::connect`] call that finds no live session starts a new
/// episode. Within an episode, failed attempts back off exponentially and the
/// attempt counter only resets once a connection is actually open.
pub struct PushChannel {
    connector: Arc<dyn PushConnector>,
    policy: BackoffPolicy,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    snapshot_listeners: ListenerRegistry<Snapshot>,
    delta_listeners: ListenerRegistry<DeltaBatch>,
    state: Arc<watch::Sender<PushChannelState>>,
    session: tokio::sync::Mutex<Option<Session>>,
    command_slot: Mutex<Option<mpsc::UnboundedSender<ChannelCommand>>>,
}

impl PushChannel {
    pub fn new(connector: Arc<dyn PushConnector>, config: &SyncConfig) -> Self {
        let (state, _) = watch::channel(PushChannelState::Idle);
        Self {
            connector,
            policy: BackoffPolicy::from(config),
            subscriptions: Arc::new(Mutex::new(BTreeSet::new())),
            snapshot_listeners: ListenerRegistry::new("push.snapshot"),
            delta_listeners: ListenerRegistry::new("push.delta"),
            state: Arc::new(state),
            session: tokio::sync::Mutex::new(None),
            command_slot: Mutex::new(None),
        }
    }

    pub async fn connect(&self) {
        let mut slot = self.session.lock().await;
        let running = slot.as_ref().map(Session::is_active).unwrap_or(false);
        let settled = matches!(
            self.state(),
            PushChannelState::Exhausted | PushChannelState::Stopped
        );
        if running && !settled {
            debug!("push channel already running, connect ignored");
            return;
        }
        if let Some(previous) = slot.take() {
            shutdown_session(previous).await;
        }

        let cancel = CancellationToken::new();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let dispatch_handle = tokio::spawn(dispatch_events(
            event_rx,
            self.snapshot_listeners.clone(),
            self.delta_listeners.clone(),
        ));

        let context = SessionContext {
            connector: Arc::clone(&self.connector),
            policy: self.policy.clone(),
            subscriptions: Arc::clone(&self.subscriptions),
            state: Arc::clone(&self.state),
            events: event_tx,
            commands: command_rx,
            cancel: cancel.clone(),
        };
        let run_handle = tokio::spawn(run_session(context));

        *self.command_slot.lock() = Some(command_tx.clone());
        *slot = Some(Session {
            cancel,
            commands: command_tx,
            run_handle,
            dispatch_handle,
        });
    }

    pub async fn disconnect(&self) {
        let previous = self.session.lock().await.take();
        self.command_slot.lock().take();
        if let Some(session) = previous {
            shutdown_session(session).await;
            info!("push channel disconnected");
        }
        self.state.send_replace(PushChannelState::Stopped);
    }

    /// Adds codes to the subscription set; only codes not yet tracked go on the wire.
    pub fn subscribe<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added: Vec<String> = {
            let mut subscriptions = self.subscriptions.lock();
            codes
                .into_iter()
                .map(Into::into)
                .filter(|code| subscriptions.insert(code.clone()))
                .collect()
        };
        added.sort();
        if !added.is_empty() {
            self.send_command(ChannelCommand::Send(ClientMessage::Subscribe(added)));
        }
    }

    pub fn unsubscribe<I, S>(&self, codes: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut removed: Vec<String> = {
            let mut subscriptions = self.subscriptions.lock();
            codes
                .into_iter()
                .map(Into::into)
                .filter(|code| subscriptions.remove(code))
                .collect()
        };
        removed.sort();
        if !removed.is_empty() {
            self.send_command(ChannelCommand::Send(ClientMessage::Unsubscribe(removed)));
        }
    }

    pub fn on_snapshot<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Snapshot) + Send + Sync + 'static,
    {
        self.snapshot_listeners.register(handler)
    }

    pub fn on_delta<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&DeltaBatch) + Send + Sync + 'static,
    {
        self.delta_listeners.register(handler)
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PushChannelState::Connected
    }

    pub fn state(&self) -> PushChannelState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<PushChannelState> {
        self.state.subscribe()
    }

    fn send_command(&self, command: ChannelCommand) {
        if let Some(sender) = self.command_slot.lock().as_ref() {
            // Closed only when the session ended; the set is replayed on the next connect.
            let _ = sender.send(command);
        }
    }
}

async fn shutdown_session(session: Session) {
    session.cancel.cancel();
    drop(session.commands);
    let _ = session.run_handle.await;
    let _ = session.dispatch_handle.await;
}

struct SessionContext {
    connector: Arc<dyn PushConnector>,
    policy: BackoffPolicy,
    subscriptions: Arc<Mutex<BTreeSet<String>>>,
    state: Arc<watch::Sender<PushChannelState>>,
    events: mpsc::UnboundedSender<PushMessage>,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    cancel: CancellationToken,
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    Lost(String),
    ProtocolErrors(u32),
}

async fn run_session(mut context: SessionContext) {
    let mut attempt = 0_u32;

    while !context.cancel.is_cancelled() {
        context.state.send_replace(if attempt == 0 {
            PushChannelState::Connecting
        } else {
            PushChannelState::Reconnecting
        });

        let opened = tokio::select! {
            _ = context.cancel.cancelled() => break,
            opened = tokio::time::timeout(context.policy.connect_timeout, context.connector.open()) => opened,
        };

        match opened {
            Ok(Ok(mut connection)) => {
                attempt = 0;
                context.state.send_replace(PushChannelState::Connected);
                info!("push channel connected");

                let end = match resubscribe(&mut context, connection.as_mut()).await {
                    Ok(()) => pump_connection(&mut context, connection.as_mut()).await,
                    Err(error) => SessionEnd::Lost(format!("resubscribe failed: {error}")),
                };
                if tokio::time::timeout(context.policy.connect_timeout, connection.close())
                    .await
                    .is_err()
                {
                    debug!("push connection close timed out, dropping socket");
                }

                match end {
                    SessionEnd::Cancelled => break,
                    SessionEnd::Lost(reason) => warn!(%reason, "push connection lost"),
                    SessionEnd::ProtocolErrors(count) => {
                        warn!(count, "push connection dropped after repeated protocol errors")
                    }
                }
            }
            Ok(Err(error)) => warn!(%error, attempt, "push connect failed"),
            Err(_) => warn!(
                timeout_ms = context.policy.connect_timeout.as_millis() as u64,
                attempt,
                "push connect timed out"
            ),
        }

        attempt = attempt.saturating_add(1);
        if attempt >= context.policy.max_attempts {
            warn!(attempt, "push reconnect attempts exhausted for this episode");
            context.state.send_replace(PushChannelState::Exhausted);
            return;
        }

        context.state.send_replace(PushChannelState::Reconnecting);
        let delay = reconnect_delay(attempt, context.policy.initial, context.policy.max);
        debug!(attempt, delay_ms = delay.as_millis() as u64, "push reconnect scheduled");
        tokio::select! {
            _ = context.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Replays the whole subscription set once per open connection.
async fn resubscribe(
    context: &mut SessionContext,
    connection: &mut dyn PushConnection,
) -> Result<(), AppError> {
    // Queued incremental commands are covered by the full replay.
    while context.commands.try_recv().is_ok() {}

    let codes: Vec<String> = context.subscriptions.lock().iter().cloned().collect();
    if codes.is_empty() {
        return Ok(());
    }
    let payload = ClientMessage::Subscribe(codes).encode()?;
    connection.send_text(payload).await
}

async fn pump_connection(
    context: &mut SessionContext,
    connection: &mut dyn PushConnection,
) -> SessionEnd {
    let mut protocol_errors = 0_u32;

    loop {
        tokio::select! {
            _ = context.cancel.cancelled() => return SessionEnd::Cancelled,
            command = context.commands.recv() => {
                let Some(ChannelCommand::Send(message)) = command else {
                    return SessionEnd::Cancelled;
                };
                let sent = match message.encode() {
                    Ok(payload) => connection.send_text(payload).await,
                    Err(error) => Err(error),
                };
                if let Err(error) = sent {
                    return SessionEnd::Lost(format!("send failed: {error}"));
                }
            }
            frame = connection.next_frame() => {
                let frame = match frame {
                    None => return SessionEnd::Lost("closed by server".to_string()),
                    Some(Err(error)) => return SessionEnd::Lost(error.to_string()),
                    Some(Ok(frame)) => frame,
                };

                let mut payload = frame.into_bytes();
                match parse_push_message(payload.as_mut_slice()) {
                    Ok(PushMessage::ServerError(message)) => {
                        warn!(%message, "push channel reported an error");
                        protocol_errors += 1;
                    }
                    Ok(message) => {
                        protocol_errors = 0;
                        if context.events.send(message).is_err() {
                            return SessionEnd::Cancelled;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "dropping malformed push message");
                        protocol_errors += 1;
                    }
                }

                if protocol_errors >= context.policy.protocol_error_threshold {
                    return SessionEnd::ProtocolErrors(protocol_errors);
                }
            }
        }
    }
}

/// Listener fan-out runs here so slow handlers never hold up socket reads.
async fn dispatch_events(
    mut events: mpsc::UnboundedReceiver<PushMessage>,
    snapshot_listeners: ListenerRegistry<Snapshot>,
    delta_listeners: ListenerRegistry<DeltaBatch>,
) {
    while let Some(message) = events.recv().await {
        match message {
            PushMessage::Snapshot(snapshot) => {
                snapshot_listeners.notify(&snapshot);
            }
            PushMessage::Delta(batch) => {
                delta_listeners.notify(&batch);
            }
            PushMessage::ServerError(_) => {}
        }
    }
}

fn reconnect_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let scaled = initial.saturating_mul(1_u32 << exponent);
    scaled.min(max)
}
