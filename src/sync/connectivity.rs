use crate::sync::types::ConnectivityState;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Current reachability plus a watch channel of transitions.
#[derive(Debug)]
pub struct ConnectivityMonitor {
    sender: watch::Sender<ConnectivityState>,
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(ConnectivityState::ReachabilityUnknown)
    }
}

impl ConnectivityMonitor {
    pub fn new(initial: ConnectivityState) -> Self {
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn current(&self) -> ConnectivityState {
        *self.sender.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.current() == ConnectivityState::Connected
    }

    /// Records a reachability observation. Returns `true` when it was a transition.
    pub fn report(&self, state: ConnectivityState) -> bool {
        self.sender.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            info!(from = ?*current, to = ?state, "connectivity transition");
            *current = state;
            true
        })
    }

    pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
        self.sender.subscribe()
    }

    /// Polls `url` every `interval`; any successful response means connected.
    pub fn spawn_probe(
        self: &Arc<Self>,
        client: Client,
        url: String,
        interval: Duration,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reachable = match client.get(&url).timeout(timeout).send().await {
                            Ok(response) => response.error_for_status().is_ok(),
                            Err(error) => {
                                debug!(%url, %error, "reachability probe failed");
                                false
                            }
                        };
                        monitor.report(if reachable {
                            ConnectivityState::Connected
                        } else {
                            ConnectivityState::Disconnected
                        });
                    }
                }
            }
        })
    }
}
