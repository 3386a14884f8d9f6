use price_sync::db::initialize_pool;
use price_sync::health::health;
use price_sync::state::AppState;
use price_sync::sync::connectivity::ConnectivityMonitor;
use price_sync::sync::transport::{HttpActionSender, HttpSnapshotSource, WebSocketConnector};
use price_sync::{AppError, SyncConfigArgs, SyncDependencies, SyncOrchestrator};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PROBE_INTERVAL: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

fn required_env(key: &str) -> Result<String, AppError> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::InvalidArgument(format!("{key} must be set")))
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[tokio::main]
async fn main() {
    price_sync::init_tracing();

    if let Err(error) = run().await {
        error!(%error, "price-sync exited with an error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AppError> {
    let config = SyncConfigArgs::from_env().normalize()?;
    let ws_url = required_env("PRICE_SYNC_WS_URL")?;
    let api_url = required_env("PRICE_SYNC_API_URL")?;
    let health_url = optional_env("PRICE_SYNC_HEALTH_URL")
        .unwrap_or_else(|| format!("{}/health", api_url.trim_end_matches('/')));

    let db_pool = initialize_pool().await?;
    let http_client = Client::builder().timeout(config.poll_timeout).build()?;

    let connectivity = Arc::new(ConnectivityMonitor::default());
    let probe_cancel = CancellationToken::new();
    let probe_handle = connectivity.spawn_probe(
        http_client.clone(),
        health_url,
        PROBE_INTERVAL,
        config.connect_timeout,
        probe_cancel.clone(),
    );

    let sender = HttpActionSender::new(http_client.clone(), &api_url)
        .with_bearer_token(optional_env("PRICE_SYNC_API_TOKEN"));
    let orchestrator = SyncOrchestrator::start(
        config,
        SyncDependencies {
            connector: Arc::new(WebSocketConnector::new(ws_url)),
            source: Arc::new(HttpSnapshotSource::new(http_client, &api_url)),
            sender: Arc::new(sender),
            store: Arc::new(price_sync::sync::store::SqliteStore::new(db_pool.clone())),
            connectivity,
        },
    )
    .await;

    if let Some(codes) = optional_env("PRICE_SYNC_CODES") {
        orchestrator.subscribe_codes(
            codes
                .split(',')
                .map(str::trim)
                .filter(|code| !code.is_empty())
                .map(str::to_string),
        );
    }

    let _table_updates = orchestrator.subscribe_to_table(|table| {
        debug!(codes = table.len(), "price table updated");
    });
    let _failures = orchestrator.on_permanent_failure(|failure| {
        warn!(
            id = %failure.action_id,
            kind = failure.kind.as_str(),
            retry_count = failure.retry_count,
            reason = %failure.reason,
            "queued mutation dropped"
        );
    });

    let state = AppState::new(db_pool, orchestrator);
    info!("price-sync running");

    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                info!("shutdown requested");
                break;
            }
            _ = heartbeat.tick() => {
                let report = health(&state).await;
                info!(
                    status = report.status,
                    db = report.db,
                    phase = ?report.sync.phase,
                    push = ?report.sync.push_state,
                    codes = report.sync.codes,
                    stale = report.sync.stale,
                    pending_actions = report.sync.pending_actions,
                    "health"
                );
            }
        }
    }

    probe_cancel.cancel();
    let _ = probe_handle.await;
    state.orchestrator.shutdown().await;
    state.db_pool.close().await;
    Ok(())
}
