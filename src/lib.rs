pub mod db;
pub mod error;
pub mod health;
pub mod state;
pub mod sync;

pub use error::AppError;
pub use sync::config::{SyncConfig, SyncConfigArgs};
pub use sync::orchestrator::{RefreshOutcome, SyncDependencies, SyncOrchestrator};
pub use sync::types::{
    ActionKind, ActionOutcome, ConnectivityState, PriceRecord, PriceTable, QueuedAction,
    SyncPhase, SyncStatusSnapshot,
};

use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "price_sync=info";

/// Installs the global subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
