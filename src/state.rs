use crate::sync::orchestrator::SyncOrchestrator;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Instant;

pub struct AppState {
    pub started_at: Instant,
    pub db_pool: SqlitePool,
    pub orchestrator: Arc<SyncOrchestrator>,
}

impl AppState {
    pub fn new(db_pool: SqlitePool, orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            started_at: Instant::now(),
            db_pool,
            orchestrator,
        }
    }
}
