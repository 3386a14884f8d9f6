use crate::state::AppState;
use crate::sync::types::SyncStatusSnapshot;
use serde::Serialize;
use sqlx::SqlitePool;
use std::time::Instant;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_ms: u128,
    pub db: &'static str,
    pub sync: SyncStatusSnapshot,
}

pub async fn build_health_response(
    started_at: Instant,
    pool: &SqlitePool,
    sync: SyncStatusSnapshot,
) -> HealthResponse {
    let db_status = match sqlx::query_scalar::<_, i64>("SELECT 1")
        .fetch_one(pool)
        .await
    {
        Ok(_) => "ok",
        Err(_) => "error",
    };

    let status = if db_status == "ok" && !sync.offline && !sync.stale {
        "ok"
    } else {
        "degraded"
    };

    HealthResponse {
        status,
        uptime_ms: started_at.elapsed().as_millis(),
        db: db_status,
        sync,
    }
}

pub async fn health(state: &AppState) -> HealthResponse {
    build_health_response(state.started_at, &state.db_pool, state.orchestrator.status()).await
}
