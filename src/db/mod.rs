use crate::error::AppError;
use sqlx::{sqlite::SqliteConnectOptions, SqlitePool};
use std::path::{Path, PathBuf};

const DEFAULT_DB_FILENAME: &str = "price-sync.db";

fn resolve_db_filename() -> String {
    std::env::var("PRICE_SYNC_DB_FILENAME")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_DB_FILENAME.to_string())
}

fn resolve_data_dir() -> Result<PathBuf, AppError> {
    let base_dir = match std::env::var("PRICE_SYNC_DATA_DIR") {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => std::env::current_dir()?,
    };
    std::fs::create_dir_all(&base_dir)?;
    Ok(base_dir)
}

pub fn resolve_db_path() -> Result<PathBuf, AppError> {
    let mut base_dir = resolve_data_dir()?;
    base_dir.push(resolve_db_filename());
    Ok(base_dir)
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), AppError> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn initialize_pool_from_path(path: &Path) -> Result<SqlitePool, AppError> {
    let connect_options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePool::connect_with(connect_options).await?;
    run_migrations(&pool).await?;

    Ok(pool)
}

pub async fn initialize_pool() -> Result<SqlitePool, AppError> {
    let db_path = resolve_db_path()?;
    initialize_pool_from_path(&db_path).await
}
