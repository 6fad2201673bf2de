use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

use crate::config::Config;

/// Opens the document store's connection pool.
///
/// `DATABASE_URL` (via `db.url`) wins over `db.path`. When the path is used,
/// its parent directory is created first.
pub async fn connect(config: &Config) -> Result<SqlitePool> {
    if config.db.url.is_none() {
        if let Some(parent) = config.db.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory: {}", parent.display())
                })?;
            }
        }
    }

    let url = config.database_url();
    let options = SqliteConnectOptions::from_str(&url)
        .with_context(|| format!("Invalid database url: {}", url))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(config.db.max_connections)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to open database: {}", url))?;

    Ok(pool)
}
