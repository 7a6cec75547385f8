//! Handle to the relational store shared by the queue and the revision store.
//!
//! All durable state lives in the database. Nothing here caches rows between
//! calls, so any number of processes may attach to the same store, and
//! ordering guarantees come from the statements themselves rather than from
//! in-process locks.
//!
//! The only supported store is SQLite. The schema is embedded as `sqlx`
//! migrations made of `CREATE TABLE IF NOT EXISTS` statements, so attaching
//! on every startup is safe.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use crate::error::{Result, StorageError};

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_path: PathBuf,
    pub max_connections: u32,
    #[serde(with = "humantime_serde")]
    pub acquire_timeout: Duration,
    /// How long a connection waits on a locked database before failing.
    #[serde(with = "humantime_serde")]
    pub busy_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("./data/mutations.sqlite"),
            max_connections: 1,
            acquire_timeout: Duration::from_secs(30),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub async fn attach(config: &Config) -> Result<Self> {
        let path = &config.data_path;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if !parent.is_dir() {
                return Err(StorageError::store(
                    format!("data directory '{}' not found", parent.display()),
                    sqlx::Error::Io(std::io::ErrorKind::NotFound.into()),
                ));
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(config.busy_timeout);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .min_connections(1)
            .acquire_timeout(config.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::store(format!("could not open {path:?}"), e))?;

        info!("attached mutation store at {path:?}");
        MIGRATOR.run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn attach_path(path: impl Into<PathBuf>) -> Result<Self> {
        Self::attach(&Config {
            data_path: path.into(),
            ..Config::default()
        })
        .await
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await
    }
}
