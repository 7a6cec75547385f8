//! The ingestion queue accepts client updates and holds them until the
//! sequencer folds them into a revision.
//!
//! A directory's queue is split across several logs (shards). Writers pick a
//! log at random, which spreads concurrent inserts instead of serializing
//! them all on one hot log. Within a log, rows are keyed and ordered by their
//! timestamp in nanoseconds: a timestamp is accepted only if it is strictly
//! greater than every timestamp already in the log. That check and the insert
//! are one conditional statement, so racing writers on the same log cannot
//! both win or slip an older row in behind a newer one. Different logs never
//! coordinate.
//!
//! Readers drain a log incrementally with [Queue::high_watermark] and
//! [Queue::read_log]. Both take an exclusive `start` watermark; feeding the
//! last returned watermark back in as the next `start` visits every row once,
//! in order.

use std::cmp::max;

use chrono::{DateTime, Utc};
use futures::future;
use futures::stream::TryStreamExt;
use metrics::counter;
use mutations_transport::{EntryUpdate, LogId, QueueMessage, Watermark};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info, trace};

use crate::codec::{self, Codec, JsonCodec};
use crate::error::{is_unique_violation, Result, StorageError};
use crate::store::Store;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default number of rows fetched per read when the caller gives none.
    pub read_batch_size: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            read_batch_size: 100,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Queue<C = JsonCodec> {
    store: Store,
    codec: C,
}

impl Queue<JsonCodec> {
    pub fn new(store: Store) -> Self {
        Self::with_codec(store, JsonCodec)
    }
}

impl<C: Codec> Queue<C> {
    pub fn with_codec(store: Store, codec: C) -> Self {
        Self { store, codec }
    }

    /// Registers enabled logs for a directory. Either every log is added or,
    /// if any is already registered, none are.
    pub async fn add_logs(&self, directory: &str, log_ids: &[LogId]) -> Result<()> {
        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::store("begin add logs", e))?;

        for &log_id in log_ids {
            sqlx::query("INSERT INTO Logs (DirectoryID, LogID, Enabled) VALUES (?1, ?2, ?3)")
                .bind(directory)
                .bind(log_id.0)
                .bind(true)
                .execute(&mut *tx)
                .await
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        StorageError::LogExists {
                            directory: directory.to_string(),
                            log_id,
                        }
                    } else {
                        StorageError::store(format!("add log {directory}/{log_id}"), e)
                    }
                })?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::store("commit add logs", e))?;
        info!("added logs {:?} to {}", log_ids, directory);
        Ok(())
    }

    /// Enables or retires a log. A disabled log keeps its rows and remains
    /// readable; it is only excluded from random selection.
    pub async fn set_log_enabled(
        &self,
        directory: &str,
        log_id: LogId,
        enabled: bool,
    ) -> Result<()> {
        let updated =
            sqlx::query("UPDATE Logs SET Enabled = ?3 WHERE DirectoryID = ?1 AND LogID = ?2")
                .bind(directory)
                .bind(log_id.0)
                .bind(enabled)
                .execute(self.store.pool())
                .await
                .map_err(|e| StorageError::store(format!("update log {directory}/{log_id}"), e))?
                .rows_affected();

        if updated == 0 {
            return Err(StorageError::LogNotFound {
                directory: directory.to_string(),
                log_id,
            });
        }

        info!("log {directory}/{log_id} enabled: {enabled}");
        Ok(())
    }

    /// Lists a directory's logs in ascending order.
    pub async fn list_logs(&self, directory: &str, enabled_only: bool) -> Result<Vec<LogId>> {
        let logs = sqlx::query_scalar::<_, i64>(
            "
            SELECT LogID FROM Logs
            WHERE DirectoryID = ?1 AND (Enabled = 1 OR ?2 = 0)
            ORDER BY LogID ASC
        ",
        )
        .bind(directory)
        .bind(enabled_only)
        .fetch_all(self.store.pool())
        .await
        .map_err(|e| StorageError::store(format!("list logs for {directory}"), e))?;

        Ok(logs.into_iter().map(LogId).collect())
    }

    /// Draws one of the directory's enabled logs uniformly at random.
    pub(crate) async fn rand_log(&self, directory: &str) -> Result<LogId> {
        let logs = self.list_logs(directory, true).await?;
        logs.choose(&mut rand::thread_rng())
            .copied()
            .ok_or_else(|| StorageError::NoLogs {
                directory: directory.to_string(),
            })
    }

    /// Enqueues an update on a random enabled log, timestamped with the
    /// current time or, if that is not past the log's newest row, one
    /// nanosecond after it.
    ///
    /// A conflict here means another writer raced onto the same log and
    /// timestamp; the call can be retried. Nothing is retried internally.
    pub async fn send(&self, directory: &str, update: &EntryUpdate) -> Result<(LogId, Watermark)> {
        let log_id = self.rand_log(directory).await?;
        let now = Utc::now();
        let now = Watermark::from_time(now).ok_or(StorageError::TimestampOutOfRange(now))?;
        let timestamp = match self.newest(directory, log_id).await? {
            Some(high) => max(now, high.next()),
            None => now,
        };

        let data = codec::encode(&self.codec, update, "entry update")?;
        self.insert(directory, log_id, timestamp, &data).await?;
        Ok((log_id, timestamp))
    }

    /// Enqueues an update on the given log at an explicit time. Fails with a
    /// conflict if the time is already taken or is not after the log's newest
    /// row; in either case the log is left unchanged.
    pub async fn send_at(
        &self,
        directory: &str,
        log_id: LogId,
        update: &EntryUpdate,
        time: DateTime<Utc>,
    ) -> Result<Watermark> {
        let timestamp = Watermark::from_time(time).ok_or(StorageError::TimestampOutOfRange(time))?;
        let data = codec::encode(&self.codec, update, "entry update")?;
        self.insert(directory, log_id, timestamp, &data).await?;
        Ok(timestamp)
    }

    async fn insert(
        &self,
        directory: &str,
        log_id: LogId,
        timestamp: Watermark,
        data: &[u8],
    ) -> Result<()> {
        let conflict = |high: Option<Watermark>, exact: bool| {
            counter!("queue_send_conflict_total").increment(1);
            match high {
                Some(high) if !exact => StorageError::OutOfOrder {
                    directory: directory.to_string(),
                    log_id,
                    timestamp,
                    high,
                },
                _ => StorageError::TimestampExists {
                    directory: directory.to_string(),
                    log_id,
                    timestamp,
                },
            }
        };

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::store("begin send", e))?;

        let inserted = sqlx::query(
            "
            INSERT INTO Queue (DirectoryID, LogID, Time, Mutation)
            SELECT ?1, ?2, ?3, ?4
            WHERE NOT EXISTS (
                SELECT 1 FROM Queue
                WHERE DirectoryID = ?1 AND LogID = ?2 AND Time >= ?3
            )
        ",
        )
        .bind(directory)
        .bind(log_id.0)
        .bind(timestamp.0)
        .bind(data)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                conflict(None, true)
            } else {
                StorageError::store(format!("send to {directory}/{log_id}"), e)
            }
        })?
        .rows_affected();

        if inserted == 0 {
            // read the blocking row inside the same transaction to report it
            let (high, exact): (Option<i64>, Option<i64>) = sqlx::query_as(
                "
                SELECT MAX(Time), MAX(Time = ?3) FROM Queue
                WHERE DirectoryID = ?1 AND LogID = ?2
            ",
            )
            .bind(directory)
            .bind(log_id.0)
            .bind(timestamp.0)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| StorageError::store(format!("send to {directory}/{log_id}"), e))?;

            return Err(conflict(high.map(Watermark), exact == Some(1)));
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::store(format!("commit send to {directory}/{log_id}"), e))?;

        counter!("queue_send_total").increment(1);
        trace!("sent {} bytes to {directory}/{log_id} at {timestamp}", data.len());
        Ok(())
    }

    async fn newest(&self, directory: &str, log_id: LogId) -> Result<Option<Watermark>> {
        let high = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(Time) FROM Queue WHERE DirectoryID = ?1 AND LogID = ?2",
        )
        .bind(directory)
        .bind(log_id.0)
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| StorageError::store(format!("read newest in {directory}/{log_id}"), e))?;

        Ok(high.map(Watermark))
    }

    /// Scans at most `batch_size` rows after `start`, returning how many were
    /// seen and the watermark of the last one. With nothing to scan the count
    /// is zero and `start` comes back unchanged.
    pub async fn high_watermark(
        &self,
        directory: &str,
        log_id: LogId,
        start: Watermark,
        batch_size: u32,
    ) -> Result<(u32, Watermark)> {
        let (count, high): (i64, Option<i64>) = sqlx::query_as(
            "
            SELECT COUNT(*), MAX(Time) FROM (
                SELECT Time FROM Queue
                WHERE DirectoryID = ?1 AND LogID = ?2 AND Time > ?3
                ORDER BY Time ASC LIMIT ?4
            )
        ",
        )
        .bind(directory)
        .bind(log_id.0)
        .bind(start.0)
        .bind(i64::from(batch_size))
        .fetch_one(self.store.pool())
        .await
        .map_err(|e| StorageError::store(format!("high watermark of {directory}/{log_id}"), e))?;

        // bounded by the LIMIT
        let count = u32::try_from(count).unwrap_or(batch_size);
        let high = high.map(Watermark).unwrap_or(start);
        debug!("{directory}/{log_id} high watermark after {start}: {count} rows to {high}");
        Ok((count, high))
    }

    /// Reads at most `batch_size` rows with `start < id <= end`, oldest
    /// first.
    pub async fn read_log(
        &self,
        directory: &str,
        log_id: LogId,
        start: Watermark,
        end: Watermark,
        batch_size: u32,
    ) -> Result<Vec<QueueMessage>> {
        let messages: Vec<QueueMessage> = sqlx::query(
            "
            SELECT Time, Mutation FROM Queue
            WHERE DirectoryID = ?1 AND LogID = ?2 AND Time > ?3 AND Time <= ?4
            ORDER BY Time ASC LIMIT ?5
        ",
        )
        .bind(directory)
        .bind(log_id.0)
        .bind(start.0)
        .bind(end.0)
        .bind(i64::from(batch_size))
        .fetch(self.store.pool())
        .map_err(|e| StorageError::store(format!("read log {directory}/{log_id}"), e))
        .and_then(|row| future::ready(self.to_message(directory, log_id, &row)))
        .try_collect()
        .await?;

        counter!("queue_read_entries_total").increment(messages.len() as u64);
        Ok(messages)
    }

    fn to_message(&self, directory: &str, log_id: LogId, row: &SqliteRow) -> Result<QueueMessage> {
        let read = |e| StorageError::store(format!("read log {directory}/{log_id}"), e);
        let id = Watermark(row.try_get("Time").map_err(read)?);
        let data: &[u8] = row.try_get("Mutation").map_err(read)?;
        let update: EntryUpdate =
            codec::decode(&self.codec, data, || format!("queue row {directory}/{log_id}/{id}"))?;
        Ok(QueueMessage::new(id, update))
    }
}
