//! The revision store keeps the finalized history of each directory: the
//! ordered mutations that make up a revision, and the queue ranges the
//! revision was built from.
//!
//! Both are write-once. Rewriting a revision is an upstream logic error and
//! fails with a conflict instead of overwriting, which also makes a blind
//! retry of a write that already landed fail loudly.

use futures::future;
use futures::stream::TryStreamExt;
use metrics::counter;
use mutations_transport::{Entry, MapMetadata};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::{debug, info};

use crate::codec::{self, Codec, JsonCodec};
use crate::error::{is_unique_violation, Result, StorageError};
use crate::store::Store;

#[derive(Clone, Debug)]
pub struct Revisions<C = JsonCodec> {
    store: Store,
    codec: C,
}

impl Revisions<JsonCodec> {
    pub fn new(store: Store) -> Self {
        Self::with_codec(store, JsonCodec)
    }
}

impl<C: Codec> Revisions<C> {
    pub fn with_codec(store: Store, codec: C) -> Self {
        Self { store, codec }
    }

    /// Stores the mutations of a revision, each at its list index. The batch
    /// is one transaction: if any sequence is already taken nothing is
    /// written.
    pub async fn write_batch(
        &self,
        directory: &str,
        revision: i64,
        mutations: &[Entry],
    ) -> Result<()> {
        let encoded = mutations
            .iter()
            .enumerate()
            .map(|(sequence, m)| {
                codec::encode(&self.codec, m, format!("mutation {sequence} of revision {revision}"))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut tx = self
            .store
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::store("begin write batch", e))?;

        for (sequence, data) in (0i64..).zip(encoded.iter()) {
            sqlx::query(
                "
                INSERT INTO Mutations (DirectoryID, Revision, Sequence, Mutation)
                VALUES (?1, ?2, ?3, ?4)
            ",
            )
            .bind(directory)
            .bind(revision)
            .bind(sequence)
            .bind(data.as_slice())
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::SequenceExists {
                        directory: directory.to_string(),
                        revision,
                        sequence,
                    }
                } else {
                    StorageError::store(format!("write {directory} revision {revision}"), e)
                }
            })?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::store(format!("commit {directory} revision {revision}"), e))?;

        counter!("revision_write_batch_total").increment(1);
        counter!("revision_write_batch_entries_total").increment(mutations.len() as u64);
        info!(
            "wrote {} mutations for {directory} revision {revision}",
            mutations.len()
        );
        Ok(())
    }

    /// Reads up to `page_size` mutations of a revision with sequence `>= start`
    /// in sequence order, along with the highest sequence returned (0 when
    /// the page is empty). The next page starts at that sequence plus one.
    pub async fn read_page(
        &self,
        directory: &str,
        revision: i64,
        start: i64,
        page_size: u32,
    ) -> Result<(i64, Vec<Entry>)> {
        let rows: Vec<(i64, Entry)> = sqlx::query(
            "
            SELECT Sequence, Mutation FROM Mutations
            WHERE DirectoryID = ?1 AND Revision = ?2 AND Sequence >= ?3
            ORDER BY Sequence ASC LIMIT ?4
        ",
        )
        .bind(directory)
        .bind(revision)
        .bind(start)
        .bind(i64::from(page_size))
        .fetch(self.store.pool())
        .map_err(|e| StorageError::store(format!("read {directory} revision {revision}"), e))
        .and_then(|row| future::ready(self.to_entry(directory, revision, &row)))
        .try_collect()
        .await?;

        let max_sequence = rows.iter().map(|(s, _)| *s).max().unwrap_or(0);
        debug!(
            "read {} mutations of {directory} revision {revision} from {start}",
            rows.len()
        );
        Ok((max_sequence, rows.into_iter().map(|(_, e)| e).collect()))
    }

    fn to_entry(&self, directory: &str, revision: i64, row: &SqliteRow) -> Result<(i64, Entry)> {
        let read = |e| StorageError::store(format!("read {directory} revision {revision}"), e);
        let sequence: i64 = row.try_get("Sequence").map_err(read)?;
        let data: &[u8] = row.try_get("Mutation").map_err(read)?;
        let entry = codec::decode(&self.codec, data, || {
            format!("mutation {directory}/{revision}/{sequence}")
        })?;
        Ok((sequence, entry))
    }

    /// Records which queue ranges a revision was built from. Fails if the
    /// revision already has sources.
    pub async fn write_batch_sources(
        &self,
        directory: &str,
        revision: i64,
        sources: &MapMetadata,
    ) -> Result<()> {
        let data = codec::encode(&self.codec, sources, format!("sources of revision {revision}"))?;

        sqlx::query("INSERT INTO Batches (DirectoryID, Revision, Sources) VALUES (?1, ?2, ?3)")
            .bind(directory)
            .bind(revision)
            .bind(data)
            .execute(self.store.pool())
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    StorageError::BatchExists {
                        directory: directory.to_string(),
                        revision,
                    }
                } else {
                    StorageError::store(
                        format!("insert batch sources ({directory}, {revision})"),
                        e,
                    )
                }
            })?;

        info!(
            "wrote {} batch sources for {directory} revision {revision}",
            sources.sources.len()
        );
        Ok(())
    }

    pub async fn read_batch(&self, directory: &str, revision: i64) -> Result<MapMetadata> {
        let data = sqlx::query_scalar::<_, Vec<u8>>(
            "SELECT Sources FROM Batches WHERE DirectoryID = ?1 AND Revision = ?2",
        )
        .bind(directory)
        .bind(revision)
        .fetch_optional(self.store.pool())
        .await
        .map_err(|e| StorageError::store(format!("read batch sources ({directory}, {revision})"), e))?
        .ok_or_else(|| StorageError::BatchNotFound {
            directory: directory.to_string(),
            revision,
        })?;

        codec::decode(&self.codec, &data, || {
            format!("batch sources {directory}/{revision}")
        })
    }
}
