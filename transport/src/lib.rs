//! Records exchanged with the mutation storage layer.
//!
//! The storage layer never looks inside these records: they are serialized by
//! an injected codec and stored as opaque bytes. They live in their own crate
//! so that the API-facing service and the sequencer can share them without
//! depending on the storage implementation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of one queue shard ("log") within a directory.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub i64);

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for LogId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(LogId)
    }
}

/// Position within a queue shard. Queue rows are keyed by their timestamp in
/// UTC nanoseconds, so the watermark of a row is its timestamp.
#[derive(
    Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Watermark(pub i64);

impl Watermark {
    /// Watermark for a wall-clock time, or `None` when the time does not fit
    /// in `i64` nanoseconds (roughly years 1677 through 2262).
    pub fn from_time(time: DateTime<Utc>) -> Option<Self> {
        time.timestamp_nanos_opt().map(Watermark)
    }

    pub fn to_time(self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.0)
    }

    pub fn next(self) -> Self {
        Watermark(self.0.saturating_add(1))
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for Watermark {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse().map(Watermark)
    }
}

/// A signed change to one directory index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Entry {
    pub index: Vec<u8>,
    pub commitment: Vec<u8>,
    pub authorized_keys: Vec<Vec<u8>>,
    /// Hash of the previous entry for this index.
    pub previous: Vec<u8>,
    pub signatures: Vec<Vec<u8>>,
}

/// Commitment opening that accompanies an entry until it is applied.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Committed {
    pub key: Vec<u8>,
    pub data: Vec<u8>,
}

/// What a client submits to the queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntryUpdate {
    pub mutation: Entry,
    pub committed: Option<Committed>,
}

/// One row read back from a queue shard.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: Watermark,
    pub mutation: Entry,
    pub extra_data: Option<Committed>,
}

impl QueueMessage {
    pub fn new(id: Watermark, update: EntryUpdate) -> Self {
        Self {
            id,
            mutation: update.mutation,
            extra_data: update.committed,
        }
    }
}

/// The range of one shard consumed while building a revision:
/// rows with `low_watermark < id <= high_watermark`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSlice {
    pub log_id: LogId,
    pub low_watermark: Watermark,
    pub high_watermark: Watermark,
}

/// Provenance of a revision: every queue range it was built from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapMetadata {
    pub sources: Vec<SourceSlice>,
}
