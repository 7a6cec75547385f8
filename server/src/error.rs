//! Errors returned by the queue and revision store.
//!
//! Store failures are never swallowed. Each one is classified into an
//! [ErrorKind] so callers can decide between retrying and giving up without
//! inspecting messages.

use std::borrow::Cow;

use mutations_transport::{LogId, Watermark};
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = StorageError> = std::result::Result<T, E>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Conflict,
    InvalidArgument,
    Unavailable,
    Internal,
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("no enabled logs for directory {directory}")]
    NoLogs { directory: String },
    #[error("log {log_id} not found for directory {directory}")]
    LogNotFound { directory: String, log_id: LogId },
    #[error("log {log_id} already registered for directory {directory}")]
    LogExists { directory: String, log_id: LogId },
    #[error("timestamp {timestamp} already written to {directory}/{log_id}")]
    TimestampExists {
        directory: String,
        log_id: LogId,
        timestamp: Watermark,
    },
    #[error("timestamp {timestamp} is not after {directory}/{log_id} high watermark {high}")]
    OutOfOrder {
        directory: String,
        log_id: LogId,
        timestamp: Watermark,
        high: Watermark,
    },
    #[error("timestamp {0} cannot be stored as nanoseconds")]
    TimestampOutOfRange(chrono::DateTime<chrono::Utc>),
    #[error("sequence {sequence} already written for {directory} revision {revision}")]
    SequenceExists {
        directory: String,
        revision: i64,
        sequence: i64,
    },
    #[error("batch sources already written for {directory} revision {revision}")]
    BatchExists { directory: String, revision: i64 },
    #[error("no batch sources for {directory} revision {revision}")]
    BatchNotFound { directory: String, revision: i64 },
    #[error("could not encode {what}: {source}")]
    Encode {
        what: Cow<'static, str>,
        #[source]
        source: BoxError,
    },
    #[error("could not decode {what}: {source}")]
    Decode {
        what: Cow<'static, str>,
        #[source]
        source: BoxError,
    },
    #[error("{context}: {source}")]
    Store {
        context: Cow<'static, str>,
        #[source]
        source: sqlx::Error,
    },
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StorageError {
    pub(crate) fn store(context: impl Into<Cow<'static, str>>, source: sqlx::Error) -> Self {
        Self::Store {
            context: context.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoLogs { .. } | Self::LogNotFound { .. } | Self::BatchNotFound { .. } => {
                ErrorKind::NotFound
            }
            Self::LogExists { .. }
            | Self::TimestampExists { .. }
            | Self::OutOfOrder { .. }
            | Self::SequenceExists { .. }
            | Self::BatchExists { .. } => ErrorKind::Conflict,
            Self::TimestampOutOfRange(_) | Self::Encode { .. } | Self::Decode { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::Store { source, .. } => classify(source),
            Self::Migrate(_) => ErrorKind::Internal,
        }
    }

    /// True when the same call may succeed later. For writes, callers must
    /// still confirm through a read that an ambiguous failure did not land.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Conflict | ErrorKind::Unavailable)
    }
}

// primary result codes, the low byte of extended codes
const SQLITE_BUSY: i32 = 5;
const SQLITE_LOCKED: i32 = 6;

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.is_unique_violation(),
        _ => false,
    }
}

fn classify(err: &sqlx::Error) -> ErrorKind {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                return ErrorKind::Conflict;
            }
            let code = db_err
                .code()
                .and_then(|c| c.parse::<i32>().ok())
                .map(|c| c & 0xff);
            match code {
                Some(SQLITE_BUSY) | Some(SQLITE_LOCKED) => ErrorKind::Unavailable,
                _ => ErrorKind::Internal,
            }
        }
        sqlx::Error::RowNotFound => ErrorKind::NotFound,
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed
        | sqlx::Error::Io(_) => ErrorKind::Unavailable,
        _ => ErrorKind::Internal,
    }
}
