use std::env;
use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use tracing_subscriber::{fmt, EnvFilter};

use mutations::transport::{EntryUpdate, LogId, Watermark};
use mutations::{config, metrics};

#[derive(Debug, Parser)]
#[command(
    name = "mutations",
    about = "Administer the mutation queue and revision store."
)]
struct Cli {
    /// Database file, overriding the configured `store.data_path`
    #[arg(long)]
    data_path: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Register enabled logs for a directory
    AddLogs {
        directory: String,
        #[arg(required = true)]
        log_ids: Vec<LogId>,
    },
    /// Make a log eligible for new writes again
    EnableLog { directory: String, log_id: LogId },
    /// Retire a log from new writes, keeping its backlog
    DisableLog { directory: String, log_id: LogId },
    /// List a directory's logs
    Logs {
        directory: String,
        /// Include disabled logs
        #[arg(long)]
        all: bool,
    },
    /// Enqueue a JSON-encoded entry update on a random log
    Send { directory: String, update: String },
    /// Count unread rows of a log after a watermark
    Watermark {
        directory: String,
        log_id: LogId,
        #[arg(long, default_value_t)]
        start: Watermark,
        #[arg(long)]
        batch_size: Option<u32>,
    },
    /// Read rows of a log in (start, end]
    ReadLog {
        directory: String,
        log_id: LogId,
        #[arg(long, default_value_t)]
        start: Watermark,
        /// Defaults to the current time
        #[arg(long)]
        end: Option<Watermark>,
        #[arg(long)]
        batch_size: Option<u32>,
    },
    /// Read a page of a revision's mutations
    ReadPage {
        directory: String,
        revision: i64,
        #[arg(long, default_value_t = 0)]
        start: i64,
        #[arg(long)]
        page_size: Option<u32>,
    },
    /// Show the queue ranges a revision was built from
    ReadBatch { directory: String, revision: i64 },
}

fn emit<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "warn")
    }
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = config::binary_config().context("error getting configuration")?;
    if let Some(path) = cli.data_path {
        config.store.data_path = path;
    }
    metrics::start_metrics(config.metrics.clone())?;

    let (queue, revisions) = mutations::attach(&config.store).await?;
    let batch = config.queue.read_batch_size;

    match cli.cmd {
        Command::AddLogs { directory, log_ids } => {
            queue.add_logs(&directory, &log_ids).await?;
        }
        Command::EnableLog { directory, log_id } => {
            queue.set_log_enabled(&directory, log_id, true).await?;
        }
        Command::DisableLog { directory, log_id } => {
            queue.set_log_enabled(&directory, log_id, false).await?;
        }
        Command::Logs { directory, all } => {
            emit(&queue.list_logs(&directory, !all).await?)?;
        }
        Command::Send { directory, update } => {
            let update: EntryUpdate =
                serde_json::from_str(&update).context("update is not a JSON entry update")?;
            let (log_id, timestamp) = queue.send(&directory, &update).await?;
            emit(&json!({ "log_id": log_id, "timestamp": timestamp }))?;
        }
        Command::Watermark {
            directory,
            log_id,
            start,
            batch_size,
        } => {
            let (count, high) = queue
                .high_watermark(&directory, log_id, start, batch_size.unwrap_or(batch))
                .await?;
            emit(&json!({ "count": count, "high_watermark": high }))?;
        }
        Command::ReadLog {
            directory,
            log_id,
            start,
            end,
            batch_size,
        } => {
            let end = match end {
                Some(end) => end,
                None => Watermark::from_time(chrono::Utc::now())
                    .context("current time does not fit a watermark")?,
            };
            let rows = queue
                .read_log(&directory, log_id, start, end, batch_size.unwrap_or(batch))
                .await?;
            emit(&rows)?;
        }
        Command::ReadPage {
            directory,
            revision,
            start,
            page_size,
        } => {
            let (max_sequence, entries) = revisions
                .read_page(&directory, revision, start, page_size.unwrap_or(batch))
                .await?;
            emit(&json!({ "max_sequence": max_sequence, "entries": entries }))?;
        }
        Command::ReadBatch {
            directory,
            revision,
        } => {
            emit(&revisions.read_batch(&directory, revision).await?)?;
        }
    }

    Ok(())
}
