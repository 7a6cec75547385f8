//! Durable ingestion and sequencing storage for a transparency directory.
//!
//! Two components share one relational [Store] and nothing else:
//!
//! - The [Queue] shards incoming updates over several logs per directory and
//!   lets a sequencer drain each log in timestamp order.
//! - [Revisions] records, once per revision, the ordered mutations that make
//!   it up and the queue ranges it was built from.
//!
//! Coordination between writers happens entirely through the store, so the
//! components hold no state of their own and may run in many processes.

pub mod codec;
pub mod config;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod revision;
pub mod store;

pub use crate::config::MutationsConfig as Config;
pub use codec::{Codec, JsonCodec};
pub use error::{ErrorKind, Result, StorageError};
pub use mutations_transport as transport;
pub use queue::Queue;
pub use revision::Revisions;
pub use store::Store;

/// Attaches the configured store and builds both components on it.
pub async fn attach(config: &store::Config) -> Result<(Queue, Revisions)> {
    let store = Store::attach(config).await?;
    Ok((Queue::new(store.clone()), Revisions::new(store)))
}
