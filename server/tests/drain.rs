use std::collections::HashMap;

use anyhow::Result;
use tempfile::tempdir;
use test_log::test;

use mutations::transport::{Entry, EntryUpdate, LogId, MapMetadata, SourceSlice, Watermark};
use mutations::{ErrorKind, Queue, Revisions, Store};

const DIRECTORY: &str = "directory";

fn update(n: u16) -> EntryUpdate {
    EntryUpdate {
        mutation: Entry {
            index: n.to_be_bytes().to_vec(),
            ..Entry::default()
        },
        committed: None,
    }
}

/// Drains one log in small steps, the way a sequencer resumes from its last
/// watermark, and returns what was read along with the range covered.
async fn drain(
    queue: &Queue,
    log_id: LogId,
    from: Watermark,
    batch_size: u32,
) -> Result<(Vec<(Watermark, Entry)>, SourceSlice)> {
    let mut start = from;
    let mut read = vec![];
    loop {
        let (count, high) = queue
            .high_watermark(DIRECTORY, log_id, start, batch_size)
            .await?;
        if count == 0 {
            assert_eq!(high, start);
            break;
        }
        let rows = queue
            .read_log(DIRECTORY, log_id, start, high, batch_size)
            .await?;
        assert_eq!(rows.len(), count as usize);
        assert_eq!(rows.last().map(|r| r.id), Some(high));
        read.extend(rows.into_iter().map(|r| (r.id, r.mutation)));
        start = high;
    }

    Ok((
        read,
        SourceSlice {
            log_id,
            low_watermark: from,
            high_watermark: start,
        },
    ))
}

#[test(tokio::test)]
async fn test_drain_and_build_revision() -> Result<()> {
    let root = tempdir()?;
    let store = Store::attach_path(root.path().join("mutations.sqlite")).await?;
    let queue = Queue::new(store.clone());
    let revisions = Revisions::new(store);

    let logs = [LogId(1), LogId(2), LogId(3)];
    queue.add_logs(DIRECTORY, &logs).await?;

    let mut sent: HashMap<LogId, Vec<(Watermark, Entry)>> = HashMap::new();
    for n in 0..60 {
        let update = update(n);
        let (log_id, timestamp) = queue.send(DIRECTORY, &update).await?;
        sent.entry(log_id)
            .or_default()
            .push((timestamp, update.mutation));
    }

    let mut mutations = vec![];
    let mut sources = MapMetadata::default();
    for log_id in queue.list_logs(DIRECTORY, true).await? {
        let (read, slice) = drain(&queue, log_id, Watermark(0), 7).await?;
        let want = sent.remove(&log_id).unwrap_or_default();

        // every row exactly once, in order, same as a single unbounded read
        assert_eq!(read, want, "log {log_id}");
        let all = queue
            .read_log(DIRECTORY, log_id, Watermark(0), slice.high_watermark, u32::MAX)
            .await?;
        assert_eq!(all.len(), read.len());

        mutations.extend(read.into_iter().map(|(_, entry)| entry));
        sources.sources.push(slice);
    }
    assert!(sent.is_empty());
    assert_eq!(mutations.len(), 60);

    revisions.write_batch(DIRECTORY, 1, &mutations).await?;
    revisions.write_batch_sources(DIRECTORY, 1, &sources).await?;

    // replay the revision page by page
    let mut replayed = vec![];
    let mut start = 0;
    loop {
        let (max, page) = revisions.read_page(DIRECTORY, 1, start, 16).await?;
        if page.is_empty() {
            break;
        }
        replayed.extend(page);
        start = max + 1;
    }
    assert_eq!(replayed, mutations);
    assert_eq!(revisions.read_batch(DIRECTORY, 1).await?, sources);

    // a replayed sequencer run must not rebuild the revision
    let err = revisions
        .write_batch(DIRECTORY, 1, &mutations)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let err = revisions
        .write_batch_sources(DIRECTORY, 1, &sources)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);

    // resuming from the recorded watermarks finds only newer rows
    let (log_id, timestamp) = queue.send(DIRECTORY, &update(1000)).await?;
    let slice = sources
        .sources
        .iter()
        .find(|s| s.log_id == log_id)
        .copied()
        .unwrap();
    let (read, next) = drain(&queue, log_id, slice.high_watermark, 7).await?;
    assert_eq!(read, vec![(timestamp, update(1000).mutation)]);
    assert_eq!(next.high_watermark, timestamp);

    Ok(())
}

#[test(tokio::test)]
async fn test_concurrent_senders() -> Result<()> {
    let root = tempdir()?;
    let store = Store::attach_path(root.path().join("mutations.sqlite")).await?;
    let queue = Queue::new(store);
    queue.add_logs(DIRECTORY, &[LogId(1), LogId(2)]).await?;

    let tasks: Vec<_> = (0..8u16)
        .map(|worker| {
            let queue = queue.clone();
            tokio::spawn(async move {
                let mut written = 0;
                for n in 0..10 {
                    // conflicts are expected under contention; the caller retries
                    loop {
                        match queue.send(DIRECTORY, &update(worker * 100 + n)).await {
                            Ok(_) => break,
                            Err(e) if e.is_retryable() => continue,
                            Err(e) => return Err(e),
                        }
                    }
                    written += 1;
                }
                Ok(written)
            })
        })
        .collect();

    let mut total = 0;
    for task in tasks {
        total += task.await??;
    }
    assert_eq!(total, 80);

    let mut read = 0;
    for log_id in [LogId(1), LogId(2)] {
        let rows = queue
            .read_log(DIRECTORY, log_id, Watermark(0), Watermark(i64::MAX), 1000)
            .await?;
        assert!(rows.windows(2).all(|w| w[0].id < w[1].id));
        read += rows.len();
    }
    assert_eq!(read, 80);
    Ok(())
}
