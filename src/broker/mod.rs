//! Durable, partitioned command log.
//!
//! Each partition is an append-only file of `Record`s framed like the store WAL,
//! fronted by its own group-commit writer task. Offsets are positions in the
//! partition, starting at 0. Readers long-poll on the partition's high
//! watermark, which only moves after the covering fsync.

pub mod offsets;

pub use offsets::OffsetStore;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc, oneshot, watch};
use tracing::{error, info};

use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::{Wal, WriterLock};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub key: Bytes,
    pub value: Bytes,
}

/// A record read back from a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub partition: u32,
    pub offset: u64,
    pub key: Bytes,
    pub value: Bytes,
}

#[derive(Debug)]
pub enum BrokerError {
    UnknownPartition(u32),
    /// The partition's writer is gone; nothing more can be appended.
    Closed(u32),
    Io(io::Error),
}

impl std::fmt::Display for BrokerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BrokerError::UnknownPartition(p) => write!(f, "unknown partition {p}"),
            BrokerError::Closed(p) => write!(f, "partition {p} is closed"),
            BrokerError::Io(e) => write!(f, "command log I/O error: {e}"),
        }
    }
}

impl std::error::Error for BrokerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BrokerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BrokerError {
    fn from(e: io::Error) -> Self {
        BrokerError::Io(e)
    }
}

type PendingAppend = (Record, oneshot::Sender<io::Result<u64>>);

struct Partition {
    entries: Arc<RwLock<Vec<Record>>>,
    writer: std::sync::RwLock<Option<mpsc::Sender<PendingAppend>>>,
    high_watermark: watch::Receiver<u64>,
}

impl Partition {
    fn sender(&self) -> Option<mpsc::Sender<PendingAppend>> {
        self.writer.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Drop our sender; the writer exits once in-flight appends finish.
    fn close(&self) {
        self.writer.write().unwrap_or_else(|p| p.into_inner()).take();
    }
}

/// Group-commit writer for one partition. Offsets are assigned only once the
/// batch is durable, so the high watermark never exposes an unsynced record.
/// A failed batch leaves nothing on disk; if that can't be guaranteed the
/// partition closes.
async fn partition_writer_loop(
    partition: u32,
    mut wal: Wal<Record>,
    entries: Arc<RwLock<Vec<Record>>>,
    high_watermark: watch::Sender<u64>,
    mut rx: mpsc::Receiver<PendingAppend>,
) {
    while let Some(first) = rx.recv().await {
        let mut pending = vec![first];
        while let Ok(next) = rx.try_recv() {
            pending.push(next);
        }

        let started = Instant::now();
        let synced = wal.commit(pending.iter().map(|(record, _)| record));
        metrics::histogram!(WAL_FLUSH_BATCH_SIZE, "log" => "commands").record(pending.len() as f64);
        metrics::histogram!(WAL_FLUSH_DURATION_SECONDS, "log" => "commands")
            .record(started.elapsed().as_secs_f64());

        if let Err(e) = synced {
            error!("partition {partition}: commit of {} records failed: {e}", pending.len());
            for (_, ack) in pending {
                let _ = ack.send(Err(io::Error::new(e.kind(), e.to_string())));
            }
            if wal.is_poisoned() {
                error!("partition {partition}: closing, file no longer matches acknowledged records");
                break;
            }
            continue;
        }

        let mut visible = entries.write().await;
        for (record, ack) in pending {
            let offset = visible.len() as u64;
            visible.push(record);
            let _ = ack.send(Ok(offset));
        }
        high_watermark.send_replace(visible.len() as u64);
    }
    info!("partition {partition}: writer stopped");
}

pub struct CommandLog {
    partitions: Vec<Partition>,
    _lock: WriterLock,
}

impl CommandLog {
    /// Open (or create) `partitions` partition files under `dir`, replaying
    /// what is already there. Fails with `WouldBlock` if another log already
    /// owns `dir`. Must be called from within a tokio runtime.
    pub fn open(dir: &Path, partitions: u32) -> Result<Self, BrokerError> {
        std::fs::create_dir_all(dir)?;
        let lock = WriterLock::acquire(&dir.join("writer.lock"))?;
        let mut opened = Vec::with_capacity(partitions as usize);
        for p in 0..partitions {
            let path = partition_path(dir, p);
            let (wal, existing) = Wal::<Record>::open(&path)?;

            let (hw_tx, hw_rx) = watch::channel(existing.len() as u64);
            let entries = Arc::new(RwLock::new(existing));
            let (tx, rx) = mpsc::channel(4096);
            tokio::spawn(partition_writer_loop(p, wal, entries.clone(), hw_tx, rx));

            opened.push(Partition {
                entries,
                writer: std::sync::RwLock::new(Some(tx)),
                high_watermark: hw_rx,
            });
        }
        info!("command log opened at {} with {partitions} partitions", dir.display());
        Ok(Self {
            partitions: opened,
            _lock: lock,
        })
    }

    pub fn partitions(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn partition(&self, partition: u32) -> Result<&Partition, BrokerError> {
        self.partitions
            .get(partition as usize)
            .ok_or(BrokerError::UnknownPartition(partition))
    }

    /// Append and wait until the record is durable. Returns its offset.
    pub async fn append(&self, partition: u32, record: Record) -> Result<u64, BrokerError> {
        let sender = self
            .partition(partition)?
            .sender()
            .ok_or(BrokerError::Closed(partition))?;
        let (tx, rx) = oneshot::channel();
        sender
            .send((record, tx))
            .await
            .map_err(|_| BrokerError::Closed(partition))?;
        let offset = rx.await.map_err(|_| BrokerError::Closed(partition))??;
        Ok(offset)
    }

    /// Next offset to be assigned on `partition`.
    pub fn high_watermark(&self, partition: u32) -> Result<u64, BrokerError> {
        Ok(*self.partition(partition)?.high_watermark.borrow())
    }

    /// Up to `max` entries starting at `from`. Waits up to `timeout` for the
    /// first one when nothing is available yet; an empty result means none arrived.
    pub async fn poll(
        &self,
        partition: u32,
        from: u64,
        max: usize,
        timeout: Duration,
    ) -> Result<Vec<LogEntry>, BrokerError> {
        let part = self.partition(partition)?;
        let mut hw = part.high_watermark.clone();
        let writer_gone = matches!(
            tokio::time::timeout(timeout, hw.wait_for(|mark| *mark > from)).await,
            Ok(Err(_))
        );

        let guard = part.entries.read().await;
        let start = (from as usize).min(guard.len());
        let end = start.saturating_add(max).min(guard.len());
        if start == end && writer_gone {
            return Err(BrokerError::Closed(partition));
        }
        Ok(guard[start..end]
            .iter()
            .enumerate()
            .map(|(i, r)| LogEntry {
                partition,
                offset: (start + i) as u64,
                key: r.key.clone(),
                value: r.value.clone(),
            })
            .collect())
    }

    /// Hold back acknowledgements on `partition` until the guard drops.
    /// Appends are still written; only the offset assignment waits.
    #[cfg(test)]
    pub(crate) async fn stall_acks(
        &self,
        partition: u32,
    ) -> Result<tokio::sync::OwnedRwLockReadGuard<Vec<Record>>, BrokerError> {
        Ok(self.partition(partition)?.entries.clone().read_owned().await)
    }

    /// Stop accepting appends on one partition. Already-durable records stay readable.
    pub fn close_partition(&self, partition: u32) -> Result<(), BrokerError> {
        self.partition(partition)?.close();
        Ok(())
    }

    pub fn close(&self) {
        for p in &self.partitions {
            p.close();
        }
    }
}

fn partition_path(dir: &Path, partition: u32) -> PathBuf {
    dir.join(format!("partition-{partition:04}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotguard_test_broker").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    fn record(key: &str, value: &str) -> Record {
        Record {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::copy_from_slice(value.as_bytes()),
        }
    }

    #[tokio::test]
    async fn append_assigns_sequential_offsets() {
        let log = CommandLog::open(&test_dir("sequential"), 2).unwrap();
        assert_eq!(log.append(0, record("a", "1")).await.unwrap(), 0);
        assert_eq!(log.append(0, record("a", "2")).await.unwrap(), 1);
        assert_eq!(log.append(1, record("b", "1")).await.unwrap(), 0);
        assert_eq!(log.high_watermark(0).unwrap(), 2);
        assert_eq!(log.high_watermark(1).unwrap(), 1);
    }

    #[tokio::test]
    async fn poll_returns_in_order_from_offset() {
        let log = CommandLog::open(&test_dir("poll_order"), 1).unwrap();
        for i in 0..5 {
            log.append(0, record("k", &i.to_string())).await.unwrap();
        }
        let entries = log.poll(0, 2, 10, Duration::from_millis(10)).await.unwrap();
        let offsets: Vec<u64> = entries.iter().map(|e| e.offset).collect();
        assert_eq!(offsets, vec![2, 3, 4]);
        assert_eq!(entries[0].value, Bytes::from_static(b"2"));

        let capped = log.poll(0, 0, 2, Duration::from_millis(10)).await.unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[tokio::test]
    async fn poll_times_out_empty() {
        let log = CommandLog::open(&test_dir("poll_timeout"), 1).unwrap();
        let entries = log.poll(0, 0, 10, Duration::from_millis(20)).await.unwrap();
        assert!(entries.is_empty());
    }

    #[tokio::test]
    async fn poll_wakes_on_append() {
        let log = Arc::new(CommandLog::open(&test_dir("poll_wake"), 1).unwrap());
        let reader = {
            let log = log.clone();
            tokio::spawn(async move { log.poll(0, 0, 10, Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        log.append(0, record("k", "v")).await.unwrap();

        let entries = reader.await.unwrap().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].offset, 0);
    }

    #[tokio::test]
    async fn reopen_replays_partitions() {
        let dir = test_dir("reopen");
        {
            let log = CommandLog::open(&dir, 2).unwrap();
            log.append(1, record("k", "first")).await.unwrap();
            log.append(1, record("k", "second")).await.unwrap();
        }
        let log = CommandLog::open(&dir, 2).unwrap();
        assert_eq!(log.high_watermark(1).unwrap(), 2);
        assert_eq!(log.append(1, record("k", "third")).await.unwrap(), 2);
        let values: Vec<Bytes> = log
            .poll(1, 0, 10, Duration::from_millis(10))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn closed_partition_rejects_appends_but_serves_reads() {
        let log = CommandLog::open(&test_dir("closed"), 2).unwrap();
        log.append(0, record("k", "v")).await.unwrap();
        log.close_partition(0).unwrap();

        assert!(matches!(
            log.append(0, record("k", "w")).await,
            Err(BrokerError::Closed(0))
        ));
        assert_eq!(log.poll(0, 0, 10, Duration::from_millis(10)).await.unwrap().len(), 1);
        // Other partitions are unaffected
        assert_eq!(log.append(1, record("k", "v")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn unknown_partition() {
        let log = CommandLog::open(&test_dir("unknown"), 1).unwrap();
        assert!(matches!(
            log.append(3, record("k", "v")).await,
            Err(BrokerError::UnknownPartition(3))
        ));
        assert!(matches!(
            log.poll(3, 0, 1, Duration::ZERO).await,
            Err(BrokerError::UnknownPartition(3))
        ));
    }

    #[tokio::test]
    async fn failed_commit_is_not_replayed() {
        use crate::wal::faults::{self, Fault};

        let dir = test_dir("failed_commit");
        {
            let log = CommandLog::open(&dir, 1).unwrap();
            faults::arm(&partition_path(&dir, 0), Fault::Sync);
            assert!(matches!(
                log.append(0, record("k", "lost")).await,
                Err(BrokerError::Io(_))
            ));
            assert_eq!(log.high_watermark(0).unwrap(), 0);
            assert_eq!(log.append(0, record("k", "kept")).await.unwrap(), 0);
        }

        let log = CommandLog::open(&dir, 1).unwrap();
        let values: Vec<Bytes> = log
            .poll(0, 0, 10, Duration::from_millis(10))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.value)
            .collect();
        assert_eq!(values, vec!["kept"]);
    }

    #[tokio::test]
    async fn partition_closes_when_rollback_fails() {
        use crate::wal::faults::{self, Fault};

        let dir = test_dir("rollback_fails");
        let log = CommandLog::open(&dir, 2).unwrap();
        log.append(0, record("k", "durable")).await.unwrap();

        let path = partition_path(&dir, 0);
        faults::arm(&path, Fault::Sync);
        faults::arm(&path, Fault::Rollback);
        assert!(matches!(
            log.append(0, record("k", "torn")).await,
            Err(BrokerError::Io(_))
        ));
        assert!(matches!(
            log.append(0, record("k", "after")).await,
            Err(BrokerError::Closed(0))
        ));
        assert_eq!(log.poll(0, 0, 10, Duration::from_millis(10)).await.unwrap().len(), 1);
        assert_eq!(log.append(1, record("k", "v")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn second_log_on_same_dir_is_refused() {
        let dir = test_dir("exclusive");
        let first = CommandLog::open(&dir, 1).unwrap();
        match CommandLog::open(&dir, 1) {
            Err(BrokerError::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::WouldBlock),
            Err(other) => panic!("expected a lock error, got {other}"),
            Ok(_) => panic!("second log opened the same directory"),
        }

        drop(first);
        assert!(CommandLog::open(&dir, 1).is_ok());
    }
}
