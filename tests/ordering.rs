use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use bytes::Bytes;
use chrono::NaiveDate;
use tokio_test::{assert_err, assert_ok};
use ulid::Ulid;

use slotguard::broker::{CommandLog, OffsetStore, Record};
use slotguard::codec;
use slotguard::config::{ProcessorConfig, StoreConfig};
use slotguard::engine::{BookingStore, Engine, EngineError};
use slotguard::model::*;
use slotguard::processor::{PartitionState, ProcessorGroup, ShutdownOutcome};
use slotguard::router::{CommandRouter, DeliveryFailure};

const GROUP: &str = "ordering-test";

fn test_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("slotguard_test_ordering").join(name);
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn processor_config() -> ProcessorConfig {
    ProcessorConfig {
        workers: 2,
        consumer_group: GROUP.into(),
        poll_timeout: Duration::from_millis(20),
        max_batch: 100,
        retry_backoff: Duration::from_millis(10),
    }
}

struct Harness {
    dir: PathBuf,
    log: Arc<CommandLog>,
    offsets: Arc<OffsetStore>,
    router: CommandRouter,
}

impl Harness {
    fn new(name: &str, partitions: u32) -> Self {
        let dir = test_dir(name);
        let log = Arc::new(CommandLog::open(&dir.join("commands"), partitions).unwrap());
        let offsets = Arc::new(OffsetStore::open(&dir.join("offsets")).unwrap());
        let router = CommandRouter::new(log.clone(), Duration::from_secs(5));
        Self {
            dir,
            log,
            offsets,
            router,
        }
    }

    fn engine(&self, wal: &str) -> Arc<Engine> {
        Arc::new(Engine::new(self.dir.join(wal), StoreConfig::default()).unwrap())
    }

    fn start(&self, store: Arc<dyn BookingStore>) -> ProcessorGroup {
        ProcessorGroup::start(
            self.log.clone(),
            self.offsets.clone(),
            store,
            processor_config(),
        )
    }

    /// Wait until every partition's checkpoint reached its high watermark.
    async fn drained(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let done = (0..self.log.partitions()).all(|p| {
                self.offsets.load(GROUP, p).unwrap() == self.log.high_watermark(p).unwrap()
            });
            if done {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "processor did not drain in time"
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

fn key() -> ResourceKey {
    ResourceKey::new(Ulid::new(), NaiveDate::from_ymd_opt(2024, 11, 5).unwrap())
}

async fn bookings(engine: &Engine, key: ResourceKey) -> Vec<(Ulid, Interval)> {
    let filter = BookingFilter {
        resource_ids: vec![key.resource_id],
        days: vec![key.day],
        ..Default::default()
    };
    engine
        .list_bookings(&filter)
        .await
        .into_iter()
        .map(|b| (b.record.owner_id, b.record.interval))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_key_commands_apply_in_submission_order() {
    let h = Harness::new("submission_order", 3);
    let engine = h.engine("store.wal");
    let group = h.start(engine.clone());

    // For each key the first writer must win the overlapping range.
    let mut expected = Vec::new();
    for _ in 0..12 {
        let k = key();
        let (first, second) = (Ulid::new(), Ulid::new());
        h.router
            .submit(&Command::create(k, first, 0, 60).unwrap())
            .await
            .unwrap();
        h.router
            .submit(&Command::create(k, second, 30, 90).unwrap())
            .await
            .unwrap();
        expected.push((k, first));
    }
    h.drained().await;

    for (k, first) in expected {
        assert_eq!(bookings(&engine, k).await, vec![(first, Interval::new(0, 60))]);
    }
    assert_eq!(group.shutdown(Duration::from_secs(2)).await, ShutdownOutcome::Clean);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn create_then_delete_by_id() {
    let h = Harness::new("create_delete", 2);
    let engine = h.engine("store.wal");
    let group = h.start(engine.clone());

    let k = key();
    let owner = Ulid::new();
    h.router
        .submit(&Command::create(k, owner, 600, 660).unwrap())
        .await
        .unwrap();
    h.drained().await;

    let booked = engine.list_bookings(&BookingFilter::default()).await;
    assert_eq!(booked.len(), 1);
    let id = booked[0].record.id;

    assert_ok!(h.router.submit(&Command::delete(k, id, owner)).await);
    // Second delete of the same id is a NotFound, not an error
    assert_ok!(h.router.submit(&Command::delete(k, id, owner)).await);
    h.drained().await;

    assert!(bookings(&engine, k).await.is_empty());
    group.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crash_and_redelivery_keep_order() {
    let h = Harness::new("redelivery", 3);
    let k = key();
    let (a_owner, b_owner) = (Ulid::new(), Ulid::new());
    let a = Command::create(k, a_owner, 0, 60).unwrap();
    let b = Command::create(k, b_owner, 30, 90).unwrap();
    let partition = h.router.partition_of(&a);

    let engine = h.engine("before_crash.wal");
    let group = h.start(engine.clone());
    h.router.submit(&a).await.unwrap();
    h.router.submit(&b).await.unwrap();
    h.drained().await;
    group.shutdown(Duration::from_secs(2)).await;
    assert_eq!(bookings(&engine, k).await, vec![(a_owner, Interval::new(0, 60))]);

    // Crash that lost both the checkpoint and the store: everything is redelivered.
    h.offsets.commit(GROUP, partition, 0).unwrap();
    let rebuilt = h.engine("after_crash.wal");
    let group = h.start(rebuilt.clone());
    h.drained().await;
    assert_eq!(bookings(&rebuilt, k).await, vec![(a_owner, Interval::new(0, 60))]);
    group.shutdown(Duration::from_secs(2)).await;

    // Crash that lost only the checkpoint: redelivered creates are rejected.
    h.offsets.commit(GROUP, partition, 0).unwrap();
    let group = h.start(rebuilt.clone());
    h.drained().await;
    assert_eq!(bookings(&rebuilt, k).await, vec![(a_owner, Interval::new(0, 60))]);
    group.shutdown(Duration::from_secs(2)).await;
}

/// Fails the first `failures` calls with a WAL error, then delegates.
struct FlakyStore {
    inner: Arc<Engine>,
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyStore {
    fn fail(&self) -> Result<(), EngineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match left {
            Ok(_) => Err(EngineError::WalError("injected".into())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl BookingStore for FlakyStore {
    async fn create_booking(
        &self,
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    ) -> Result<CreateOutcome, EngineError> {
        self.fail()?;
        self.inner.create_booking(key, owner_id, interval).await
    }

    async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError> {
        self.fail()?;
        self.inner.delete_booking(key, booking_id, owner_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transient_store_error_withholds_checkpoint_and_retries() {
    let h = Harness::new("transient", 1);
    let engine = h.engine("store.wal");
    let flaky = Arc::new(FlakyStore {
        inner: engine.clone(),
        failures: AtomicUsize::new(3),
        calls: AtomicUsize::new(0),
    });

    let k = key();
    let (a_owner, b_owner) = (Ulid::new(), Ulid::new());
    // Both records are in the log before the processor starts, so they share a batch.
    h.router
        .submit(&Command::create(k, a_owner, 0, 60).unwrap())
        .await
        .unwrap();
    h.router
        .submit(&Command::create(k, b_owner, 30, 90).unwrap())
        .await
        .unwrap();

    let group = h.start(flaky.clone());
    h.drained().await;

    assert_eq!(bookings(&engine, k).await, vec![(a_owner, Interval::new(0, 60))]);
    assert_eq!(h.offsets.load(GROUP, 0).unwrap(), 2);
    // Three failed attempts on A, then A and B.
    assert_eq!(flaky.calls.load(Ordering::SeqCst), 5);
    group.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn undecodable_record_is_skipped() {
    let h = Harness::new("undecodable", 1);
    let engine = h.engine("store.wal");
    let k = key();

    h.log
        .append(
            0,
            Record {
                key: Bytes::copy_from_slice(&codec::encode_key(&k)),
                value: Bytes::from_static(&[42, 0, 0]),
            },
        )
        .await
        .unwrap();
    h.log
        .append(
            0,
            Record {
                key: Bytes::from_static(b"short"),
                value: Bytes::new(),
            },
        )
        .await
        .unwrap();
    let owner = Ulid::new();
    h.router
        .submit(&Command::create(k, owner, 120, 150).unwrap())
        .await
        .unwrap();

    let group = h.start(engine.clone());
    h.drained().await;

    assert_eq!(h.offsets.load(GROUP, 0).unwrap(), 3);
    assert_eq!(bookings(&engine, k).await, vec![(owner, Interval::new(120, 150))]);
    group.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn idle_group_polls_and_stops_cleanly() {
    let h = Harness::new("idle_shutdown", 4);
    let group = h.start(h.engine("store.wal"));
    assert_eq!(group.assignment().len(), 2);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while group.state(3) != Some(PartitionState::Polling) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let states: Vec<_> = (0..4).map(|p| group.state(p)).collect();
    assert!(states.iter().all(|s| s.is_some()));
    assert_eq!(group.shutdown(Duration::from_secs(2)).await, ShutdownOutcome::Clean);
}

/// Never finishes a create; deletes go straight through.
struct StuckStore {
    inner: Arc<Engine>,
}

#[async_trait]
impl BookingStore for StuckStore {
    async fn create_booking(
        &self,
        _key: ResourceKey,
        _owner_id: Ulid,
        _interval: Interval,
    ) -> Result<CreateOutcome, EngineError> {
        std::future::pending().await
    }

    async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError> {
        self.inner.delete_booking(key, booking_id, owner_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stuck_apply_is_aborted_after_grace() {
    let h = Harness::new("forced_shutdown", 1);
    let k = key();
    h.router
        .submit(&Command::create(k, Ulid::new(), 0, 30).unwrap())
        .await
        .unwrap();

    let group = h.start(Arc::new(StuckStore {
        inner: h.engine("store.wal"),
    }));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while group.state(0) != Some(PartitionState::Applying(0)) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(
        group.shutdown(Duration::from_millis(50)).await,
        ShutdownOutcome::Forced { aborted: 1 }
    );
    assert_eq!(h.offsets.load(GROUP, 0).unwrap(), 0);
}

/// Parks the second create until released, then delegates.
struct GatedStore {
    inner: Arc<Engine>,
    calls: AtomicUsize,
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl BookingStore for GatedStore {
    async fn create_booking(
        &self,
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    ) -> Result<CreateOutcome, EngineError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) == 1 {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.create_booking(key, owner_id, interval).await
    }

    async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError> {
        self.inner.delete_booking(key, booking_id, owner_id).await
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_mid_batch_checkpoints_after_last_applied() {
    let h = Harness::new("cancel_mid_batch", 1);
    let engine = h.engine("store.wal");
    let gated = Arc::new(GatedStore {
        inner: engine.clone(),
        calls: AtomicUsize::new(0),
        entered: Notify::new(),
        release: Notify::new(),
    });

    // All three are in the log before the processor starts, so they share a batch.
    let k = key();
    for start in [0, 30, 60] {
        h.router
            .submit(&Command::create(k, Ulid::new(), start, start + 30).unwrap())
            .await
            .unwrap();
    }

    let group = h.start(gated.clone());
    gated.entered.notified().await;
    let stopping = tokio::spawn(group.shutdown(Duration::from_secs(2)));
    tokio::time::sleep(Duration::from_millis(50)).await;
    gated.release.notify_one();

    assert_eq!(stopping.await.unwrap(), ShutdownOutcome::Clean);
    // The second record finished; the third was never started.
    assert_eq!(gated.calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.offsets.load(GROUP, 0).unwrap(), 2);
    assert_eq!(bookings(&engine, k).await.len(), 2);
}

#[tokio::test]
async fn failed_delivery_never_reaches_the_store() {
    let h = Harness::new("unavailable", 2);
    let engine = h.engine("store.wal");
    h.log.close();

    let k = key();
    let result = h
        .router
        .submit(&Command::create(k, Ulid::new(), 0, 30).unwrap())
        .await;
    let failure = assert_err!(result);
    assert!(matches!(failure, DeliveryFailure::Unavailable(_)));
    assert!(engine.get_log(&k).is_none());
}
