use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{CommandLog, LogEntry, OffsetStore};
use crate::codec;
use crate::config::ProcessorConfig;
use crate::engine::{BookingStore, EngineError};
use crate::model::*;
use crate::observability::{
    APPLY_DURATION_SECONDS, BATCH_SIZE, DECODE_FAILURES_TOTAL, RECORDS_APPLIED_TOTAL,
    TRANSIENT_RETRIES_TOTAL,
};

/// Where a partition loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Idle,
    Polling,
    /// Applying the record at this offset.
    Applying(u64),
    Checkpointing,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every loop finished its record and checkpoint within the grace period.
    Clean,
    /// Worker tasks still running at the deadline were aborted.
    Forced { aborted: usize },
}

/// Deal partitions out to workers: worker `w` owns every `p` with `p % workers == w`.
pub fn assign_partitions(partitions: u32, workers: usize) -> Vec<Vec<u32>> {
    let workers = workers.max(1);
    let mut assignment = vec![Vec::new(); workers];
    for p in 0..partitions {
        assignment[p as usize % workers].push(p);
    }
    assignment
}

struct Shared {
    log: Arc<CommandLog>,
    offsets: Arc<OffsetStore>,
    store: Arc<dyn BookingStore>,
    config: ProcessorConfig,
    states: DashMap<u32, PartitionState>,
    cancel: CancellationToken,
}

impl Shared {
    fn set_state(&self, partition: u32, state: PartitionState) {
        self.states.insert(partition, state);
    }

    /// Sleep for the retry backoff. Returns false if cancelled meanwhile.
    async fn backoff(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(self.config.retry_backoff) => true,
        }
    }
}

/// A bounded set of workers consuming the command log into a `BookingStore`.
///
/// Each partition has exactly one loop, applying its records strictly in
/// offset order and checkpointing after each applied batch. A crash between
/// apply and checkpoint redelivers the batch: processing is at-least-once.
pub struct ProcessorGroup {
    shared: Arc<Shared>,
    assignment: Vec<Vec<u32>>,
    workers: Vec<JoinHandle<()>>,
}

impl ProcessorGroup {
    pub fn start(
        log: Arc<CommandLog>,
        offsets: Arc<OffsetStore>,
        store: Arc<dyn BookingStore>,
        config: ProcessorConfig,
    ) -> Self {
        let assignment = assign_partitions(log.partitions(), config.workers);
        let states = DashMap::new();
        for p in 0..log.partitions() {
            states.insert(p, PartitionState::Idle);
        }
        let shared = Arc::new(Shared {
            log,
            offsets,
            store,
            config,
            states,
            cancel: CancellationToken::new(),
        });

        let workers = assignment
            .iter()
            .enumerate()
            .filter(|(_, owned)| !owned.is_empty())
            .map(|(worker, owned)| {
                let shared = shared.clone();
                let owned = owned.clone();
                info!("worker {worker} owns partitions {owned:?}");
                tokio::spawn(async move {
                    join_all(owned.into_iter().map(|p| run_partition(shared.clone(), p))).await;
                })
            })
            .collect();

        info!(
            "processor group {:?} started: {} partitions, {} workers",
            shared.config.consumer_group,
            shared.log.partitions(),
            assignment.iter().filter(|o| !o.is_empty()).count()
        );
        Self {
            shared,
            assignment,
            workers,
        }
    }

    /// Partitions owned by each worker, indexed by worker.
    pub fn assignment(&self) -> &[Vec<u32>] {
        &self.assignment
    }

    pub fn state(&self, partition: u32) -> Option<PartitionState> {
        self.shared.states.get(&partition).map(|s| *s)
    }

    /// Signal every loop to stop after its current record and checkpoint,
    /// then wait up to `grace` before aborting what is left.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownOutcome {
        info!("processor group shutting down (grace {grace:?})");
        self.shared.cancel.cancel();

        let outcome =
            match tokio::time::timeout(grace, join_all(self.workers.iter_mut())).await {
                Ok(_) => ShutdownOutcome::Clean,
                Err(_) => {
                    let mut aborted = 0;
                    for handle in &self.workers {
                        if !handle.is_finished() {
                            handle.abort();
                            aborted += 1;
                        }
                    }
                    ShutdownOutcome::Forced { aborted }
                }
            };

        for mut state in self.shared.states.iter_mut() {
            *state = PartitionState::Stopped;
        }
        match outcome {
            ShutdownOutcome::Clean => info!("processor group stopped cleanly"),
            ShutdownOutcome::Forced { aborted } => {
                warn!("processor group forced down: {aborted} workers aborted")
            }
        }
        outcome
    }
}

async fn run_partition(shared: Arc<Shared>, partition: u32) {
    let group = shared.config.consumer_group.as_str();

    let mut position = loop {
        match shared.offsets.load(group, partition) {
            Ok(offset) => break offset,
            Err(e) => {
                error!("partition {partition}: cannot load checkpoint: {e}");
                if !shared.backoff().await {
                    shared.set_state(partition, PartitionState::Stopped);
                    return;
                }
            }
        }
    };
    info!("partition {partition}: consuming from offset {position}");

    while !shared.cancel.is_cancelled() {
        shared.set_state(partition, PartitionState::Polling);
        let polled = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            polled = shared.log.poll(
                partition,
                position,
                shared.config.max_batch,
                shared.config.poll_timeout,
            ) => polled,
        };
        let batch = match polled {
            Ok(batch) if batch.is_empty() => continue,
            Ok(batch) => batch,
            Err(e) => {
                warn!("partition {partition}: poll failed: {e}");
                if !shared.backoff().await {
                    break;
                }
                continue;
            }
        };
        metrics::histogram!(BATCH_SIZE).record(batch.len() as f64);

        let mut next = position;
        let mut transient: Option<EngineError> = None;
        for entry in &batch {
            shared.set_state(partition, PartitionState::Applying(entry.offset));
            match apply_entry(shared.store.as_ref(), entry).await {
                Ok(()) => next = entry.offset + 1,
                Err(e) => {
                    transient = Some(e);
                    break;
                }
            }
            if shared.cancel.is_cancelled() {
                break;
            }
        }

        if let Some(e) = transient {
            // Nothing from this batch is checkpointed; it is redelivered from `position`.
            metrics::counter!(TRANSIENT_RETRIES_TOTAL).increment(1);
            warn!(
                "partition {partition}: transient store error, retrying from offset {position}: {e}"
            );
            if !shared.backoff().await {
                break;
            }
            continue;
        }

        shared.set_state(partition, PartitionState::Checkpointing);
        if let Err(e) = shared.offsets.commit(group, partition, next) {
            // The records are applied; a later commit covers them.
            error!("partition {partition}: checkpoint at {next} failed: {e}");
        }
        position = next;
    }

    shared.set_state(partition, PartitionState::Stopped);
    info!("partition {partition}: stopped at offset {position}");
}

/// Decode and apply one record. Only transient store errors come back as `Err`;
/// undecodable records and permanent store errors are logged and count as handled.
pub async fn apply_entry(store: &dyn BookingStore, entry: &LogEntry) -> Result<(), EngineError> {
    let cmd = match codec::decode_command(&entry.key, &entry.value) {
        Ok(cmd) => cmd,
        Err(e) => {
            metrics::counter!(DECODE_FAILURES_TOTAL).increment(1);
            warn!(
                "partition {} offset {}: skipping undecodable record: {e}",
                entry.partition, entry.offset
            );
            return Ok(());
        }
    };

    let label = cmd.label();
    let start = Instant::now();
    let result = dispatch(store, cmd).await;
    metrics::histogram!(APPLY_DURATION_SECONDS, "command" => label)
        .record(start.elapsed().as_secs_f64());

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) if e.is_transient() => return Err(e),
        Err(e) => {
            warn!(
                "partition {} offset {}: {label} failed permanently: {e}",
                entry.partition, entry.offset
            );
            "error"
        }
    };
    metrics::counter!(RECORDS_APPLIED_TOTAL, "command" => label, "outcome" => outcome)
        .increment(1);
    debug!(
        "partition {} offset {}: {label} -> {outcome}",
        entry.partition, entry.offset
    );
    Ok(())
}

async fn dispatch(store: &dyn BookingStore, cmd: Command) -> Result<&'static str, EngineError> {
    match cmd {
        Command::CreateBooking {
            key,
            owner_id,
            interval,
        } => Ok(match store.create_booking(key, owner_id, interval).await? {
            CreateOutcome::Admitted(_) => "admitted",
            CreateOutcome::Rejected(_) => "rejected",
        }),
        Command::DeleteBooking {
            key,
            booking_id,
            owner_id,
        } => Ok(match store.delete_booking(key, booking_id, owner_id).await? {
            DeleteOutcome::Deleted(_) => "deleted",
            DeleteOutcome::NotFound => "not_found",
            DeleteOutcome::OwnerMismatch { .. } => "owner_mismatch",
        }),
    }
}
