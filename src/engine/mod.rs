mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;
mod store;

pub use availability::{
    AvailableSlots, SlotParams, compute_available_slots, merge_overlapping, normalize_duration,
};
pub use error::EngineError;
pub use store::BookingStore;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::StoreConfig;
use crate::model::*;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::{Wal, WriterLock};

pub type SharedBookingLog = Arc<RwLock<BookingLog>>;

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    StaleFrames {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Event, oneshot::Sender<io::Result<()>>);

/// Owns the store WAL. Appends that queue up while a sync is in progress
/// are committed together with a single fsync. A compaction or stats request
/// that arrives mid-batch runs after the batch is durable.
async fn store_writer(mut wal: Wal<Event>, mut rx: mpsc::Receiver<WalCommand>) {
    let mut carried: Option<WalCommand> = None;
    loop {
        let cmd = match carried.take() {
            Some(cmd) => cmd,
            None => match rx.recv().await {
                Some(cmd) => cmd,
                None => break,
            },
        };
        match cmd {
            WalCommand::Append { event, response } => {
                let mut pending = vec![(event, response)];
                while let Ok(next) = rx.try_recv() {
                    match next {
                        WalCommand::Append { event, response } => pending.push((event, response)),
                        other => {
                            carried = Some(other);
                            break;
                        }
                    }
                }
                group_commit(&mut wal, pending);
            }
            WalCommand::Compact { events, response } => {
                let _ = response.send(wal.rewrite(&events));
            }
            WalCommand::StaleFrames { response } => {
                let _ = response.send(wal.stale_frames());
            }
        }
    }
    debug!("store WAL writer stopped");
}

fn group_commit(wal: &mut Wal<Event>, pending: Vec<PendingAppend>) {
    let started = Instant::now();
    let result = wal.commit(pending.iter().map(|(event, _)| event));
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE, "log" => "store").record(pending.len() as f64);
    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS, "log" => "store")
        .record(started.elapsed().as_secs_f64());

    if let Err(e) = &result {
        error!("store WAL commit of {} events failed: {e}", pending.len());
    }
    for (_, ack) in pending {
        let shared = result
            .as_ref()
            .map(|_| ())
            .map_err(|e| io::Error::new(e.kind(), e.to_string()));
        let _ = ack.send(shared);
    }
}

/// Apply an event to a log (caller holds the lock).
fn apply_to_log(log: &mut BookingLog, event: &Event) {
    match event {
        Event::BookingAdmitted { record, .. } => log.insert(*record),
        Event::BookingDeleted { id, .. } => {
            log.remove(*id);
        }
    }
}

/// The booking store: one ordered log per resource-day, made durable through
/// the group-commit WAL before any change becomes visible.
pub struct Engine {
    pub(super) logs: DashMap<ResourceKey, SharedBookingLog>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: StoreConfig,
    /// Mutations hold it shared; compaction takes it exclusively so the
    /// snapshot it writes can't miss an in-flight append.
    pub(super) compaction_gate: RwLock<()>,
    _lock: WriterLock,
}

impl Engine {
    /// Recover the WAL at `wal_path` and start its writer task.
    /// Fails with `WouldBlock` if another store already has the WAL open.
    /// Must be called from within a tokio runtime.
    pub fn new(wal_path: PathBuf, config: StoreConfig) -> io::Result<Self> {
        let lock = WriterLock::beside(&wal_path)?;
        let (wal, events) = Wal::<Event>::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(store_writer(wal, wal_rx));

        // Rebuild unshared first; logs are only wrapped once replay is done.
        let mut rebuilt: HashMap<ResourceKey, BookingLog> = HashMap::new();
        let mut skipped = 0usize;
        for event in &events {
            let key = *event.key();
            let log = rebuilt.entry(key).or_insert_with(|| BookingLog::new(key));
            if let Event::BookingAdmitted { record, .. } = event
                && let Some(existing) = log.overlapping(&record.interval).next()
            {
                warn!(
                    "replay: skipping booking {} on {key}: overlaps {}",
                    record.id, existing.id
                );
                skipped += 1;
                continue;
            }
            apply_to_log(log, event);
        }
        if skipped > 0 {
            warn!("replay skipped {skipped} overlapping admissions");
        }

        let logs = DashMap::with_capacity(rebuilt.len());
        for (key, log) in rebuilt {
            logs.insert(key, Arc::new(RwLock::new(log)));
        }
        info!(
            "booking store replayed {} events into {} resource-days from {}",
            events.len(),
            logs.len(),
            wal_path.display()
        );

        Ok(Self {
            logs,
            wal_tx,
            config,
            compaction_gate: RwLock::new(()),
            _lock: lock,
        })
    }

    /// Hand a command to the WAL writer and wait for its reply.
    pub(super) async fn ask_writer<R>(
        &self,
        build: impl FnOnce(oneshot::Sender<R>) -> WalCommand,
    ) -> Result<R, EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(build(tx))
            .await
            .map_err(|_| EngineError::WalError("store WAL writer is gone".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("store WAL writer dropped the request".into()))
    }

    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        self.ask_writer(|response| WalCommand::Append {
            event: event.clone(),
            response,
        })
        .await?
        .map_err(|e| EngineError::WalError(e.to_string()))
    }

    pub fn get_log(&self, key: &ResourceKey) -> Option<SharedBookingLog> {
        self.logs.get(key).map(|e| e.value().clone())
    }

    /// Get the log for `key`, creating an empty one if absent.
    pub(super) fn log_or_create(&self, key: ResourceKey) -> SharedBookingLog {
        self.logs
            .entry(key)
            .or_insert_with(|| Arc::new(RwLock::new(BookingLog::new(key))))
            .value()
            .clone()
    }

    /// WAL-append then apply. Nothing is applied if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        log: &mut BookingLog,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_log(log, event);
        Ok(())
    }

    /// Snapshot of every log handle, for read paths that scan keys.
    pub(super) fn all_logs(&self) -> Vec<(ResourceKey, SharedBookingLog)> {
        self.logs
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}
