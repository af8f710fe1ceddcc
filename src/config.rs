use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::engine::SlotParams;
use crate::limits::{MAX_PARTITIONS, MAX_POLL_BATCH};

/// Whether `delete_booking` checks the requester against the record's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OwnershipPolicy {
    /// Remove by id; the request layer owns the check.
    #[default]
    Ignore,
    /// Leave the record in place and report `OwnerMismatch`.
    Enforce,
}

impl FromStr for OwnershipPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ignore" => Ok(OwnershipPolicy::Ignore),
            "enforce" => Ok(OwnershipPolicy::Enforce),
            other => Err(format!("unknown ownership policy: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreConfig {
    pub ownership: OwnershipPolicy,
    pub slots: SlotParams,
}

#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Worker tasks; partitions are dealt out round-robin.
    pub workers: usize,
    pub consumer_group: String,
    pub poll_timeout: Duration,
    pub max_batch: usize,
    /// Pause before re-polling a batch that hit a transient store error.
    pub retry_backoff: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            workers: 3,
            consumer_group: "booking-processor".into(),
            poll_timeout: Duration::from_millis(500),
            max_batch: 500,
            retry_backoff: Duration::from_millis(200),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub partitions: u32,
    pub submit_timeout: Duration,
    pub shutdown_grace: Duration,
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub metrics_port: Option<u16>,
    pub store: StoreConfig,
    pub processor: ProcessorConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            partitions: 3,
            submit_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(30),
            metrics_port: None,
            store: StoreConfig::default(),
            processor: ProcessorConfig::default(),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    lookup(name).and_then(|s| s.trim().parse().ok())
}

impl Config {
    /// Read `SLOTGUARD_*` variables; anything missing or unparsable keeps its default.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Config::default();
        let millis = |name: &str| parsed::<u64>(&lookup, name).map(Duration::from_millis);

        let slots = SlotParams {
            step: parsed::<u16>(&lookup, "SLOTGUARD_SLOT_STEP")
                .filter(|v| *v > 0)
                .unwrap_or(d.store.slots.step),
            slice: parsed::<u16>(&lookup, "SLOTGUARD_SLOT_SLICE")
                .filter(|v| *v > 0)
                .unwrap_or(d.store.slots.slice),
            offset: parsed(&lookup, "SLOTGUARD_SLOT_OFFSET").unwrap_or(d.store.slots.offset),
        };

        Self {
            data_dir: lookup("SLOTGUARD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            partitions: parsed(&lookup, "SLOTGUARD_PARTITIONS")
                .unwrap_or(d.partitions)
                .clamp(1, MAX_PARTITIONS),
            submit_timeout: millis("SLOTGUARD_SUBMIT_TIMEOUT_MS").unwrap_or(d.submit_timeout),
            shutdown_grace: millis("SLOTGUARD_SHUTDOWN_GRACE_MS").unwrap_or(d.shutdown_grace),
            compact_threshold: parsed(&lookup, "SLOTGUARD_COMPACT_THRESHOLD")
                .unwrap_or(d.compact_threshold),
            compact_interval: millis("SLOTGUARD_COMPACT_INTERVAL_MS")
                .unwrap_or(d.compact_interval),
            metrics_port: parsed(&lookup, "SLOTGUARD_METRICS_PORT"),
            store: StoreConfig {
                ownership: parsed(&lookup, "SLOTGUARD_OWNERSHIP").unwrap_or(d.store.ownership),
                slots,
            },
            processor: ProcessorConfig {
                workers: parsed(&lookup, "SLOTGUARD_WORKERS")
                    .unwrap_or(d.processor.workers)
                    .max(1),
                consumer_group: lookup("SLOTGUARD_CONSUMER_GROUP")
                    .filter(|g| !g.trim().is_empty())
                    .unwrap_or(d.processor.consumer_group),
                poll_timeout: millis("SLOTGUARD_POLL_TIMEOUT_MS")
                    .unwrap_or(d.processor.poll_timeout),
                max_batch: parsed(&lookup, "SLOTGUARD_MAX_BATCH")
                    .unwrap_or(d.processor.max_batch)
                    .clamp(1, MAX_POLL_BATCH),
                retry_backoff: millis("SLOTGUARD_RETRY_BACKOFF_MS")
                    .unwrap_or(d.processor.retry_backoff),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }

    pub fn command_log_dir(&self) -> PathBuf {
        self.data_dir.join("commands")
    }

    pub fn offsets_dir(&self) -> PathBuf {
        self.data_dir.join("offsets")
    }
}
