use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::{debug, warn};

use crate::broker::{CommandLog, Record};
use crate::codec;
use crate::limits::MAX_RECORD_BYTES;
use crate::model::Command;
use crate::observability::{
    COMMANDS_SUBMITTED_TOTAL, DELIVERY_FAILURES_TOTAL, SUBMIT_DURATION_SECONDS,
};

/// Where a command landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub partition: u32,
    pub offset: u64,
}

/// The command was not acknowledged. After `Timeout` it may still have been
/// appended; resubmitting is the caller's call.
#[derive(Debug)]
pub enum DeliveryFailure {
    Timeout(Duration),
    Unavailable(String),
    Encode(String),
}

impl DeliveryFailure {
    fn reason(&self) -> &'static str {
        match self {
            DeliveryFailure::Timeout(_) => "timeout",
            DeliveryFailure::Unavailable(_) => "unavailable",
            DeliveryFailure::Encode(_) => "encode",
        }
    }
}

impl std::fmt::Display for DeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryFailure::Timeout(t) => write!(f, "no acknowledgement within {t:?}"),
            DeliveryFailure::Unavailable(e) => write!(f, "command log unavailable: {e}"),
            DeliveryFailure::Encode(e) => write!(f, "cannot encode command: {e}"),
        }
    }
}

impl std::error::Error for DeliveryFailure {}

/// Publishes commands keyed by resource-day. Same key, same partition,
/// in submission order. Never retries.
#[derive(Clone)]
pub struct CommandRouter {
    log: Arc<CommandLog>,
    timeout: Duration,
}

impl CommandRouter {
    pub fn new(log: Arc<CommandLog>, timeout: Duration) -> Self {
        Self { log, timeout }
    }

    pub fn partition_of(&self, cmd: &Command) -> u32 {
        codec::partition_for(&codec::encode_key(cmd.key()), self.log.partitions())
    }

    pub async fn submit(&self, cmd: &Command) -> Result<Ack, DeliveryFailure> {
        let start = Instant::now();
        let result = self.deliver(cmd).await;
        metrics::histogram!(SUBMIT_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        match &result {
            Ok(ack) => {
                metrics::counter!(COMMANDS_SUBMITTED_TOTAL, "command" => cmd.label()).increment(1);
                debug!(
                    "{} for {} at {}:{}",
                    cmd.label(),
                    cmd.key(),
                    ack.partition,
                    ack.offset
                );
            }
            Err(e) => {
                metrics::counter!(DELIVERY_FAILURES_TOTAL, "reason" => e.reason()).increment(1);
                warn!("{} for {} not delivered: {e}", cmd.label(), cmd.key());
            }
        }
        result
    }

    async fn deliver(&self, cmd: &Command) -> Result<Ack, DeliveryFailure> {
        let key = codec::encode_key(cmd.key());
        let value = codec::encode_command(cmd).map_err(|e| DeliveryFailure::Encode(e.to_string()))?;
        if value.len() > MAX_RECORD_BYTES {
            return Err(DeliveryFailure::Encode(format!(
                "{} bytes exceeds record limit of {MAX_RECORD_BYTES}",
                value.len()
            )));
        }

        let partition = codec::partition_for(&key, self.log.partitions());
        let record = Record {
            key: Bytes::copy_from_slice(&key),
            value,
        };
        match tokio::time::timeout(self.timeout, self.log.append(partition, record)).await {
            Ok(Ok(offset)) => Ok(Ack { partition, offset }),
            Ok(Err(e)) => Err(DeliveryFailure::Unavailable(e.to_string())),
            Err(_) => Err(DeliveryFailure::Timeout(self.timeout)),
        }
    }
}
