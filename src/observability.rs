use std::net::SocketAddr;

// ── Router ──────────────────────────────────────────────────────

/// Counter: commands acknowledged by the command log. Labels: command.
pub const COMMANDS_SUBMITTED_TOTAL: &str = "slotguard_commands_submitted_total";

/// Counter: submissions that failed. Labels: reason.
pub const DELIVERY_FAILURES_TOTAL: &str = "slotguard_delivery_failures_total";

/// Histogram: submit latency in seconds, until the durable ack.
pub const SUBMIT_DURATION_SECONDS: &str = "slotguard_submit_duration_seconds";

// ── Processor ───────────────────────────────────────────────────

/// Counter: records applied to the store. Labels: command, outcome.
pub const RECORDS_APPLIED_TOTAL: &str = "slotguard_records_applied_total";

/// Counter: records skipped because they could not be decoded.
pub const DECODE_FAILURES_TOTAL: &str = "slotguard_decode_failures_total";

/// Counter: batches rewound after a transient store error.
pub const TRANSIENT_RETRIES_TOTAL: &str = "slotguard_transient_retries_total";

/// Histogram: store call duration in seconds. Labels: command.
pub const APPLY_DURATION_SECONDS: &str = "slotguard_apply_duration_seconds";

/// Histogram: records per polled batch.
pub const BATCH_SIZE: &str = "slotguard_batch_size";

// ── Store ───────────────────────────────────────────────────────

pub const BOOKINGS_ADMITTED_TOTAL: &str = "slotguard_bookings_admitted_total";
pub const BOOKINGS_REJECTED_TOTAL: &str = "slotguard_bookings_rejected_total";
pub const BOOKINGS_DELETED_TOTAL: &str = "slotguard_bookings_deleted_total";

/// Histogram: group-commit flush duration in seconds. Labels: log.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotguard_wal_flush_duration_seconds";

/// Histogram: group-commit batch size (entries per flush). Labels: log.
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotguard_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
