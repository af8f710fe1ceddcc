use tracing::{debug, warn};
use ulid::Ulid;

use crate::config::OwnershipPolicy;
use crate::model::*;
use crate::observability::{BOOKINGS_ADMITTED_TOTAL, BOOKINGS_DELETED_TOTAL, BOOKINGS_REJECTED_TOTAL};

use super::conflict::{check_capacity, first_conflict, validate_interval};
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// Admit `interval` on `key` iff nothing already booked there overlaps it.
    ///
    /// The overlap check and the durable append run under the key's write lock,
    /// so concurrent callers on one key are serialized and can never both win.
    pub async fn create_booking(
        &self,
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    ) -> Result<CreateOutcome, EngineError> {
        validate_interval(&interval)?;

        let _gate = self.compaction_gate.read().await;
        let log = self.log_or_create(key);
        let mut guard = log.write().await;

        if let Some(conflict) = first_conflict(&guard, &interval) {
            debug!(
                "rejected [{}, {}) on {key}: overlaps {}",
                interval.start, interval.end, conflict.existing
            );
            metrics::counter!(BOOKINGS_REJECTED_TOTAL).increment(1);
            return Ok(CreateOutcome::Rejected(conflict));
        }
        check_capacity(&guard)?;

        let record = BookingRecord {
            id: Ulid::new(),
            owner_id,
            interval,
        };
        let event = Event::BookingAdmitted { key, record };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(BOOKINGS_ADMITTED_TOTAL).increment(1);
        Ok(CreateOutcome::Admitted(record))
    }

    /// Remove a booking by id. A missing key or id is `NotFound`, every time.
    pub async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let Some(log) = self.get_log(&key) else {
            return Ok(DeleteOutcome::NotFound);
        };
        let mut guard = log.write().await;

        let Some(record) = guard.get(booking_id).copied() else {
            return Ok(DeleteOutcome::NotFound);
        };
        if self.config.ownership == OwnershipPolicy::Enforce && record.owner_id != owner_id {
            warn!("delete of {booking_id} on {key} by {owner_id} refused: owned by {}", record.owner_id);
            return Ok(DeleteOutcome::OwnerMismatch {
                owner_id: record.owner_id,
            });
        }

        let event = Event::BookingDeleted { key, id: booking_id };
        self.persist_and_apply(&mut guard, &event).await?;

        metrics::counter!(BOOKINGS_DELETED_TOTAL).increment(1);
        Ok(DeleteOutcome::Deleted(record))
    }

    /// Rewrite the WAL as one `BookingAdmitted` per live record.
    /// Returns the number of events written.
    pub async fn compact_wal(&self) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.write().await;

        let mut events = Vec::new();
        for (key, log) in self.all_logs() {
            let guard = log.read().await;
            events.extend(
                guard
                    .records
                    .iter()
                    .map(|record| Event::BookingAdmitted { key, record: *record }),
            );
        }
        let written = events.len();

        self.ask_writer(|response| WalCommand::Compact { events, response })
            .await?
            .map_err(|e| EngineError::WalError(e.to_string()))?;

        // Empty logs carry nothing across a restart; drop them here too.
        self.logs.retain(|_, log| log.try_read().map(|g| !g.is_empty()).unwrap_or(true));
        Ok(written)
    }

    /// WAL frames not written by the last compaction, including any
    /// recovered at startup.
    pub async fn wal_stale_frames(&self) -> u64 {
        self.ask_writer(|response| WalCommand::StaleFrames { response })
            .await
            .unwrap_or(0)
    }
}
