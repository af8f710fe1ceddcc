use crate::limits::MAX_BOOKINGS_PER_KEY;
use crate::model::*;

use super::EngineError;

pub(crate) fn validate_interval(interval: &Interval) -> Result<(), EngineError> {
    interval.validate()?;
    Ok(())
}

pub(crate) fn check_capacity(log: &BookingLog) -> Result<(), EngineError> {
    if log.len() >= MAX_BOOKINGS_PER_KEY {
        return Err(EngineError::LimitExceeded("too many bookings on resource-day"));
    }
    Ok(())
}

/// First existing record (by start) overlapping `interval`, if any.
pub(crate) fn first_conflict(log: &BookingLog, interval: &Interval) -> Option<Conflict> {
    log.overlapping(interval).next().map(|r| Conflict {
        existing: r.id,
        existing_interval: r.interval,
    })
}
