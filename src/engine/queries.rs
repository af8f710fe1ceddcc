use ulid::Ulid;

use crate::limits::MAX_PAGE_SIZE;
use crate::model::*;

use super::Engine;
use super::availability::compute_available_slots;

impl Engine {
    /// Open slots on `key` for `duration` minutes, using the store's slot grid.
    pub async fn available_slots(&self, key: &ResourceKey, duration: Minute) -> Vec<Interval> {
        let existing = self.booked_intervals(key).await;
        compute_available_slots(&existing, duration, &self.config.slots).collect()
    }

    pub async fn booked_intervals(&self, key: &ResourceKey) -> Vec<Interval> {
        match self.get_log(key) {
            Some(log) => log.read().await.intervals(),
            None => Vec::new(),
        }
    }

    pub async fn get_booking(&self, key: &ResourceKey, booking_id: Ulid) -> Option<BookingRecord> {
        let log = self.get_log(key)?;
        let guard = log.read().await;
        guard.get(booking_id).copied()
    }

    /// Bookings matching every non-empty list of `filter`,
    /// ordered by `(resource_id, day)` then start.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<KeyedBooking> {
        let mut keys: Vec<_> = self
            .all_logs()
            .into_iter()
            .filter(|(key, _)| filter.matches_key(key))
            .collect();
        keys.sort_by_key(|(key, _)| *key);

        let mut out = Vec::new();
        for (key, log) in keys {
            let guard = log.read().await;
            out.extend(
                guard
                    .records
                    .iter()
                    .filter(|r| filter.matches_owner(&r.owner_id))
                    .map(|record| KeyedBooking { key, record: *record }),
            );
        }
        out
    }

    /// One page of `owner_id`'s bookings, ordered by `(resource_id, day, booking_id)`.
    ///
    /// `after` is exclusive; pass the cursor of the last entry of the previous
    /// page to continue. `limit` is capped at `MAX_PAGE_SIZE`.
    pub async fn owner_bookings(
        &self,
        owner_id: Ulid,
        after: Option<OwnerCursor>,
        limit: usize,
    ) -> Vec<KeyedBooking> {
        let limit = limit.min(MAX_PAGE_SIZE);
        if limit == 0 {
            return Vec::new();
        }

        let mut keys: Vec<_> = self
            .all_logs()
            .into_iter()
            .filter(|(key, _)| after.is_none_or(|c| *key >= c.key))
            .collect();
        keys.sort_by_key(|(key, _)| *key);

        let mut page = Vec::with_capacity(limit);
        for (key, log) in keys {
            let guard = log.read().await;
            let mut owned: Vec<KeyedBooking> = guard
                .records
                .iter()
                .filter(|r| r.owner_id == owner_id)
                .map(|record| KeyedBooking { key, record: *record })
                .filter(|b| after.is_none_or(|c| OwnerCursor::from(b) > c))
                .collect();
            drop(guard);

            owned.sort_by_key(|b| b.record.id);
            for booking in owned {
                page.push(booking);
                if page.len() == limit {
                    return page;
                }
            }
        }
        page
    }
}
