use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Minutes since the start of the resource's local day. The only time type.
pub type Minute = u16;

pub const MINUTES_PER_DAY: Minute = 24 * 60;

/// Malformed input, rejected before it reaches the router or the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationError {
    EmptyInterval { start: Minute, end: Minute },
    OutOfDay(Minute),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::EmptyInterval { start, end } => {
                write!(f, "interval start {start} must be before end {end}")
            }
            ValidationError::OutOfDay(minute) => {
                write!(f, "minute {minute} outside of day [0, {MINUTES_PER_DAY}]")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Half-open interval `[start, end)` in minutes of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Interval {
    pub start: Minute,
    pub end: Minute,
}

impl Interval {
    pub fn new(start: Minute, end: Minute) -> Self {
        debug_assert!(start < end, "Interval start must be before end");
        debug_assert!(end <= MINUTES_PER_DAY, "Interval must end within the day");
        Self { start, end }
    }

    pub fn try_new(start: Minute, end: Minute) -> Result<Self, ValidationError> {
        let interval = Self { start, end };
        interval.validate()?;
        Ok(interval)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.start > MINUTES_PER_DAY {
            return Err(ValidationError::OutOfDay(self.start));
        }
        if self.end > MINUTES_PER_DAY {
            return Err(ValidationError::OutOfDay(self.end));
        }
        if self.start >= self.end {
            return Err(ValidationError::EmptyInterval {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    pub fn duration(&self) -> Minute {
        self.end - self.start
    }

    /// Touching endpoints do not overlap.
    pub fn overlaps(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Expand both ends by `offset`, clamped to the day.
    pub fn buffered(&self, offset: Minute) -> Interval {
        Interval {
            start: self.start.saturating_sub(offset),
            end: self.end.saturating_add(offset).min(MINUTES_PER_DAY),
        }
    }
}

/// One bookable resource-day. Partition key and primary store key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub resource_id: Ulid,
    pub day: NaiveDate,
}

impl ResourceKey {
    pub fn new(resource_id: Ulid, day: NaiveDate) -> Self {
        Self { resource_id, day }
    }
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.resource_id, self.day)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingRecord {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub interval: Interval,
}

/// All admitted bookings of one resource-day, sorted by `interval.start`.
/// No two records overlap.
#[derive(Debug, Clone)]
pub struct BookingLog {
    pub key: ResourceKey,
    pub records: Vec<BookingRecord>,
}

impl BookingLog {
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            records: Vec::new(),
        }
    }

    /// Insert record maintaining sort order by interval start.
    pub fn insert(&mut self, record: BookingRecord) {
        let pos = self
            .records
            .binary_search_by_key(&record.interval.start, |r| r.interval.start)
            .unwrap_or_else(|e| e);
        self.records.insert(pos, record);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<BookingRecord> {
        let pos = self.records.iter().position(|r| r.id == id)?;
        Some(self.records.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&BookingRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    /// Records whose interval overlaps `query`.
    /// Uses binary search to skip records starting at or after `query.end`.
    pub fn overlapping(&self, query: &Interval) -> impl Iterator<Item = &BookingRecord> {
        let right_bound = self
            .records
            .partition_point(|r| r.interval.start < query.end);
        self.records[..right_bound]
            .iter()
            .filter(move |r| r.interval.end > query.start)
    }

    pub fn intervals(&self) -> Vec<Interval> {
        self.records.iter().map(|r| r.interval).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// A booking command as carried on the partitioned command log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    CreateBooking {
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    },
    DeleteBooking {
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    },
}

impl Command {
    /// Build a validated CreateBooking. Invalid intervals never reach the router.
    pub fn create(
        key: ResourceKey,
        owner_id: Ulid,
        start: Minute,
        end: Minute,
    ) -> Result<Self, ValidationError> {
        let interval = Interval::try_new(start, end)?;
        Ok(Command::CreateBooking {
            key,
            owner_id,
            interval,
        })
    }

    pub fn delete(key: ResourceKey, booking_id: Ulid, owner_id: Ulid) -> Self {
        Command::DeleteBooking {
            key,
            booking_id,
            owner_id,
        }
    }

    pub fn key(&self) -> &ResourceKey {
        match self {
            Command::CreateBooking { key, .. } | Command::DeleteBooking { key, .. } => key,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Command::CreateBooking { .. } => "create_booking",
            Command::DeleteBooking { .. } => "delete_booking",
        }
    }
}

/// The store's WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingAdmitted {
        key: ResourceKey,
        record: BookingRecord,
    },
    BookingDeleted {
        key: ResourceKey,
        id: Ulid,
    },
}

impl Event {
    pub fn key(&self) -> &ResourceKey {
        match self {
            Event::BookingAdmitted { key, .. } | Event::BookingDeleted { key, .. } => key,
        }
    }
}

// ── Store outcomes ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conflict {
    pub existing: Ulid,
    pub existing_interval: Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Admitted(BookingRecord),
    Rejected(Conflict),
}

impl CreateOutcome {
    pub fn is_admitted(&self) -> bool {
        matches!(self, CreateOutcome::Admitted(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted(BookingRecord),
    NotFound,
    /// The record exists but belongs to someone else; only under the enforcing policy.
    OwnerMismatch { owner_id: Ulid },
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyedBooking {
    pub key: ResourceKey,
    pub record: BookingRecord,
}

/// Empty lists match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingFilter {
    pub days: Vec<NaiveDate>,
    pub resource_ids: Vec<Ulid>,
    pub owner_ids: Vec<Ulid>,
}

impl BookingFilter {
    pub fn matches_key(&self, key: &ResourceKey) -> bool {
        (self.days.is_empty() || self.days.contains(&key.day))
            && (self.resource_ids.is_empty() || self.resource_ids.contains(&key.resource_id))
    }

    pub fn matches_owner(&self, owner_id: &Ulid) -> bool {
        self.owner_ids.is_empty() || self.owner_ids.contains(owner_id)
    }
}

/// Exclusive position in an owner's bookings, ordered by `(resource_id, day, booking_id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct OwnerCursor {
    pub key: ResourceKey,
    pub booking_id: Ulid,
}

impl From<&KeyedBooking> for OwnerCursor {
    fn from(b: &KeyedBooking) -> Self {
        Self {
            key: b.key,
            booking_id: b.record.id,
        }
    }
}
