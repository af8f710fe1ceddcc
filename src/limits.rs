// Hard caps on stored and transported data.

/// Max admitted bookings held by one resource-day.
pub const MAX_BOOKINGS_PER_KEY: usize = 1_440;

/// Max records handed to a processor in one poll.
pub const MAX_POLL_BATCH: usize = 10_000;

/// Max entries returned by one page of owner bookings.
pub const MAX_PAGE_SIZE: usize = 1_000;

/// Max encoded command value size accepted by the router.
pub const MAX_RECORD_BYTES: usize = 4_096;

/// Max partitions of the command log.
pub const MAX_PARTITIONS: u32 = 1_024;
