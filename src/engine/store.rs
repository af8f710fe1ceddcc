use async_trait::async_trait;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

/// The write side the processor drives.
///
/// Implementations must make the overlap check and the append a single
/// atomic step per key.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn create_booking(
        &self,
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    ) -> Result<CreateOutcome, EngineError>;

    async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError>;
}

#[async_trait]
impl BookingStore for Engine {
    async fn create_booking(
        &self,
        key: ResourceKey,
        owner_id: Ulid,
        interval: Interval,
    ) -> Result<CreateOutcome, EngineError> {
        Engine::create_booking(self, key, owner_id, interval).await
    }

    async fn delete_booking(
        &self,
        key: ResourceKey,
        booking_id: Ulid,
        owner_id: Ulid,
    ) -> Result<DeleteOutcome, EngineError> {
        Engine::delete_booking(self, key, booking_id, owner_id).await
    }
}
