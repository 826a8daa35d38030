use std::time::Duration;

use crate::model::{ReservationId, RestrictionId, RoomId, Stay};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("room not found: {0}")]
    RoomNotFound(RoomId),
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),
    #[error("restriction not found: {0}")]
    RestrictionNotFound(RestrictionId),
    #[error("room {room_id} unavailable for {stay}: overlaps restriction {restriction_id}")]
    Conflict {
        room_id: RoomId,
        stay: Stay,
        restriction_id: RestrictionId,
    },
    #[error("restriction {0} belongs to a reservation, not an owner block")]
    NotABlock(RestrictionId),
    #[error("a user with email {0} already exists")]
    UserExists(String),
    #[error("invalid date range: {0}")]
    InvalidRange(&'static str),
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("WAL error: {0}")]
    WalError(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::RoomNotFound(_)
                | StoreError::ReservationNotFound(_)
                | StoreError::RestrictionNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}
