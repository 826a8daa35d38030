use crate::limits::*;
use crate::model::*;

use super::StoreError;

pub(crate) fn validate_stay(stay: &Stay, max_nights: i64) -> Result<(), StoreError> {
    if stay.start >= stay.end {
        return Err(StoreError::InvalidRange("start must be before end"));
    }
    if stay.nights() > max_nights {
        return Err(StoreError::LimitExceeded("date range too wide"));
    }
    Ok(())
}

pub(crate) fn validate_booking_stay(stay: &Stay) -> Result<(), StoreError> {
    validate_stay(stay, MAX_STAY_NIGHTS)
}

/// Any restriction overlapping `stay` makes the room unavailable; capacity is
/// always one.
pub(crate) fn check_no_conflict(rs: &RoomState, stay: &Stay) -> Result<(), StoreError> {
    match rs.overlapping(stay).next() {
        Some(existing) => Err(StoreError::Conflict {
            room_id: rs.room.id,
            stay: *stay,
            restriction_id: existing.id,
        }),
        None => Ok(()),
    }
}

pub(crate) fn check_room_capacity(rs: &RoomState) -> Result<(), StoreError> {
    if rs.restrictions.len() >= MAX_RESTRICTIONS_PER_ROOM {
        return Err(StoreError::LimitExceeded("too many restrictions on room"));
    }
    Ok(())
}
