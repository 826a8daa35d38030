use crate::limits::MAX_QUERY_NIGHTS;
use crate::model::*;

use super::conflict::validate_stay;
use super::{SharedRoomState, Store, StoreError};

impl Store {
    /// True iff no restriction on `room_id` overlaps the half-open `stay`.
    pub async fn is_room_available(&self, stay: Stay, room_id: RoomId) -> Result<bool, StoreError> {
        validate_stay(&stay, MAX_QUERY_NIGHTS)?;
        let rs = self.room(room_id)?;
        self.bounded(async move {
            let guard = rs.read().await;
            Ok(guard.is_free(&stay))
        })
        .await
    }

    /// Every room free for `stay`, by ascending room id. Empty when nothing is free.
    pub async fn search_available_rooms(&self, stay: Stay) -> Result<Vec<Room>, StoreError> {
        validate_stay(&stay, MAX_QUERY_NIGHTS)?;
        let rooms = self.rooms_by_id();
        let started = std::time::Instant::now();
        let result = self
            .bounded(async move {
                let mut free = Vec::new();
                for rs in rooms {
                    let guard = rs.read().await;
                    if guard.is_free(&stay) {
                        free.push(guard.room.clone());
                    }
                }
                Ok(free)
            })
            .await;
        metrics::histogram!(crate::observability::SEARCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        result
    }

    /// Room handles sorted by id, so callers see a deterministic order.
    pub(super) fn rooms_by_id(&self) -> Vec<SharedRoomState> {
        let mut rooms: Vec<(RoomId, SharedRoomState)> = self
            .tables
            .rooms
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rooms.sort_by_key(|(id, _)| *id);
        rooms.into_iter().map(|(_, rs)| rs).collect()
    }
}
