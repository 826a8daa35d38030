use std::collections::HashMap;

use crate::model::*;

use super::{Store, StoreError};

impl Store {
    pub async fn get_room(&self, id: RoomId) -> Result<Room, StoreError> {
        let rs = self.room(id)?;
        self.bounded(async move { Ok(rs.read().await.room.clone()) })
            .await
    }

    /// All rooms by ascending id.
    pub async fn all_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let rooms = self.rooms_by_id();
        self.bounded(async move {
            let mut out = Vec::with_capacity(rooms.len());
            for rs in rooms {
                out.push(rs.read().await.room.clone());
            }
            Ok(out)
        })
        .await
    }

    pub fn room_count(&self) -> usize {
        self.tables.rooms.len()
    }

    pub async fn get_reservation(&self, id: ReservationId) -> Result<ReservationInfo, StoreError> {
        let reservation = self.reservation_row(id)?;
        let room = self.get_room(reservation.room_id).await?;
        Ok(ReservationInfo {
            reservation,
            room_name: room.room_name,
        })
    }

    /// Every reservation, by start date then id.
    pub async fn all_reservations(&self) -> Result<Vec<ReservationInfo>, StoreError> {
        self.reservation_listing(|_| true).await
    }

    /// Reservations staff have not processed yet, by start date then id.
    pub async fn new_reservations(&self) -> Result<Vec<ReservationInfo>, StoreError> {
        self.reservation_listing(|r| !r.processed).await
    }

    async fn reservation_listing(
        &self,
        keep: impl Fn(&Reservation) -> bool,
    ) -> Result<Vec<ReservationInfo>, StoreError> {
        let mut rows: Vec<Reservation> = self
            .tables
            .reservations
            .iter()
            .filter(|e| keep(e.value()))
            .map(|e| e.value().clone())
            .collect();
        rows.sort_by_key(|r| (r.stay.start, r.id));

        let names: HashMap<RoomId, String> = self
            .all_rooms()
            .await?
            .into_iter()
            .map(|room| (room.id, room.room_name))
            .collect();

        Ok(rows
            .into_iter()
            .map(|reservation| ReservationInfo {
                room_name: names
                    .get(&reservation.room_id)
                    .cloned()
                    .unwrap_or_default(),
                reservation,
            })
            .collect())
    }

    /// Restrictions on `room_id` touching the inclusive day range `[first, last]`.
    pub async fn restrictions_for_room(
        &self,
        room_id: RoomId,
        first: Day,
        last: Day,
    ) -> Result<Vec<Restriction>, StoreError> {
        if first > last {
            return Err(StoreError::InvalidRange("first day after last day"));
        }
        let rs = self.room(room_id)?;
        self.bounded(async move {
            let guard = rs.read().await;
            Ok(guard.touching(first, last).cloned().collect())
        })
        .await
    }

    /// Staff lookup by email, ignoring ASCII case.
    pub fn find_user_by_email(&self, email: &str) -> Option<User> {
        let email = email.trim();
        self.tables
            .users
            .iter()
            .find(|e| e.value().email.eq_ignore_ascii_case(email))
            .map(|e| e.value().clone())
    }

    pub fn get_user(&self, id: UserId) -> Option<User> {
        self.tables.users.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn reservation_row(&self, id: ReservationId) -> Result<Reservation, StoreError> {
        self.tables
            .reservations
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::ReservationNotFound(id))
    }

    pub(super) fn reservation_room(&self, id: ReservationId) -> Result<RoomId, StoreError> {
        self.tables
            .reservations
            .get(&id)
            .map(|e| e.value().room_id)
            .ok_or(StoreError::ReservationNotFound(id))
    }
}
