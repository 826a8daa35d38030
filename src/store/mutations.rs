use chrono::Utc;
use tokio::sync::oneshot;

use crate::limits::*;
use crate::model::*;

use super::conflict::{check_no_conflict, check_room_capacity, validate_booking_stay, validate_stay};
use super::{Store, StoreError, WalCommand};

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.trim().is_empty() {
        return Err(StoreError::LimitExceeded("room name must not be empty"));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::LimitExceeded("room name too long"));
    }
    Ok(())
}

impl Store {
    pub async fn create_room(&self, room_name: String) -> Result<Room, StoreError> {
        validate_name(&room_name)?;
        if self.tables.rooms.len() >= MAX_ROOMS {
            return Err(StoreError::LimitExceeded("too many rooms"));
        }
        self.bounded(async {
            let gate = self.gate().await;
            let id = self.alloc_room_id();
            let at = Utc::now();
            let event = Event::RoomCreated {
                id,
                room_name: room_name.clone(),
                at,
            };
            self.persist(gate, None, event).await?;
            tracing::info!(room_id = id, "room created: {room_name}");
            Ok(Room {
                id,
                room_name,
                created_at: at,
                updated_at: at,
            })
        })
        .await
    }

    /// Atomically re-check availability and write the reservation together with
    /// its restriction. Fails with `Conflict` and writes nothing when the room
    /// was taken since the guest searched.
    pub async fn commit_reservation(
        &self,
        room_id: RoomId,
        stay: Stay,
        guest: Guest,
    ) -> Result<Reservation, StoreError> {
        validate_booking_stay(&stay)?;
        let rs = self.room(room_id)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            check_room_capacity(&guard)?;
            check_no_conflict(&guard, &stay)?;

            let now = Utc::now();
            let reservation = Reservation {
                id: self.alloc_reservation_id(),
                guest,
                room_id,
                stay,
                processed: false,
                created_at: now,
                updated_at: now,
            };
            let event = Event::ReservationCommitted {
                reservation: reservation.clone(),
                restriction_id: self.alloc_restriction_id(),
            };
            self.persist(gate, Some(guard), event).await?;
            Ok(reservation)
        })
        .await
    }

    /// Owner block. Subject to the same no-overlap rule as reservations.
    pub async fn add_block(&self, room_id: RoomId, stay: Stay) -> Result<Restriction, StoreError> {
        validate_stay(&stay, MAX_QUERY_NIGHTS)?;
        let rs = self.room(room_id)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            check_room_capacity(&guard)?;
            check_no_conflict(&guard, &stay)?;

            let at = Utc::now();
            let id = self.alloc_restriction_id();
            let event = Event::BlockAdded {
                id,
                room_id,
                stay,
                at,
            };
            self.persist(gate, Some(guard), event).await?;
            Ok(Restriction {
                id,
                room_id,
                stay,
                kind: RestrictionKind::Block,
                created_at: at,
                updated_at: at,
            })
        })
        .await
    }

    /// Remove an owner block. Reservation restrictions only go away together
    /// with their reservation.
    pub async fn remove_block(&self, id: RestrictionId) -> Result<RoomId, StoreError> {
        let room_id = self
            .tables
            .restriction_room
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::RestrictionNotFound(id))?;
        let rs = self.room(room_id)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            let restriction = guard
                .restrictions
                .iter()
                .find(|r| r.id == id)
                .ok_or(StoreError::RestrictionNotFound(id))?;
            if !restriction.is_block() {
                return Err(StoreError::NotABlock(id));
            }
            self.persist(gate, Some(guard), Event::BlockRemoved { id, room_id })
                .await?;
            Ok(room_id)
        })
        .await
    }

    pub async fn update_reservation(
        &self,
        id: ReservationId,
        guest: Guest,
    ) -> Result<Reservation, StoreError> {
        let rs = self.room(self.reservation_room(id)?)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            let mut updated = self.reservation_row(id)?;
            let at = Utc::now();
            updated.guest = guest.clone();
            updated.updated_at = at;
            self.persist(gate, Some(guard), Event::ReservationUpdated { id, guest, at })
                .await?;
            Ok(updated)
        })
        .await
    }

    pub async fn set_processed(&self, id: ReservationId, processed: bool) -> Result<(), StoreError> {
        let rs = self.room(self.reservation_room(id)?)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            self.reservation_row(id)?;
            let event = Event::ReservationProcessed {
                id,
                processed,
                at: Utc::now(),
            };
            self.persist(gate, Some(guard), event).await
        })
        .await
    }

    /// Delete a reservation and its paired restriction in one record.
    pub async fn delete_reservation(&self, id: ReservationId) -> Result<(), StoreError> {
        let room_id = self.reservation_room(id)?;
        let rs = self.room(room_id)?;
        self.bounded(async {
            let gate = self.gate().await;
            let guard = rs.write_owned().await;
            self.reservation_row(id)?;
            let restriction_id = self.tables.paired.get(&id).map(|e| *e.value());
            let event = Event::ReservationDeleted {
                id,
                room_id,
                restriction_id,
            };
            self.persist(gate, Some(guard), event).await?;
            tracing::info!(reservation_id = id, room_id, "reservation deleted");
            Ok(())
        })
        .await
    }

    pub async fn create_user(
        &self,
        first_name: String,
        last_name: String,
        email: String,
        password_hash: String,
        access_level: u8,
    ) -> Result<User, StoreError> {
        if email.len() > MAX_EMAIL_LEN {
            return Err(StoreError::LimitExceeded("email too long"));
        }
        if self.find_user_by_email(&email).is_some() {
            return Err(StoreError::UserExists(email));
        }
        self.bounded(async {
            let gate = self.gate().await;
            let user = User {
                id: self.alloc_user_id(),
                first_name,
                last_name,
                email,
                password_hash,
                access_level,
            };
            self.persist(gate, None, Event::UserCreated { user: user.clone() })
                .await?;
            Ok(user)
        })
        .await
    }

    /// Rewrite the WAL as the minimal record set recreating current state.
    pub async fn compact_wal(&self) -> Result<(), StoreError> {
        // Exclusive gate: no mutation is between "appended" and "applied".
        let _exclusive = self.write_gate.write().await;

        let mut events = vec![self.ids_reserved()];

        let mut users: Vec<User> = self.tables.users.iter().map(|e| e.value().clone()).collect();
        users.sort_by_key(|u| u.id);
        events.extend(users.into_iter().map(|user| Event::UserCreated { user }));

        for rs in self.rooms_by_id() {
            let guard = rs.read().await;
            events.push(Event::RoomCreated {
                id: guard.room.id,
                room_name: guard.room.room_name.clone(),
                at: guard.room.created_at,
            });
            for restriction in &guard.restrictions {
                match restriction.kind {
                    RestrictionKind::Reservation(reservation_id) => {
                        match self.tables.reservations.get(&reservation_id) {
                            Some(r) => events.push(Event::ReservationCommitted {
                                reservation: r.value().clone(),
                                restriction_id: restriction.id,
                            }),
                            None => tracing::warn!(
                                restriction_id = restriction.id,
                                "compaction: restriction without reservation {reservation_id} dropped"
                            ),
                        }
                    }
                    RestrictionKind::Block => events.push(Event::BlockAdded {
                        id: restriction.id,
                        room_id: restriction.room_id,
                        stay: restriction.stay,
                        at: restriction.created_at,
                    }),
                }
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| StoreError::WalError(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
