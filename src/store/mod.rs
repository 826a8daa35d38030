mod availability;
mod conflict;
mod error;
mod mutations;
mod queries;

pub use error::StoreError;

use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tokio::task::JoinHandle;

use crate::model::*;
use crate::wal::Wal;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it, then drain every Append already queued.
/// 3. One flush_sync for the whole batch, then answer every sender.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
    tracing::debug!("wal writer stopped");
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so half-buffered bytes don't leak
    // into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!("appends are batched by the caller"),
    }
}

async fn wal_append(wal_tx: &mpsc::Sender<WalCommand>, event: Event) -> Result<(), StoreError> {
    let (tx, rx) = oneshot::channel();
    wal_tx
        .send(WalCommand::Append { event, response: tx })
        .await
        .map_err(|_| StoreError::WalError("WAL writer shut down".into()))?;
    rx.await
        .map_err(|_| StoreError::WalError("WAL writer dropped response".into()))?
        .map_err(|e| StoreError::WalError(e.to_string()))
}

/// Everything the store knows, shared with detached commit tasks.
pub(super) struct Tables {
    pub(super) rooms: DashMap<RoomId, SharedRoomState>,
    pub(super) reservations: DashMap<ReservationId, Reservation>,
    /// Reservation → its `reservation`-kind restriction.
    pub(super) paired: DashMap<ReservationId, RestrictionId>,
    /// Restriction → owning room.
    pub(super) restriction_room: DashMap<RestrictionId, RoomId>,
    pub(super) users: DashMap<UserId, User>,
}

impl Tables {
    fn new() -> Self {
        Self {
            rooms: DashMap::new(),
            reservations: DashMap::new(),
            paired: DashMap::new(),
            restriction_room: DashMap::new(),
            users: DashMap::new(),
        }
    }

    /// Apply an event. Room-scoped events need the room's state; the caller
    /// holds its write lock.
    fn apply(&self, rs: Option<&mut RoomState>, event: &Event) {
        match event {
            Event::RoomCreated { id, room_name, at } => {
                let room = Room {
                    id: *id,
                    room_name: room_name.clone(),
                    created_at: *at,
                    updated_at: *at,
                };
                self.rooms
                    .insert(*id, Arc::new(RwLock::new(RoomState::new(room))));
            }
            Event::ReservationCommitted {
                reservation,
                restriction_id,
            } => {
                if let Some(rs) = rs {
                    rs.insert_restriction(Restriction {
                        id: *restriction_id,
                        room_id: reservation.room_id,
                        stay: reservation.stay,
                        kind: RestrictionKind::Reservation(reservation.id),
                        created_at: reservation.created_at,
                        updated_at: reservation.created_at,
                    });
                }
                self.restriction_room
                    .insert(*restriction_id, reservation.room_id);
                self.paired.insert(reservation.id, *restriction_id);
                self.reservations.insert(reservation.id, reservation.clone());
            }
            Event::ReservationUpdated { id, guest, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.guest = guest.clone();
                    r.updated_at = *at;
                }
            }
            Event::ReservationProcessed { id, processed, at } => {
                if let Some(mut r) = self.reservations.get_mut(id) {
                    r.processed = *processed;
                    r.updated_at = *at;
                }
            }
            Event::ReservationDeleted {
                id, restriction_id, ..
            } => {
                if let Some(restriction_id) = restriction_id {
                    if let Some(rs) = rs {
                        rs.remove_restriction(*restriction_id);
                    }
                    self.restriction_room.remove(restriction_id);
                }
                self.paired.remove(id);
                self.reservations.remove(id);
            }
            Event::BlockAdded {
                id,
                room_id,
                stay,
                at,
            } => {
                if let Some(rs) = rs {
                    rs.insert_restriction(Restriction {
                        id: *id,
                        room_id: *room_id,
                        stay: *stay,
                        kind: RestrictionKind::Block,
                        created_at: *at,
                        updated_at: *at,
                    });
                }
                self.restriction_room.insert(*id, *room_id);
            }
            Event::BlockRemoved { id, .. } => {
                if let Some(rs) = rs {
                    rs.remove_restriction(*id);
                }
                self.restriction_room.remove(id);
            }
            Event::UserCreated { user } => {
                self.users.insert(user.id, user.clone());
            }
            Event::IdsReserved { .. } => {}
        }
    }
}

/// Room a room-scoped event touches.
fn event_room_id(event: &Event) -> Option<RoomId> {
    match event {
        Event::ReservationCommitted { reservation, .. } => Some(reservation.room_id),
        Event::ReservationDeleted { room_id, .. }
        | Event::BlockAdded { room_id, .. }
        | Event::BlockRemoved { room_id, .. } => Some(*room_id),
        Event::RoomCreated { .. }
        | Event::ReservationUpdated { .. }
        | Event::ReservationProcessed { .. }
        | Event::UserCreated { .. }
        | Event::IdsReserved { .. } => None,
    }
}

/// Highest id each table has handed out, recovered from a replayed log.
#[derive(Default)]
struct HighWater {
    room: u64,
    reservation: u64,
    restriction: u64,
    user: u64,
}

impl HighWater {
    fn observe(&mut self, event: &Event) {
        match event {
            Event::RoomCreated { id, .. } => self.room = self.room.max(*id),
            Event::ReservationCommitted {
                reservation,
                restriction_id,
            } => {
                self.reservation = self.reservation.max(reservation.id);
                self.restriction = self.restriction.max(*restriction_id);
            }
            Event::BlockAdded { id, .. } => self.restriction = self.restriction.max(*id),
            Event::UserCreated { user } => self.user = self.user.max(user.id),
            Event::IdsReserved {
                room,
                reservation,
                restriction,
                user,
            } => {
                self.room = self.room.max(*room);
                self.reservation = self.reservation.max(*reservation);
                self.restriction = self.restriction.max(*restriction);
                self.user = self.user.max(*user);
            }
            _ => {}
        }
    }
}

/// The restriction store: rooms, reservations, restrictions and staff users,
/// held in memory and made durable through the WAL.
pub struct Store {
    pub(super) tables: Arc<Tables>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold this shared; compaction takes it exclusively so the
    /// snapshot it writes can't miss an in-flight append.
    pub(super) write_gate: Arc<RwLock<()>>,
    next_room_id: AtomicU64,
    next_reservation_id: AtomicU64,
    next_restriction_id: AtomicU64,
    next_user_id: AtomicU64,
    timeout: Duration,
}

impl Store {
    /// Recover the log at `wal_path` and start its writer task.
    /// Must be called inside a tokio runtime.
    pub fn open(wal_path: PathBuf, timeout: Duration) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let tables = Tables::new();
        let mut high = HighWater::default();

        // Sole owner of every lock here, so try_write can't contend. Never use
        // blocking_write: this may already run inside the runtime.
        for event in &events {
            high.observe(event);
            match event_room_id(event) {
                Some(room_id) => {
                    let Some(rs) = tables.rooms.get(&room_id).map(|e| e.value().clone()) else {
                        tracing::warn!("wal replay: event for unknown room {room_id} skipped");
                        continue;
                    };
                    let mut guard = rs
                        .try_write()
                        .map_err(|_| io::Error::other("replay: room lock contended"))?;
                    tables.apply(Some(&mut *guard), event);
                }
                None => tables.apply(None, event),
            }
        }

        tracing::info!(
            "store replayed {} records: {} rooms, {} reservations",
            events.len(),
            tables.rooms.len(),
            tables.reservations.len()
        );

        Ok(Self {
            tables: Arc::new(tables),
            wal_tx,
            write_gate: Arc::new(RwLock::new(())),
            next_room_id: AtomicU64::new(high.room + 1),
            next_reservation_id: AtomicU64::new(high.reservation + 1),
            next_restriction_id: AtomicU64::new(high.restriction + 1),
            next_user_id: AtomicU64::new(high.user + 1),
            timeout,
        })
    }

    /// Highest id handed out per table, written ahead of a compacted log.
    pub(super) fn ids_reserved(&self) -> Event {
        Event::IdsReserved {
            room: self.next_room_id.load(Ordering::Relaxed) - 1,
            reservation: self.next_reservation_id.load(Ordering::Relaxed) - 1,
            restriction: self.next_restriction_id.load(Ordering::Relaxed) - 1,
            user: self.next_user_id.load(Ordering::Relaxed) - 1,
        }
    }

    pub(super) fn alloc_room_id(&self) -> RoomId {
        self.next_room_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn alloc_reservation_id(&self) -> ReservationId {
        self.next_reservation_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn alloc_restriction_id(&self) -> RestrictionId {
        self.next_restriction_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(super) fn alloc_user_id(&self) -> UserId {
        self.next_user_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Run a store operation under the uniform deadline.
    pub(super) async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!(crate::observability::STORE_TIMEOUTS_TOTAL).increment(1);
                tracing::warn!("store operation exceeded {:?}", self.timeout);
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    pub(super) fn room(&self, id: RoomId) -> Result<SharedRoomState, StoreError> {
        self.tables
            .rooms
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(StoreError::RoomNotFound(id))
    }

    pub(super) async fn gate(&self) -> OwnedRwLockReadGuard<()> {
        self.write_gate.clone().read_owned().await
    }

    /// Append `event` and apply it, in a task the caller can't cancel.
    ///
    /// The room guard (if any) and the write gate move into the task, so the
    /// event is either durable and applied or neither, even when the caller
    /// times out or its connection drops.
    pub(super) fn persist_detached(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        guard: Option<OwnedRwLockWriteGuard<RoomState>>,
        event: Event,
    ) -> JoinHandle<Result<(), StoreError>> {
        let wal_tx = self.wal_tx.clone();
        let tables = self.tables.clone();
        tokio::spawn(async move {
            let _gate = gate;
            let mut guard = guard;
            wal_append(&wal_tx, event.clone()).await?;
            tables.apply(guard.as_deref_mut(), &event);
            Ok(())
        })
    }

    /// Persist under the deadline. A timeout here leaves the detached task
    /// running; its outcome shows up in later reads.
    pub(super) async fn persist(
        &self,
        gate: OwnedRwLockReadGuard<()>,
        guard: Option<OwnedRwLockWriteGuard<RoomState>>,
        event: Event,
    ) -> Result<(), StoreError> {
        let handle = self.persist_detached(gate, guard, event);
        handle
            .await
            .map_err(|e| StoreError::WalError(format!("commit task failed: {e}")))?
    }
}
