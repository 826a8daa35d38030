use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Calendar day. Hotel stays never care about time of day.
pub type Day = NaiveDate;

pub type RoomId = u64;
pub type ReservationId = u64;
pub type RestrictionId = u64;
pub type UserId = u64;

/// Wire/calendar sentinel for "no reservation" (owner block or free day).
pub const NO_RESERVATION: ReservationId = 0;

pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Half-open stay `[start, end)`: check-in day through checkout day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stay {
    pub start: Day,
    pub end: Day,
}

impl Stay {
    pub fn new(start: Day, end: Day) -> Self {
        debug_assert!(start < end, "Stay start must be before end");
        Self { start, end }
    }

    /// Checked constructor for untrusted input. Equal or inverted ranges are rejected.
    pub fn try_new(start: Day, end: Day) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn nights(&self) -> i64 {
        (self.end - self.start).num_days()
    }

    /// Checkout on another stay's check-in day is not an overlap.
    pub fn overlaps(&self, other: &Stay) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for Stay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.format(DATE_FORMAT),
            self.end.format(DATE_FORMAT)
        )
    }
}

/// Parse a `YYYY-MM-DD` date.
pub fn parse_day(s: &str) -> Option<Day> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn format_day(day: Day) -> String {
    day.format(DATE_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: RoomId,
    pub room_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Guest identity as entered on the reservation form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub id: ReservationId,
    pub guest: Guest,
    pub room_id: RoomId,
    pub stay: Stay,
    pub processed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Why a room is unavailable over a stay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestrictionKind {
    /// Occupied by a guest reservation.
    Reservation(ReservationId),
    /// Closed by the owner, no guest attached.
    Block,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Restriction {
    pub id: RestrictionId,
    pub room_id: RoomId,
    pub stay: Stay,
    pub kind: RestrictionKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Restriction {
    /// Reservation id, or [`NO_RESERVATION`] for owner blocks.
    pub fn reservation_id(&self) -> ReservationId {
        match self.kind {
            RestrictionKind::Reservation(id) => id,
            RestrictionKind::Block => NO_RESERVATION,
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self.kind, RestrictionKind::Block)
    }
}

/// Staff account. Passwords are stored as Argon2 PHC strings only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub password_hash: String,
    pub access_level: u8,
}

/// Per-room state: the room plus its restrictions sorted by `stay.start`.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: Room,
    pub restrictions: Vec<Restriction>,
}

impl RoomState {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            restrictions: Vec::new(),
        }
    }

    /// Insert restriction maintaining sort order by stay.start.
    pub fn insert_restriction(&mut self, restriction: Restriction) {
        let pos = self
            .restrictions
            .binary_search_by_key(&restriction.stay.start, |r| r.stay.start)
            .unwrap_or_else(|e| e);
        self.restrictions.insert(pos, restriction);
    }

    pub fn remove_restriction(&mut self, id: RestrictionId) -> Option<Restriction> {
        let pos = self.restrictions.iter().position(|r| r.id == id)?;
        Some(self.restrictions.remove(pos))
    }

    /// Restrictions whose stay overlaps the query (half-open).
    /// Everything starting on or after `query.end` is skipped by binary search.
    pub fn overlapping(&self, query: &Stay) -> impl Iterator<Item = &Restriction> {
        let right_bound = self
            .restrictions
            .partition_point(|r| r.stay.start < query.end);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.stay.end > query.start)
    }

    pub fn is_free(&self, query: &Stay) -> bool {
        self.overlapping(query).next().is_none()
    }

    /// Restrictions touching the inclusive day range `[first, last]`.
    pub fn touching(&self, first: Day, last: Day) -> impl Iterator<Item = &Restriction> {
        let right_bound = self.restrictions.partition_point(|r| r.stay.start <= last);
        self.restrictions[..right_bound]
            .iter()
            .filter(move |r| r.stay.end >= first)
    }
}

/// WAL record format. One record is one atomic unit of change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    RoomCreated {
        id: RoomId,
        room_name: String,
        at: DateTime<Utc>,
    },
    /// Reservation row and its restriction, written together or not at all.
    ReservationCommitted {
        reservation: Reservation,
        restriction_id: RestrictionId,
    },
    ReservationUpdated {
        id: ReservationId,
        guest: Guest,
        at: DateTime<Utc>,
    },
    ReservationProcessed {
        id: ReservationId,
        processed: bool,
        at: DateTime<Utc>,
    },
    /// Removes the reservation and its paired restriction.
    ReservationDeleted {
        id: ReservationId,
        room_id: RoomId,
        restriction_id: Option<RestrictionId>,
    },
    BlockAdded {
        id: RestrictionId,
        room_id: RoomId,
        stay: Stay,
        at: DateTime<Utc>,
    },
    BlockRemoved {
        id: RestrictionId,
        room_id: RoomId,
    },
    UserCreated {
        user: User,
    },
    /// Highest id each table has issued. Leads a compacted log so ids of
    /// deleted rows are never handed out again.
    IdsReserved {
        room: RoomId,
        reservation: ReservationId,
        restriction: RestrictionId,
        user: UserId,
    },
}

// ── Query result types ───────────────────────────────────────────

/// Reservation joined with its room name, as staff listings show it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationInfo {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub room_name: String,
}
