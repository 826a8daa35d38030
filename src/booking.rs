//! Guest booking flow: search, pick a room, fill in details, commit.

use std::sync::Arc;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::draft::{self, DraftLoadError, DraftStage, ReservationDraft, SessionStateError};
use crate::forms::{Form, FormErrors};
use crate::limits::*;
use crate::mail::{MailMessage, Mailer, BASIC_TEMPLATE_NAME};
use crate::model::*;
use crate::observability;
use crate::session::{SessionError, SessionStore, SessionToken};
use crate::store::{Store, StoreError};

pub const NO_AVAILABILITY: &str = "No availability";

#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("invalid input: {0}")]
    Validation(FormErrors),
    #[error(transparent)]
    SessionState(#[from] SessionStateError),
    #[error("No availability")]
    NoAvailability,
    #[error("room {room_id} is no longer available for {stay}")]
    Conflict { room_id: RoomId, stay: Stay },
    #[error("{0}")]
    NotFound(StoreError),
    #[error("a submission for this session is already in progress")]
    DuplicateSubmission,
    #[error("persistence failure: {0}")]
    Persistence(StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl From<StoreError> for BookingError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict { room_id, stay, .. } => BookingError::Conflict { room_id, stay },
            StoreError::InvalidRange(msg) | StoreError::LimitExceeded(msg) => {
                let mut errors = FormErrors::default();
                errors.add("end", msg);
                BookingError::Validation(errors)
            }
            e if e.is_not_found() => BookingError::NotFound(e),
            e => BookingError::Persistence(e),
        }
    }
}

impl From<DraftLoadError> for BookingError {
    fn from(e: DraftLoadError) -> Self {
        match e {
            DraftLoadError::State(e) => e.into(),
            DraftLoadError::Session(e) => e.into(),
        }
    }
}

/// Answer to a single-room availability check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityReply {
    pub ok: bool,
    pub message: String,
    pub room_id: RoomId,
    pub start_date: String,
    pub end_date: String,
}

/// Parse a `start`/`end` pair into a stay, as field errors on failure.
pub fn parse_stay(start: &str, end: &str) -> Result<Stay, FormErrors> {
    let mut errors = FormErrors::default();
    let s = parse_day(start);
    let e = parse_day(end);
    if s.is_none() {
        errors.add("start", "Invalid date");
    }
    if e.is_none() {
        errors.add("end", "Invalid date");
    }
    match (s, e) {
        (Some(s), Some(e)) => Stay::try_new(s, e).ok_or_else(|| {
            errors.add("end", "End date must be after start date");
            errors
        }),
        _ => Err(errors),
    }
}

/// Validate guest details the way the reservation form does.
pub fn validate_guest(guest: &Guest) -> Result<(), FormErrors> {
    let mut form = Form::new([
        ("first_name", guest.first_name.as_str()),
        ("last_name", guest.last_name.as_str()),
        ("email", guest.email.as_str()),
        ("phone", guest.phone.as_str()),
    ]);
    form.required(&["first_name", "last_name", "email"])
        .min_length("first_name", 3)
        .is_email("email")
        .max_length("first_name", MAX_NAME_LEN)
        .max_length("last_name", MAX_NAME_LEN)
        .max_length("email", MAX_EMAIL_LEN)
        .max_length("phone", MAX_PHONE_LEN);
    if form.valid() {
        Ok(())
    } else {
        Err(form.into_errors())
    }
}

fn trimmed(guest: Guest) -> Guest {
    Guest {
        first_name: guest.first_name.trim().to_string(),
        last_name: guest.last_name.trim().to_string(),
        email: guest.email.trim().to_string(),
        phone: guest.phone.trim().to_string(),
    }
}

/// Clears the in-flight mark for a session when dropped.
struct InFlight<'a> {
    set: &'a DashSet<SessionToken>,
    token: SessionToken,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.remove(&self.token);
    }
}

pub struct BookingService {
    store: Arc<Store>,
    sessions: Arc<dyn SessionStore>,
    mailer: Mailer,
    mail_from: String,
    owner_email: String,
    in_flight: DashSet<SessionToken>,
}

impl BookingService {
    pub fn new(
        store: Arc<Store>,
        sessions: Arc<dyn SessionStore>,
        mailer: Mailer,
        mail_from: String,
        owner_email: String,
    ) -> Self {
        Self {
            store,
            sessions,
            mailer,
            mail_from,
            owner_email,
            in_flight: DashSet::new(),
        }
    }

    /// Rooms free for the dates. A non-empty result starts a new draft; an
    /// empty one discards any earlier draft.
    pub async fn search(&self, token: SessionToken, start: &str, end: &str) -> Result<Vec<Room>, BookingError> {
        let stay = parse_stay(start, end).map_err(BookingError::Validation)?;
        let rooms = self.store.search_available_rooms(stay).await?;
        if rooms.is_empty() {
            draft::clear(self.sessions.as_ref(), token).await?;
            return Err(BookingError::NoAvailability);
        }
        draft::save(self.sessions.as_ref(), token, &ReservationDraft::with_dates(stay)).await?;
        Ok(rooms)
    }

    /// Single-room check. Never fails; problems come back as `ok: false` with a message.
    pub async fn check_availability(&self, start: &str, end: &str, room_id: RoomId) -> AvailabilityReply {
        let mut reply = AvailabilityReply {
            ok: false,
            message: String::new(),
            room_id,
            start_date: start.to_string(),
            end_date: end.to_string(),
        };
        let stay = match parse_stay(start, end) {
            Ok(stay) => stay,
            Err(errors) => {
                reply.message = errors.to_string();
                return reply;
            }
        };
        match self.store.is_room_available(stay, room_id).await {
            Ok(available) => reply.ok = available,
            Err(e) if e.is_not_found() => reply.message = "Room not found".into(),
            Err(e) => {
                tracing::error!(room_id, "availability check failed: {e}");
                reply.message = "Error querying availability".into();
            }
        }
        reply
    }

    /// Pick one of the searched rooms for the draft's dates.
    pub async fn choose_room(&self, token: SessionToken, room_id: RoomId) -> Result<(), BookingError> {
        let mut draft = draft::load(self.sessions.as_ref(), token).await?;
        draft.require_stage(
            &[DraftStage::DatesSelected, DraftStage::RoomSelected],
            "dates selected",
        )?;
        let room = self.store.get_room(room_id).await?;
        if !self.store.is_room_available(draft.stay, room_id).await? {
            return Err(BookingError::Conflict {
                room_id,
                stay: draft.stay,
            });
        }
        draft.choose_room(room.id, room.room_name)?;
        draft::save(self.sessions.as_ref(), token, &draft).await?;
        Ok(())
    }

    /// Deep link with room and dates; replaces any draft in progress.
    pub async fn book_room(
        &self,
        token: SessionToken,
        room_id: RoomId,
        start: &str,
        end: &str,
    ) -> Result<(), BookingError> {
        let stay = parse_stay(start, end).map_err(BookingError::Validation)?;
        let room = self.store.get_room(room_id).await?;
        if !self.store.is_room_available(stay, room_id).await? {
            return Err(BookingError::Conflict { room_id, stay });
        }
        let draft = ReservationDraft::for_room(stay, room.id, room.room_name);
        draft::save(self.sessions.as_ref(), token, &draft).await?;
        Ok(())
    }

    /// Draft to prefill the details form with.
    pub async fn reservation_form(&self, token: SessionToken) -> Result<ReservationDraft, BookingError> {
        let mut draft = draft::load(self.sessions.as_ref(), token).await?;
        let room_id = draft.open_form()?;
        if draft.room_name.is_none() {
            draft.room_name = Some(self.store.get_room(room_id).await?.room_name);
        }
        draft::save(self.sessions.as_ref(), token, &draft).await?;
        Ok(draft)
    }

    /// Validate the guest's details and commit. Entered values stay in the
    /// draft whatever the outcome.
    pub async fn submit_reservation(
        &self,
        token: SessionToken,
        guest: Guest,
    ) -> Result<ReservationId, BookingError> {
        if !self.in_flight.insert(token) {
            return Err(BookingError::DuplicateSubmission);
        }
        let _in_flight = InFlight {
            set: &self.in_flight,
            token,
        };

        let mut draft = draft::load(self.sessions.as_ref(), token).await?;
        let guest = trimmed(guest);
        draft.fill_guest(guest.clone())?;
        draft::save(self.sessions.as_ref(), token, &draft).await?;

        validate_guest(&guest).map_err(BookingError::Validation)?;

        let reservation = self.commit(&draft).await?;
        draft.mark_committed(reservation.id)?;
        draft::save(self.sessions.as_ref(), token, &draft).await?;
        Ok(reservation.id)
    }

    /// Write a completed draft as a reservation plus its restriction, then
    /// queue the confirmation mails.
    pub async fn commit(&self, draft: &ReservationDraft) -> Result<Reservation, BookingError> {
        let room_id = draft.ready_room()?;
        let result = self
            .store
            .commit_reservation(room_id, draft.stay, draft.guest.clone())
            .await;
        let reservation = match result {
            Ok(r) => r,
            Err(e) => {
                if e.is_conflict() {
                    metrics::counter!(observability::BOOKING_CONFLICTS_TOTAL).increment(1);
                    tracing::info!(room_id, stay = %draft.stay, "booking lost the race: {e}");
                } else {
                    tracing::error!(room_id, stay = %draft.stay, "booking commit failed: {e}");
                }
                return Err(e.into());
            }
        };
        metrics::counter!(observability::BOOKINGS_TOTAL).increment(1);
        tracing::info!(
            reservation_id = reservation.id,
            room_id,
            stay = %reservation.stay,
            "reservation committed"
        );

        let room_name = draft.room_name.clone().unwrap_or_default();
        for msg in self.confirmation_mails(&reservation, &room_name) {
            if let Err(e) = self.mailer.enqueue(msg) {
                tracing::warn!(reservation_id = reservation.id, "confirmation mail not queued: {e}");
            }
        }
        Ok(reservation)
    }

    fn confirmation_mails(&self, r: &Reservation, room_name: &str) -> [MailMessage; 2] {
        let start = format_day(r.stay.start);
        let end = format_day(r.stay.end);
        let guest = MailMessage {
            to: r.guest.email.clone(),
            from: self.mail_from.clone(),
            subject: "Reservation Confirmation".into(),
            content: format!(
                "<strong>Reservation Confirmation</strong><br>\
                 Dear {}:<br>\
                 This is to confirm your reservation from {start} to {end}.",
                r.guest.first_name
            ),
            template: BASIC_TEMPLATE_NAME.into(),
        };
        let owner = MailMessage {
            to: self.owner_email.clone(),
            from: self.mail_from.clone(),
            subject: "Reservation Confirmation".into(),
            content: format!(
                "<strong>Reservation Notification</strong><br>\
                 A reservation has been made for {room_name} from {start} to {end}."
            ),
            template: BASIC_TEMPLATE_NAME.into(),
        };
        [guest, owner]
    }

    /// The committed draft, shown once: it leaves the session here.
    pub async fn reservation_summary(&self, token: SessionToken) -> Result<ReservationDraft, BookingError> {
        let draft = draft::load(self.sessions.as_ref(), token).await?;
        draft.require_stage(&[DraftStage::Committed], "committed")?;
        draft::clear(self.sessions.as_ref(), token).await?;
        Ok(draft)
    }
}
