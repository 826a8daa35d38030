//! Newline-delimited JSON protocol over TCP.
//!
//! Every request line is `{"session": <token?>, "op": "...", ...}`; every
//! response line carries the session token to use next, plus a `status` of
//! `ok`, `redirect` or `error`.

use std::sync::Arc;
use std::time::Instant;

use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};

use crate::admin::{AdminError, AdminService};
use crate::booking::{BookingError, BookingService, NO_AVAILABILITY};
use crate::calendar::YearMonth;
use crate::draft::{DraftStage, SessionStateError};
use crate::forms::FormErrors;
use crate::limits::MAX_LINE_LEN;
use crate::model::*;
use crate::observability;
use crate::session::{self, FlashKind, Flashes, SessionStore, SessionToken};
use crate::store::{Store, StoreError};

pub const HOME: &str = "/";
pub const SEARCH_PAGE: &str = "/search-availability";
pub const RESERVATION_FORM: &str = "/make-reservation";
pub const RESERVATION_SUMMARY: &str = "/reservation-summary";
pub const LOGIN_PAGE: &str = "/user/login";
pub const ADMIN_RESERVATIONS: &str = "/admin/reservations-all";
pub const ADMIN_CALENDAR: &str = "/admin/reservation-calendar";

#[derive(Debug, Deserialize)]
pub struct Envelope {
    #[serde(default)]
    pub session: Option<SessionToken>,
    #[serde(flatten)]
    pub request: Request,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Home,
    Search {
        start: String,
        end: String,
    },
    CheckAvailability {
        start: String,
        end: String,
        room_id: RoomId,
    },
    ChooseRoom {
        room_id: RoomId,
    },
    BookRoom {
        room_id: RoomId,
        start: String,
        end: String,
    },
    ReservationForm,
    SubmitReservation(GuestFields),
    ReservationSummary,
    Login {
        email: String,
        password: String,
    },
    Logout,
    AdminNewReservations,
    AdminAllReservations,
    AdminShowReservation {
        id: ReservationId,
    },
    AdminUpdateReservation {
        id: ReservationId,
        #[serde(default)]
        first_name: String,
        #[serde(default)]
        last_name: String,
        #[serde(default)]
        email: String,
        #[serde(default)]
        phone: String,
    },
    AdminProcessReservation {
        id: ReservationId,
    },
    AdminDeleteReservation {
        id: ReservationId,
    },
    AdminCalendar {
        #[serde(default)]
        year: Option<i32>,
        #[serde(default)]
        month: Option<u32>,
    },
    AdminAddBlock {
        room_id: RoomId,
        start: String,
        end: String,
    },
    AdminRemoveBlock {
        id: RestrictionId,
    },
    AdminCreateRoom {
        room_name: String,
    },
}

impl Request {
    /// Short label for metrics and logs.
    pub fn op(&self) -> &'static str {
        match self {
            Request::Home => "home",
            Request::Search { .. } => "search",
            Request::CheckAvailability { .. } => "check_availability",
            Request::ChooseRoom { .. } => "choose_room",
            Request::BookRoom { .. } => "book_room",
            Request::ReservationForm => "reservation_form",
            Request::SubmitReservation(_) => "submit_reservation",
            Request::ReservationSummary => "reservation_summary",
            Request::Login { .. } => "login",
            Request::Logout => "logout",
            Request::AdminNewReservations => "admin_new_reservations",
            Request::AdminAllReservations => "admin_all_reservations",
            Request::AdminShowReservation { .. } => "admin_show_reservation",
            Request::AdminUpdateReservation { .. } => "admin_update_reservation",
            Request::AdminProcessReservation { .. } => "admin_process_reservation",
            Request::AdminDeleteReservation { .. } => "admin_delete_reservation",
            Request::AdminCalendar { .. } => "admin_calendar",
            Request::AdminAddBlock { .. } => "admin_add_block",
            Request::AdminRemoveBlock { .. } => "admin_remove_block",
            Request::AdminCreateRoom { .. } => "admin_create_room",
        }
    }

    fn is_staff_only(&self) -> bool {
        self.op().starts_with("admin_")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct GuestFields {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub phone: String,
}

impl From<GuestFields> for Guest {
    fn from(f: GuestFields) -> Self {
        Guest {
            first_name: f.first_name,
            last_name: f.last_name,
            email: f.email,
            phone: f.phone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    BadRequest,
    Validation,
    Conflict,
    NotFound,
    DuplicateSubmission,
    Unauthorized,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Body {
    Ok {
        data: Value,
    },
    Redirect {
        to: String,
    },
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fields: Option<FormErrors>,
    },
}

impl Body {
    fn ok(data: impl Serialize) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => Body::Ok { data },
            Err(e) => Body::error(ErrorCode::Internal, format!("response encoding failed: {e}")),
        }
    }

    fn redirect(to: &str) -> Self {
        Body::Redirect { to: to.to_string() }
    }

    fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Body::Error {
            code,
            message: message.into(),
            fields: None,
        }
    }

    fn validation(fields: FormErrors) -> Self {
        Body::Error {
            code: ErrorCode::Validation,
            message: fields.to_string(),
            fields: Some(fields),
        }
    }

    fn status(&self) -> &'static str {
        match self {
            Body::Ok { .. } => "ok",
            Body::Redirect { .. } => "redirect",
            Body::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Absent only when the request line could not be read at all.
    pub session: Option<SessionToken>,
    #[serde(flatten)]
    pub body: Body,
    #[serde(default, skip_serializing_if = "Flashes::is_empty")]
    pub flashes: Flashes,
}

/// Everything a connection needs, built once in `main`.
pub struct AppState {
    pub store: Arc<Store>,
    pub sessions: Arc<dyn SessionStore>,
    pub booking: BookingService,
    pub admin: AdminService,
}

/// A handler's result: the body plus the token the client should use next.
struct Outcome {
    token: SessionToken,
    body: Body,
}

impl Outcome {
    fn new(token: SessionToken, body: Body) -> Self {
        Self { token, body }
    }
}

fn booking_err(e: BookingError) -> (Body, Option<&'static str>) {
    match e {
        BookingError::Validation(fields) => (Body::validation(fields), None),
        BookingError::NoAvailability => (Body::redirect(SEARCH_PAGE), Some(NO_AVAILABILITY)),
        BookingError::SessionState(e) => {
            let (to, notice) = match e {
                SessionStateError::Missing => (HOME, "Can't get reservation from session"),
                SessionStateError::Undecodable(_) => {
                    (HOME, "Your reservation could not be read, please start again")
                }
                SessionStateError::WrongStage {
                    found: DraftStage::Committed,
                    ..
                } => (RESERVATION_SUMMARY, "This reservation has already been made"),
                SessionStateError::WrongStage { .. } => {
                    (SEARCH_PAGE, "Please choose your dates and room first")
                }
            };
            (Body::redirect(to), Some(notice))
        }
        BookingError::Conflict { .. } => (
            Body::error(
                ErrorCode::Conflict,
                "This room is no longer available for the selected dates",
            ),
            None,
        ),
        BookingError::NotFound(e) => (Body::error(ErrorCode::NotFound, e.to_string()), None),
        BookingError::DuplicateSubmission => (
            Body::error(ErrorCode::DuplicateSubmission, "Your reservation is already being processed"),
            None,
        ),
        BookingError::Persistence(e) => (persistence_body(&e), None),
        BookingError::Session(e) => {
            tracing::error!("session store failure: {e}");
            (Body::error(ErrorCode::Internal, "Something went wrong, please try again"), None)
        }
    }
}

fn persistence_body(e: &StoreError) -> Body {
    tracing::error!("store failure: {e}");
    match e {
        StoreError::Timeout(_) => Body::error(ErrorCode::Unavailable, "The system is busy, please try again"),
        _ => Body::error(ErrorCode::Internal, "Something went wrong, please try again"),
    }
}

fn store_err(e: StoreError) -> Body {
    match e {
        e if e.is_not_found() => Body::error(ErrorCode::NotFound, e.to_string()),
        e if e.is_conflict() => Body::error(ErrorCode::Conflict, e.to_string()),
        StoreError::InvalidRange(msg) | StoreError::LimitExceeded(msg) => {
            Body::error(ErrorCode::Validation, msg)
        }
        StoreError::UserExists(email) => {
            Body::error(ErrorCode::Conflict, format!("a user with email {email} already exists"))
        }
        e => persistence_body(&e),
    }
}

fn admin_err(e: AdminError) -> Body {
    match e {
        AdminError::Validation(fields) => Body::validation(fields),
        AdminError::InvalidCredentials => Body::redirect(LOGIN_PAGE),
        AdminError::Unauthorized => Body::error(ErrorCode::Unauthorized, "Log in first"),
        AdminError::Store(e) => store_err(e),
        AdminError::Session(e) => {
            tracing::error!("session store failure: {e}");
            Body::error(ErrorCode::Internal, "Something went wrong, please try again")
        }
        AdminError::Auth(msg) => {
            tracing::error!("auth failure: {msg}");
            Body::error(ErrorCode::Internal, "Something went wrong, please try again")
        }
    }
}

impl AppState {
    /// Resolve the session, run the request and render its response.
    pub async fn handle(&self, envelope: Envelope) -> Response {
        let op = envelope.request.op();
        let started = Instant::now();

        let token = match self.sessions.load_or_create(envelope.session).await {
            Ok(t) => t,
            Err(e) => {
                tracing::error!(op, "session store failure: {e}");
                return Response {
                    session: None,
                    body: Body::error(ErrorCode::Internal, "session unavailable"),
                    flashes: Flashes::default(),
                };
            }
        };

        let Outcome { token, body } = self.dispatch(token, envelope.request).await;

        // Flashes survive redirects and show on the next rendered response.
        let flashes = match body {
            Body::Redirect { .. } => Flashes::default(),
            _ => session::pop_flashes(self.sessions.as_ref(), token)
                .await
                .unwrap_or_default(),
        };

        let status = body.status();
        metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status).increment(1);
        metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
            .record(started.elapsed().as_secs_f64());
        tracing::debug!(op, status, elapsed_us = started.elapsed().as_micros() as u64, "request");

        Response {
            session: Some(token),
            body,
            flashes,
        }
    }

    async fn flash_then(&self, token: SessionToken, body: Body, notice: Option<&str>) -> Outcome {
        if let Some(notice) = notice
            && let Err(e) = session::set_flash(self.sessions.as_ref(), token, FlashKind::Error, notice).await
        {
            tracing::warn!("could not set flash: {e}");
        }
        Outcome::new(token, body)
    }

    async fn dispatch(&self, token: SessionToken, req: Request) -> Outcome {
        if req.is_staff_only()
            && let Err(e) = self.admin.require_staff(token).await
        {
            return Outcome::new(token, admin_err(e));
        }

        match req {
            Request::Home => match self.store.all_rooms().await {
                Ok(rooms) => Outcome::new(token, Body::ok(json!({ "rooms": rooms }))),
                Err(e) => Outcome::new(token, store_err(e)),
            },
            Request::Search { start, end } => match self.booking.search(token, &start, &end).await {
                Ok(rooms) => Outcome::new(token, Body::ok(json!({ "rooms": rooms }))),
                Err(e) => {
                    let (body, notice) = booking_err(e);
                    self.flash_then(token, body, notice).await
                }
            },
            Request::CheckAvailability {
                start,
                end,
                room_id,
            } => {
                let reply = self.booking.check_availability(&start, &end, room_id).await;
                Outcome::new(token, Body::ok(reply))
            }
            Request::ChooseRoom { room_id } => {
                let result = self.booking.choose_room(token, room_id).await;
                self.redirect_or(token, result, RESERVATION_FORM).await
            }
            Request::BookRoom {
                room_id,
                start,
                end,
            } => {
                let result = self.booking.book_room(token, room_id, &start, &end).await;
                self.redirect_or(token, result, RESERVATION_FORM).await
            }
            Request::ReservationForm => match self.booking.reservation_form(token).await {
                Ok(draft) => Outcome::new(token, Body::ok(draft)),
                Err(e) => {
                    let (body, notice) = booking_err(e);
                    self.flash_then(token, body, notice).await
                }
            },
            Request::SubmitReservation(fields) => {
                match self.booking.submit_reservation(token, fields.into()).await {
                    Ok(id) => Outcome::new(
                        token,
                        Body::ok(json!({ "reservation_id": id, "next": RESERVATION_SUMMARY })),
                    ),
                    Err(e) => {
                        let (body, notice) = booking_err(e);
                        self.flash_then(token, body, notice).await
                    }
                }
            }
            Request::ReservationSummary => match self.booking.reservation_summary(token).await {
                Ok(draft) => Outcome::new(token, Body::ok(draft)),
                Err(e) => {
                    let (body, notice) = booking_err(e);
                    self.flash_then(token, body, notice).await
                }
            },
            Request::Login { email, password } => match self.admin.login(token, &email, &password).await {
                Ok(renewed) => Outcome::new(renewed, Body::redirect(HOME)),
                Err(e) => Outcome::new(token, admin_err(e)),
            },
            Request::Logout => match self.admin.logout(token).await {
                Ok(renewed) => Outcome::new(renewed, Body::redirect(LOGIN_PAGE)),
                Err(e) => Outcome::new(token, admin_err(e)),
            },
            Request::AdminNewReservations => respond(token, self.admin.new_reservations().await),
            Request::AdminAllReservations => respond(token, self.admin.all_reservations().await),
            Request::AdminShowReservation { id } => respond(token, self.admin.show_reservation(id).await),
            Request::AdminUpdateReservation {
                id,
                first_name,
                last_name,
                email,
                phone,
            } => {
                let guest = Guest {
                    first_name,
                    last_name,
                    email,
                    phone,
                };
                let result = self.admin.update_reservation(token, id, guest).await;
                redirect_on_ok(token, result, ADMIN_RESERVATIONS)
            }
            Request::AdminProcessReservation { id } => {
                let result = self.admin.process_reservation(token, id).await;
                redirect_on_ok(token, result, ADMIN_RESERVATIONS)
            }
            Request::AdminDeleteReservation { id } => {
                let result = self.admin.delete_reservation(token, id).await;
                redirect_on_ok(token, result, ADMIN_RESERVATIONS)
            }
            Request::AdminCalendar { year, month } => {
                let ym = match (year, month) {
                    (None, None) => None,
                    (Some(y), Some(m)) => match YearMonth::new(y, m) {
                        Some(ym) => Some(ym),
                        None => {
                            return Outcome::new(token, Body::error(ErrorCode::Validation, "invalid month"));
                        }
                    },
                    _ => {
                        return Outcome::new(
                            token,
                            Body::error(ErrorCode::Validation, "year and month go together"),
                        );
                    }
                };
                respond(token, self.admin.calendar(ym).await)
            }
            Request::AdminAddBlock {
                room_id,
                start,
                end,
            } => {
                let result = self.admin.add_block(token, room_id, &start, &end).await;
                redirect_on_ok(token, result, ADMIN_CALENDAR)
            }
            Request::AdminRemoveBlock { id } => {
                let result = self.admin.remove_block(token, id).await;
                redirect_on_ok(token, result, ADMIN_CALENDAR)
            }
            Request::AdminCreateRoom { room_name } => respond(token, self.admin.create_room(&room_name).await),
        }
    }

    async fn redirect_or(&self, token: SessionToken, result: Result<(), BookingError>, to: &str) -> Outcome {
        match result {
            Ok(()) => Outcome::new(token, Body::redirect(to)),
            Err(e) => {
                let (body, notice) = booking_err(e);
                self.flash_then(token, body, notice).await
            }
        }
    }
}

fn respond<T: Serialize>(token: SessionToken, result: Result<T, AdminError>) -> Outcome {
    match result {
        Ok(data) => Outcome::new(token, Body::ok(data)),
        Err(e) => Outcome::new(token, admin_err(e)),
    }
}

fn redirect_on_ok<T>(token: SessionToken, result: Result<T, AdminError>, to: &str) -> Outcome {
    match result {
        Ok(_) => Outcome::new(token, Body::redirect(to)),
        Err(e) => Outcome::new(token, admin_err(e)),
    }
}

fn bad_request(message: String) -> Response {
    Response {
        session: None,
        body: Body::error(ErrorCode::BadRequest, message),
        flashes: Flashes::default(),
    }
}

/// Serve one client until it disconnects. Requests are answered in order.
pub async fn process_connection(socket: TcpStream, state: Arc<AppState>) -> Result<(), LinesCodecError> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));

    while let Some(line) = framed.next().await {
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => match serde_json::from_str::<Envelope>(&line) {
                Ok(envelope) => state.handle(envelope).await,
                Err(e) => bad_request(format!("malformed request: {e}")),
            },
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                bad_request(format!("request line longer than {MAX_LINE_LEN} bytes"))
            }
            Err(e) => return Err(e),
        };
        let encoded = match serde_json::to_string(&response) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!("response encoding failed: {e}");
                continue;
            }
        };
        framed.send(encoded).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_requests() {
        let env: Envelope =
            serde_json::from_str(r#"{"op":"search","start":"2024-01-10","end":"2024-01-15"}"#).unwrap();
        assert!(env.session.is_none());
        assert!(matches!(env.request, Request::Search { .. }));

        let token = ulid::Ulid::new();
        let line = format!(
            r#"{{"session":"{token}","op":"submit_reservation","first_name":"Ally","last_name":"Smith","email":"a@b.com"}}"#
        );
        let env: Envelope = serde_json::from_str(&line).unwrap();
        assert_eq!(env.session, Some(token));
        let Request::SubmitReservation(fields) = env.request else {
            panic!("wrong op");
        };
        assert_eq!(fields.first_name, "Ally");
        assert_eq!(fields.phone, "");

        let env: Envelope =
            serde_json::from_str(r#"{"op":"admin_update_reservation","id":4,"first_name":"Ally"}"#).unwrap();
        assert!(matches!(env.request, Request::AdminUpdateReservation { id: 4, .. }));

        assert!(serde_json::from_str::<Envelope>(r#"{"op":"nope"}"#).is_err());
    }

    #[test]
    fn staff_ops_are_flagged() {
        assert!(Request::AdminNewReservations.is_staff_only());
        assert!(Request::AdminRemoveBlock { id: 1 }.is_staff_only());
        assert!(!Request::Home.is_staff_only());
        assert!(!Request::Logout.is_staff_only());
    }

    #[test]
    fn response_shape() {
        let token = ulid::Ulid::new();
        let resp = Response {
            session: Some(token),
            body: Body::redirect(SEARCH_PAGE),
            flashes: Flashes::default(),
        };
        let v: Value = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["status"], "redirect");
        assert_eq!(v["to"], SEARCH_PAGE);
        assert_eq!(v["session"], token.to_string());
        assert!(v.get("flashes").is_none());

        let mut fields = FormErrors::default();
        fields.add("email", "Invalid email address");
        let v = serde_json::to_value(Response {
            session: Some(token),
            body: Body::validation(fields),
            flashes: Flashes {
                error: Some("x".into()),
                ..Flashes::default()
            },
        })
        .unwrap();
        assert_eq!(v["code"], "validation");
        assert_eq!(v["fields"]["email"][0], "Invalid email address");
        assert_eq!(v["flashes"]["error"], "x");
    }

    #[test]
    fn session_errors_redirect_with_notice() {
        let (body, notice) = booking_err(BookingError::SessionState(SessionStateError::Missing));
        assert_eq!(body, Body::redirect(HOME));
        assert!(notice.is_some());

        let (body, notice) = booking_err(BookingError::NoAvailability);
        assert_eq!(body, Body::redirect(SEARCH_PAGE));
        assert_eq!(notice, Some(NO_AVAILABILITY));
    }
}
