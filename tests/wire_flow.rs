use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use innkeep::admin::AdminService;
use innkeep::auth;
use innkeep::booking::BookingService;
use innkeep::mail::{MailMessage, Mailer};
use innkeep::session::{MemorySessionStore, SessionStore};
use innkeep::store::Store;
use innkeep::wire::{self, AppState};

const ADMIN_EMAIL: &str = "admin@admin.com";
const ADMIN_PASSWORD: &str = "password";

// ── Test infrastructure ──────────────────────────────────────

struct TestServer {
    addr: SocketAddr,
    store: Arc<Store>,
    mail_rx: mpsc::Receiver<MailMessage>,
}

async fn start_test_server() -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("innkeep_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let store = Arc::new(Store::open(dir.join("innkeep.wal"), Duration::from_secs(3)).unwrap());
    store.create_room("General's Quarters".into()).await.unwrap();
    store.create_room("Major's Suite".into()).await.unwrap();
    let hash = auth::hash_password(ADMIN_PASSWORD).unwrap();
    store
        .create_user("Admin".into(), "User".into(), ADMIN_EMAIL.into(), hash, 3)
        .await
        .unwrap();

    let sessions: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new(Duration::from_secs(600)));
    let (mailer, mail_rx) = Mailer::new(16);
    let state = Arc::new(AppState {
        store: store.clone(),
        sessions: sessions.clone(),
        booking: BookingService::new(
            store.clone(),
            sessions.clone(),
            mailer,
            "admin@admin.com".into(),
            "hoster@email.com".into(),
        ),
        admin: AdminService::new(store.clone(), sessions),
    });

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, state).await;
            });
        }
    });

    TestServer { addr, store, mail_rx }
}

/// One client connection that threads its session token through every call.
struct Client {
    framed: Framed<TcpStream, LinesCodec>,
    session: Option<String>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let socket = TcpStream::connect(addr).await.unwrap();
        Self {
            framed: Framed::new(socket, LinesCodec::new()),
            session: None,
        }
    }

    async fn send_raw(&mut self, line: &str) -> Value {
        self.framed.send(line.to_string()).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("response timed out")
            .expect("connection closed")
            .unwrap();
        serde_json::from_str(&reply).unwrap()
    }

    async fn call(&mut self, mut request: Value) -> Value {
        if let Some(token) = &self.session {
            request["session"] = json!(token);
        }
        let resp = self.send_raw(&request.to_string()).await;
        if let Some(token) = resp["session"].as_str() {
            self.session = Some(token.to_string());
        }
        resp
    }
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn guest_books_a_room_end_to_end() {
    let mut server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let resp = client.call(json!({"op": "home"})).await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["rooms"].as_array().unwrap().len(), 2);
    assert!(client.session.is_some());

    let resp = client
        .call(json!({"op": "search", "start": "2030-03-10", "end": "2030-03-13"}))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["rooms"].as_array().unwrap().len(), 2);

    let resp = client.call(json!({"op": "choose_room", "room_id": 1})).await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::RESERVATION_FORM);

    let resp = client.call(json!({"op": "reservation_form"})).await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["room_name"], "General's Quarters");
    assert_eq!(resp["data"]["stage"], "details_pending");

    // Bad details are rejected with per-field messages and kept in the draft.
    let resp = client
        .call(json!({"op": "submit_reservation", "first_name": "Al", "last_name": "", "email": "nope"}))
        .await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["code"], "validation");
    assert_eq!(resp["fields"]["last_name"][0], "This field cannot be blank");
    assert_eq!(resp["fields"]["email"][0], "Invalid email address");

    let resp = client.call(json!({"op": "reservation_form"})).await;
    assert_eq!(resp["data"]["guest"]["first_name"], "Al");

    let resp = client
        .call(json!({
            "op": "submit_reservation",
            "first_name": "Ally",
            "last_name": "Smith",
            "email": "ally@example.com",
            "phone": "555-0100"
        }))
        .await;
    assert_eq!(resp["status"], "ok");
    let reservation_id = resp["data"]["reservation_id"].as_u64().unwrap();

    let resp = client.call(json!({"op": "reservation_summary"})).await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["reservation_id"], reservation_id);
    assert_eq!(resp["data"]["guest"]["email"], "ally@example.com");

    // The summary is shown once; the draft is gone after that.
    let resp = client.call(json!({"op": "reservation_summary"})).await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::HOME);
    let resp = client.call(json!({"op": "home"})).await;
    assert_eq!(resp["flashes"]["error"], "Can't get reservation from session");

    let guest_mail = server.mail_rx.recv().await.unwrap();
    assert_eq!(guest_mail.to, "ally@example.com");
    assert_eq!(guest_mail.subject, "Reservation Confirmation");
    let owner_mail = server.mail_rx.recv().await.unwrap();
    assert_eq!(owner_mail.to, "hoster@email.com");

    let info = server.store.get_reservation(reservation_id).await.unwrap();
    assert_eq!(info.room_name, "General's Quarters");
    assert!(!server.store.is_room_available(info.reservation.stay, 1).await.unwrap());
}

#[tokio::test]
async fn availability_check_and_full_search() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let resp = client
        .call(json!({"op": "check_availability", "start": "2030-04-01", "end": "2030-04-03", "room_id": 2}))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["ok"], true);

    let resp = client
        .call(json!({"op": "check_availability", "start": "2030-04-01", "end": "2030-04-03", "room_id": 99}))
        .await;
    assert_eq!(resp["data"]["ok"], false);
    assert_eq!(resp["data"]["message"], "Room not found");

    let resp = client
        .call(json!({"op": "search", "start": "2030-04-05", "end": "2030-04-01"}))
        .await;
    assert_eq!(resp["code"], "validation");
    assert_eq!(resp["fields"]["end"][0], "End date must be after start date");

    for room_id in [1, 2] {
        let stay = innkeep::model::Stay::new(
            innkeep::model::parse_day("2030-04-01").unwrap(),
            innkeep::model::parse_day("2030-04-10").unwrap(),
        );
        server.store.add_block(room_id, stay).await.unwrap();
    }

    let resp = client
        .call(json!({"op": "search", "start": "2030-04-02", "end": "2030-04-04"}))
        .await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::SEARCH_PAGE);

    let resp = client.call(json!({"op": "home"})).await;
    assert_eq!(resp["flashes"]["error"], "No availability");

    // Checkout day is free again.
    let resp = client
        .call(json!({"op": "search", "start": "2030-04-10", "end": "2030-04-12"}))
        .await;
    assert_eq!(resp["data"]["rooms"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn out_of_order_steps_redirect() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let resp = client.call(json!({"op": "reservation_form"})).await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::HOME);

    client
        .call(json!({"op": "search", "start": "2030-05-01", "end": "2030-05-02"}))
        .await;
    let resp = client.call(json!({"op": "reservation_form"})).await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::SEARCH_PAGE);
}

#[tokio::test]
async fn two_guests_race_for_one_room() {
    let server = start_test_server().await;
    let mut a = Client::connect(server.addr).await;
    let mut b = Client::connect(server.addr).await;

    for c in [&mut a, &mut b] {
        let resp = c
            .call(json!({"op": "book_room", "room_id": 2, "start": "2030-06-01", "end": "2030-06-04"}))
            .await;
        assert_eq!(resp["to"], wire::RESERVATION_FORM);
        c.call(json!({"op": "reservation_form"})).await;
    }

    let details = json!({
        "op": "submit_reservation",
        "first_name": "Sam",
        "last_name": "Jones",
        "email": "sam@example.com"
    });
    let first = a.call(details.clone()).await;
    let second = b.call(details).await;

    assert_eq!(first["status"], "ok");
    assert_eq!(second["status"], "error");
    assert_eq!(second["code"], "conflict");
    assert_eq!(server.store.all_reservations().await.unwrap().len(), 1);
}

#[tokio::test]
async fn staff_manage_reservations_and_blocks() {
    let server = start_test_server().await;
    let mut guest = Client::connect(server.addr).await;
    guest
        .call(json!({"op": "book_room", "room_id": 1, "start": "2030-03-10", "end": "2030-03-13"}))
        .await;
    guest.call(json!({"op": "reservation_form"})).await;
    let resp = guest
        .call(json!({
            "op": "submit_reservation",
            "first_name": "Ally",
            "last_name": "Smith",
            "email": "ally@example.com"
        }))
        .await;
    let reservation_id = resp["data"]["reservation_id"].as_u64().unwrap();

    let mut staff = Client::connect(server.addr).await;
    let resp = staff.call(json!({"op": "admin_all_reservations"})).await;
    assert_eq!(resp["code"], "unauthorized");

    let resp = staff
        .call(json!({"op": "login", "email": ADMIN_EMAIL, "password": "wrong"}))
        .await;
    assert_eq!(resp["status"], "redirect");
    assert_eq!(resp["to"], wire::LOGIN_PAGE);

    let anonymous = staff.session.clone();
    let resp = staff
        .call(json!({"op": "login", "email": ADMIN_EMAIL, "password": ADMIN_PASSWORD}))
        .await;
    assert_eq!(resp["status"], "redirect");
    assert_ne!(staff.session, anonymous, "login must rotate the session token");

    let resp = staff.call(json!({"op": "admin_new_reservations"})).await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["flashes"]["flash"], "Logged in successfully");
    let rows = resp["data"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["id"], reservation_id);
    assert_eq!(rows[0]["room_name"], "General's Quarters");

    let resp = staff
        .call(json!({"op": "admin_calendar", "year": 2030, "month": 3}))
        .await;
    assert_eq!(resp["status"], "ok");
    assert_eq!(resp["data"]["days_in_month"], 31);
    let room1 = &resp["data"]["rooms"][0];
    // Staff calendars mark checkout day as taken too.
    for day in ["10", "11", "12", "13"] {
        assert_eq!(room1["reservation_map"][day], reservation_id);
    }
    assert_eq!(room1["reservation_map"]["14"], 0);

    let resp = staff
        .call(json!({"op": "admin_add_block", "room_id": 2, "start": "2030-03-20", "end": "2030-03-22"}))
        .await;
    assert_eq!(resp["to"], wire::ADMIN_CALENDAR);
    let resp = staff
        .call(json!({"op": "admin_calendar", "year": 2030, "month": 3}))
        .await;
    assert_eq!(resp["flashes"]["flash"], "Block added");
    let block_id = resp["data"]["rooms"][1]["block_map"]["20"].as_u64().unwrap();
    assert_eq!(resp["data"]["rooms"][1]["block_map"]["21"], 0);

    let resp = staff
        .call(json!({"op": "admin_remove_block", "id": reservation_id + 10}))
        .await;
    assert_eq!(resp["code"], "not_found");
    let resp = staff.call(json!({"op": "admin_remove_block", "id": block_id})).await;
    assert_eq!(resp["status"], "redirect");

    let resp = staff
        .call(json!({"op": "admin_process_reservation", "id": reservation_id}))
        .await;
    assert_eq!(resp["to"], wire::ADMIN_RESERVATIONS);
    let resp = staff.call(json!({"op": "admin_new_reservations"})).await;
    assert_eq!(resp["flashes"]["flash"], "Reservation marked as processed");
    assert!(resp["data"].as_array().unwrap().is_empty());

    let resp = staff
        .call(json!({"op": "admin_delete_reservation", "id": reservation_id}))
        .await;
    assert_eq!(resp["status"], "redirect");
    let resp = staff.call(json!({"op": "admin_all_reservations"})).await;
    assert_eq!(resp["flashes"]["flash"], "Reservation deleted");
    assert!(resp["data"].as_array().unwrap().is_empty());
    assert!(server
        .store
        .is_room_available(
            innkeep::model::Stay::new(
                innkeep::model::parse_day("2030-03-10").unwrap(),
                innkeep::model::parse_day("2030-03-13").unwrap(),
            ),
            1
        )
        .await
        .unwrap());

    let resp = staff.call(json!({"op": "logout"})).await;
    assert_eq!(resp["to"], wire::LOGIN_PAGE);
    let resp = staff.call(json!({"op": "admin_all_reservations"})).await;
    assert_eq!(resp["code"], "unauthorized");
}

#[tokio::test]
async fn malformed_lines_get_bad_request() {
    let server = start_test_server().await;
    let mut client = Client::connect(server.addr).await;

    let resp = client.send_raw("this is not json").await;
    assert_eq!(resp["status"], "error");
    assert_eq!(resp["code"], "bad_request");

    let resp = client.send_raw(r#"{"op":"no_such_op"}"#).await;
    assert_eq!(resp["code"], "bad_request");

    // The connection stays usable.
    let resp = client.call(json!({"op": "home"})).await;
    assert_eq!(resp["status"], "ok");
}
