//! Staff surface: login/logout, reservation management, owner blocks.

use std::sync::Arc;

use crate::auth::{self, AuthError};
use crate::booking::{parse_stay, validate_guest};
use crate::calendar::{self, MonthCalendar, YearMonth};
use crate::forms::{Form, FormErrors};
use crate::limits::*;
use crate::model::*;
use crate::session::{self, FlashKind, SessionError, SessionStore, SessionToken, USER_ID_KEY};
use crate::store::{Store, StoreError};

pub const LOGGED_IN: &str = "Logged in successfully";
pub const LOGGED_OUT: &str = "Logged out successfully";
pub const INVALID_CREDENTIALS: &str = "Invalid login credentials";

#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("invalid input: {0}")]
    Validation(FormErrors),
    #[error("Invalid login credentials")]
    InvalidCredentials,
    #[error("login required")]
    Unauthorized,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("{0}")]
    Auth(String),
}

impl From<AuthError> for AdminError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::InvalidCredentials => AdminError::InvalidCredentials,
            AuthError::Store(e) => AdminError::Store(e),
            AuthError::Hash(msg) => AdminError::Auth(msg),
        }
    }
}

pub struct AdminService {
    store: Arc<Store>,
    sessions: Arc<dyn SessionStore>,
}

impl AdminService {
    pub fn new(store: Arc<Store>, sessions: Arc<dyn SessionStore>) -> Self {
        Self { store, sessions }
    }

    /// Returns the renewed session token on success.
    pub async fn login(
        &self,
        token: SessionToken,
        email: &str,
        password: &str,
    ) -> Result<SessionToken, AdminError> {
        let mut form = Form::new([("email", email), ("password", password)]);
        form.required(&["email", "password"])
            .is_email("email")
            .max_length("email", MAX_EMAIL_LEN)
            .max_length("password", MAX_PASSWORD_LEN);
        if !form.valid() {
            return Err(AdminError::Validation(form.into_errors()));
        }

        let user_id = match auth::authenticate(&self.store, email, password).await {
            Ok(id) => id,
            Err(AuthError::InvalidCredentials) => {
                tracing::info!("failed staff login for {email}");
                session::set_flash(self.sessions.as_ref(), token, FlashKind::Error, INVALID_CREDENTIALS)
                    .await?;
                return Err(AdminError::InvalidCredentials);
            }
            Err(e) => return Err(e.into()),
        };

        let token = self.sessions.renew_token(token).await?;
        session::put_as(self.sessions.as_ref(), token, USER_ID_KEY, &user_id).await?;
        session::set_flash(self.sessions.as_ref(), token, FlashKind::Flash, LOGGED_IN).await?;
        tracing::info!(user_id, "staff logged in");
        Ok(token)
    }

    /// Ends the session and hands back a fresh one carrying the goodbye flash.
    pub async fn logout(&self, token: SessionToken) -> Result<SessionToken, AdminError> {
        self.sessions.destroy(token).await?;
        let token = self.sessions.renew_token(token).await?;
        session::set_flash(self.sessions.as_ref(), token, FlashKind::Flash, LOGGED_OUT).await?;
        Ok(token)
    }

    pub async fn require_staff(&self, token: SessionToken) -> Result<UserId, AdminError> {
        let user_id = session::get_as::<UserId>(self.sessions.as_ref(), token, USER_ID_KEY)
            .await
            .ok()
            .flatten()
            .ok_or(AdminError::Unauthorized)?;
        if self.store.get_user(user_id).is_none() {
            return Err(AdminError::Unauthorized);
        }
        Ok(user_id)
    }

    async fn flash(&self, token: SessionToken, message: &str) -> Result<(), AdminError> {
        session::set_flash(self.sessions.as_ref(), token, FlashKind::Flash, message).await?;
        Ok(())
    }

    pub async fn new_reservations(&self) -> Result<Vec<ReservationInfo>, AdminError> {
        Ok(self.store.new_reservations().await?)
    }

    pub async fn all_reservations(&self) -> Result<Vec<ReservationInfo>, AdminError> {
        Ok(self.store.all_reservations().await?)
    }

    pub async fn show_reservation(&self, id: ReservationId) -> Result<ReservationInfo, AdminError> {
        Ok(self.store.get_reservation(id).await?)
    }

    pub async fn update_reservation(
        &self,
        token: SessionToken,
        id: ReservationId,
        guest: Guest,
    ) -> Result<Reservation, AdminError> {
        validate_guest(&guest).map_err(AdminError::Validation)?;
        let updated = self.store.update_reservation(id, guest).await?;
        self.flash(token, "Changes saved").await?;
        Ok(updated)
    }

    pub async fn process_reservation(&self, token: SessionToken, id: ReservationId) -> Result<(), AdminError> {
        self.store.set_processed(id, true).await?;
        self.flash(token, "Reservation marked as processed").await
    }

    pub async fn delete_reservation(&self, token: SessionToken, id: ReservationId) -> Result<(), AdminError> {
        self.store.delete_reservation(id).await?;
        self.flash(token, "Reservation deleted").await
    }

    pub async fn calendar(&self, month: Option<YearMonth>) -> Result<MonthCalendar, AdminError> {
        Ok(calendar::build(&self.store, month).await?)
    }

    pub async fn add_block(
        &self,
        token: SessionToken,
        room_id: RoomId,
        start: &str,
        end: &str,
    ) -> Result<Restriction, AdminError> {
        let stay = parse_stay(start, end).map_err(AdminError::Validation)?;
        let block = self.store.add_block(room_id, stay).await?;
        tracing::info!(room_id, block_id = block.id, %stay, "owner block added");
        self.flash(token, "Block added").await?;
        Ok(block)
    }

    pub async fn remove_block(&self, token: SessionToken, id: RestrictionId) -> Result<RoomId, AdminError> {
        let room_id = self.store.remove_block(id).await?;
        tracing::info!(room_id, block_id = id, "owner block removed");
        self.flash(token, "Block removed").await?;
        Ok(room_id)
    }

    pub async fn create_room(&self, room_name: &str) -> Result<Room, AdminError> {
        Ok(self.store.create_room(room_name.trim().to_string()).await?)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::session::{pop_flashes, MemorySessionStore};

    async fn fixture(name: &str) -> (AdminService, Arc<Store>, Arc<MemorySessionStore>) {
        let dir = std::env::temp_dir().join("innkeep_test_admin");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let store = Arc::new(Store::open(path, DEFAULT_STORE_TIMEOUT).unwrap());
        store
            .create_user(
                "Ada".into(),
                "Admin".into(),
                "admin@admin.com".into(),
                auth::hash_password("password").unwrap(),
                3,
            )
            .await
            .unwrap();
        let sessions = Arc::new(MemorySessionStore::new(Duration::from_secs(60)));
        (AdminService::new(store.clone(), sessions.clone()), store, sessions)
    }

    #[tokio::test]
    async fn login_renews_token_and_flashes() {
        let (admin, _, sessions) = fixture("login.wal").await;
        let t = sessions.load_or_create(None).await.unwrap();
        assert!(matches!(admin.require_staff(t).await, Err(AdminError::Unauthorized)));

        let staff = admin.login(t, "admin@admin.com", "password").await.unwrap();
        assert_ne!(staff, t);
        assert!(admin.require_staff(staff).await.is_ok());
        assert!(admin.require_staff(t).await.is_err());
        assert_eq!(
            pop_flashes(sessions.as_ref(), staff).await.unwrap().flash.as_deref(),
            Some(LOGGED_IN)
        );

        let out = admin.logout(staff).await.unwrap();
        assert!(matches!(admin.require_staff(out).await, Err(AdminError::Unauthorized)));
        assert!(admin.require_staff(staff).await.is_err());
        assert_eq!(
            pop_flashes(sessions.as_ref(), out).await.unwrap().flash.as_deref(),
            Some(LOGGED_OUT)
        );
    }

    #[tokio::test]
    async fn bad_login() {
        let (admin, _, sessions) = fixture("bad_login.wal").await;
        let t = sessions.load_or_create(None).await.unwrap();

        assert!(matches!(
            admin.login(t, "admin@admin.com", "wrong").await,
            Err(AdminError::InvalidCredentials)
        ));
        assert_eq!(
            pop_flashes(sessions.as_ref(), t).await.unwrap().error.as_deref(),
            Some(INVALID_CREDENTIALS)
        );

        let Err(AdminError::Validation(errors)) = admin.login(t, "nope", "").await else {
            panic!("expected validation error");
        };
        assert_eq!(errors.get("email"), Some("Invalid email address"));
        assert_eq!(errors.get("password"), Some("This field cannot be blank"));
    }

    #[tokio::test]
    async fn manage_reservations_and_blocks() {
        let (admin, store, sessions) = fixture("manage.wal").await;
        let t = sessions.load_or_create(None).await.unwrap();
        let room = admin.create_room("  Suite ").await.unwrap();
        assert_eq!(room.room_name, "Suite");

        let res = store
            .commit_reservation(
                room.id,
                Stay::new(parse_day("2024-06-10").unwrap(), parse_day("2024-06-12").unwrap()),
                Guest {
                    first_name: "Ally".into(),
                    last_name: "Smith".into(),
                    email: "ally@example.com".into(),
                    phone: String::new(),
                },
            )
            .await
            .unwrap();

        assert_eq!(admin.new_reservations().await.unwrap().len(), 1);
        let mut guest = admin.show_reservation(res.id).await.unwrap().reservation.guest;
        guest.first_name = "Al".into();
        assert!(matches!(
            admin.update_reservation(t, res.id, guest.clone()).await,
            Err(AdminError::Validation(_))
        ));
        guest.first_name = "Alice".into();
        admin.update_reservation(t, res.id, guest).await.unwrap();

        admin.process_reservation(t, res.id).await.unwrap();
        assert!(admin.new_reservations().await.unwrap().is_empty());
        assert_eq!(admin.all_reservations().await.unwrap().len(), 1);

        let block = admin.add_block(t, room.id, "2024-06-20", "2024-06-23").await.unwrap();
        let cal = admin.calendar(YearMonth::new(2024, 6)).await.unwrap();
        assert_eq!(cal.rooms[0].reservation_map[&12], res.id);
        assert_eq!(cal.rooms[0].block_map[&20], block.id);

        assert!(matches!(
            admin.add_block(t, room.id, "2024-06-11", "2024-06-13").await,
            Err(AdminError::Store(StoreError::Conflict { .. }))
        ));
        admin.remove_block(t, block.id).await.unwrap();

        admin.delete_reservation(t, res.id).await.unwrap();
        assert!(matches!(
            admin.show_reservation(res.id).await,
            Err(AdminError::Store(StoreError::ReservationNotFound(_)))
        ));
    }
}
