//! The reservation a guest is building across requests.
//!
//! Stages advance `DatesSelected → RoomSelected → DetailsPending → Committed`;
//! "Empty" is the absence of a draft in the session.

use serde::{Deserialize, Serialize};

use crate::model::{Guest, ReservationId, RoomId, Stay};
use crate::session::{self, SessionError, SessionStore, SessionToken};

/// Session key. Bump the version when the stored shape changes; old drafts
/// then simply read as absent.
pub const DRAFT_KEY: &str = "reservation_draft:v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DraftStage {
    DatesSelected,
    RoomSelected,
    DetailsPending,
    Committed,
}

impl std::fmt::Display for DraftStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DraftStage::DatesSelected => "dates selected",
            DraftStage::RoomSelected => "room selected",
            DraftStage::DetailsPending => "details pending",
            DraftStage::Committed => "committed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SessionStateError {
    #[error("no reservation in progress")]
    Missing,
    #[error("reservation in session is unreadable: {0}")]
    Undecodable(String),
    #[error("reservation is {found}, expected {expected}")]
    WrongStage {
        expected: &'static str,
        found: DraftStage,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationDraft {
    pub stage: DraftStage,
    pub stay: Stay,
    pub room_id: Option<RoomId>,
    pub room_name: Option<String>,
    #[serde(default)]
    pub guest: Guest,
    pub reservation_id: Option<ReservationId>,
}

impl ReservationDraft {
    pub fn with_dates(stay: Stay) -> Self {
        Self {
            stage: DraftStage::DatesSelected,
            stay,
            room_id: None,
            room_name: None,
            guest: Guest::default(),
            reservation_id: None,
        }
    }

    /// Deep link straight to a room and dates.
    pub fn for_room(stay: Stay, room_id: RoomId, room_name: String) -> Self {
        Self {
            stage: DraftStage::RoomSelected,
            room_id: Some(room_id),
            room_name: Some(room_name),
            ..Self::with_dates(stay)
        }
    }

    pub fn choose_room(&mut self, room_id: RoomId, room_name: String) -> Result<(), SessionStateError> {
        self.require_stage(
            &[DraftStage::DatesSelected, DraftStage::RoomSelected],
            "dates selected",
        )?;
        self.room_id = Some(room_id);
        self.room_name = Some(room_name);
        self.stage = DraftStage::RoomSelected;
        Ok(())
    }

    /// Showing the details form. Re-showing it (after a failed submit) is allowed.
    pub fn open_form(&mut self) -> Result<RoomId, SessionStateError> {
        self.require_stage(
            &[DraftStage::RoomSelected, DraftStage::DetailsPending],
            "room selected",
        )?;
        let room_id = self.room_id.ok_or(SessionStateError::WrongStage {
            expected: "room selected",
            found: self.stage,
        })?;
        self.stage = DraftStage::DetailsPending;
        Ok(room_id)
    }

    /// Record what the guest typed, valid or not.
    pub fn fill_guest(&mut self, guest: Guest) -> Result<(), SessionStateError> {
        self.require_stage(&[DraftStage::DetailsPending], "details pending")?;
        self.guest = guest;
        Ok(())
    }

    pub fn ready_room(&self) -> Result<RoomId, SessionStateError> {
        self.require_stage(&[DraftStage::DetailsPending], "details pending")?;
        self.room_id.ok_or(SessionStateError::WrongStage {
            expected: "details pending",
            found: self.stage,
        })
    }

    pub fn mark_committed(&mut self, id: ReservationId) -> Result<(), SessionStateError> {
        self.require_stage(&[DraftStage::DetailsPending], "details pending")?;
        self.reservation_id = Some(id);
        self.stage = DraftStage::Committed;
        Ok(())
    }

    pub fn require_stage(&self, allowed: &[DraftStage], expected: &'static str) -> Result<(), SessionStateError> {
        if allowed.contains(&self.stage) {
            Ok(())
        } else {
            Err(SessionStateError::WrongStage {
                expected,
                found: self.stage,
            })
        }
    }
}

/// Current draft. Undecodable data counts as a session-state error, not a crash.
pub async fn load(
    sessions: &dyn SessionStore,
    token: SessionToken,
) -> Result<ReservationDraft, DraftLoadError> {
    match session::get_as::<ReservationDraft>(sessions, token, DRAFT_KEY).await {
        Ok(Some(draft)) => Ok(draft),
        Ok(None) => Err(SessionStateError::Missing.into()),
        Err(SessionError::Decode { source, .. }) => {
            tracing::warn!("discarding undecodable draft: {source}");
            let _ = sessions.remove(token, DRAFT_KEY).await;
            Err(SessionStateError::Undecodable(source.to_string()).into())
        }
        Err(e) => Err(e.into()),
    }
}

pub async fn save(
    sessions: &dyn SessionStore,
    token: SessionToken,
    draft: &ReservationDraft,
) -> Result<(), SessionError> {
    session::put_as(sessions, token, DRAFT_KEY, draft).await
}

pub async fn clear(sessions: &dyn SessionStore, token: SessionToken) -> Result<(), SessionError> {
    sessions.remove(token, DRAFT_KEY).await.map(|_| ())
}

#[derive(Debug, thiserror::Error)]
pub enum DraftLoadError {
    #[error(transparent)]
    State(#[from] SessionStateError),
    #[error(transparent)]
    Session(#[from] SessionError),
}
