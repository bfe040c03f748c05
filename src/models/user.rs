use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::group::GroupId;

pub type UserId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Blocked,
}

/// What kind of account this is. Service accounts are machine users
/// provisioned by (and scoped to) a single top-level group; the ghost
/// user is the instance-wide tombstone that inherits contributions of
/// deleted accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKind {
    Human,
    ServiceAccount { provisioned_by: GroupId },
    Ghost,
}

#[derive(Debug, Clone)]
pub struct User {
    pub id: UserId,
    pub username: String,
    pub name: String,
    pub email: String,
    pub admin: bool,
    pub kind: UserKind,
    pub state: UserState,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn is_service_account(&self) -> bool {
        matches!(self.kind, UserKind::ServiceAccount { .. })
    }

    pub fn provisioned_by(&self) -> Option<GroupId> {
        match self.kind {
            UserKind::ServiceAccount { provisioned_by } => Some(provisioned_by),
            _ => None,
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self.kind, UserKind::Human)
    }

    pub fn active(&self) -> bool {
        self.state == UserState::Active
    }
}

/// The narrow user representation embedded in member/epic/author payloads.
#[derive(Debug, Clone, Serialize)]
pub struct UserBasic {
    pub id: UserId,
    pub username: String,
    pub name: String,
    pub state: UserState,
}

impl From<&User> for UserBasic {
    fn from(u: &User) -> Self {
        UserBasic {
            id: u.id,
            username: u.username.clone(),
            name: u.name.clone(),
            state: u.state,
        }
    }
}
