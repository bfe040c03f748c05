use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::authz::AccessLevel;
use crate::models::group::{GroupId, ProjectId};
use crate::models::user::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MembershipSource {
    Group(GroupId),
    Project(ProjectId),
}

/// Awaiting members exist but hold no access and consume no seat until
/// activated (promotion-management queue, seat overage review).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberState {
    Active,
    Awaiting,
}

#[derive(Debug, Clone)]
pub struct Member {
    pub user_id: UserId,
    pub source: MembershipSource,
    pub access_level: AccessLevel,
    pub member_role_id: Option<u64>,
    pub state: MemberState,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Member {
    /// Active and not past its expiry; only then does the membership
    /// grant access or consume a seat.
    pub fn is_active(&self) -> bool {
        self.state == MemberState::Active
            && self
                .expires_at
                .map(|d| d >= Utc::now().date_naive())
                .unwrap_or(true)
    }
}

/// A custom role. `namespace: None` means instance-level; otherwise the
/// role belongs to a top-level group and is assignable only within that
/// group's hierarchy.
#[derive(Debug, Clone)]
pub struct MemberRole {
    pub id: u64,
    pub namespace: Option<GroupId>,
    pub name: String,
    pub base_access_level: AccessLevel,
}

/// Share edge: members of `invited_group` gain access to `shared_group`,
/// capped at `access`.
#[derive(Debug, Clone)]
pub struct GroupLink {
    pub id: u64,
    pub shared_group: GroupId,
    pub invited_group: GroupId,
    pub access: AccessLevel,
    pub member_role_id: Option<u64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Invitation {
    pub id: u64,
    pub source: MembershipSource,
    pub email: String,
    pub access_level: AccessLevel,
    pub created_by: UserId,
    pub created_at: DateTime<Utc>,
}
