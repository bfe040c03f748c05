use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type GroupId = u64;
pub type ProjectId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Visibility {
    Public,
    Private,
}

/// Seat admission policy for a top-level group's subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeatControl {
    Off,
    BlockOverages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Premium,
    Ultimate,
}

/// Purchased subscription. Only top-level groups carry one; subgroups and
/// projects bill against their root ancestor.
#[derive(Debug, Clone, Copy)]
pub struct Subscription {
    pub plan: Plan,
    pub seats: u32,
}

#[derive(Debug, Clone)]
pub struct GroupSettings {
    pub seat_control: SeatControl,
    /// Whether top-level group owners may provision service accounts
    /// (admins always can).
    pub service_account_creation_by_owners: bool,
    /// License-gated attribute: omitted from responses without the
    /// custom-file-templates feature.
    pub file_template_project_id: Option<ProjectId>,
}

impl Default for GroupSettings {
    fn default() -> Self {
        GroupSettings {
            seat_control: SeatControl::Off,
            service_account_creation_by_owners: true,
            file_template_project_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: GroupId,
    pub path: String,
    pub name: String,
    pub visibility: Visibility,
    pub parent_id: Option<GroupId>,
    pub settings: GroupSettings,
    pub subscription: Option<Subscription>,
    pub created_at: DateTime<Utc>,
}

impl Group {
    pub fn top_level(&self) -> bool {
        self.parent_id.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct Project {
    pub id: ProjectId,
    pub path: String,
    pub name: String,
    pub visibility: Visibility,
    pub group_id: GroupId,
    pub created_at: DateTime<Utc>,
}
