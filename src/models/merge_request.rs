use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::group::ProjectId;
use crate::models::user::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRequestState {
    Opened,
    Closed,
    Merged,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub id: u64,
    pub iid: u64,
    pub project_id: ProjectId,
    pub title: String,
    pub state: MergeRequestState,
    pub author_id: UserId,
    pub approvals_required: u32,
    pub approvals_given: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MergeRequest {
    pub fn approvals_left(&self) -> u32 {
        self.approvals_required.saturating_sub(self.approvals_given)
    }
}
