use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::models::group::GroupId;
use crate::models::user::UserId;

pub const DEFAULT_EPIC_COLOR: &str = "#1068bf";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpicState {
    Opened,
    Closed,
}

#[derive(Debug, Clone)]
pub struct Epic {
    pub id: u64,
    /// Per-group sequence number; the external identifier in URLs.
    pub iid: u64,
    pub group_id: GroupId,
    pub title: String,
    pub description: Option<String>,
    pub state: EpicState,
    pub confidential: bool,
    /// Sorted, deduplicated label names.
    pub labels: Vec<String>,
    pub parent_id: Option<u64>,
    pub color: String,
    pub start_date_fixed: Option<NaiveDate>,
    pub start_date_is_fixed: bool,
    pub due_date_fixed: Option<NaiveDate>,
    pub due_date_is_fixed: bool,
    pub author_id: UserId,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Epic {
    /// The effective start date: the fixed one when pinned, otherwise
    /// inherited (no milestone rollup here, so inherited is absent).
    pub fn start_date(&self) -> Option<NaiveDate> {
        if self.start_date_is_fixed {
            self.start_date_fixed
        } else {
            None
        }
    }

    pub fn due_date(&self) -> Option<NaiveDate> {
        if self.due_date_is_fixed {
            self.due_date_fixed
        } else {
            None
        }
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    RelatesTo,
    Blocks,
    IsBlockedBy,
}

impl LinkType {
    /// The type as seen from the target's side of the edge.
    pub fn inverse(self) -> LinkType {
        match self {
            LinkType::RelatesTo => LinkType::RelatesTo,
            LinkType::Blocks => LinkType::IsBlockedBy,
            LinkType::IsBlockedBy => LinkType::Blocks,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelatedEpicLink {
    pub id: u64,
    pub source_epic_id: u64,
    pub target_epic_id: u64,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_type_inverse() {
        assert_eq!(LinkType::Blocks.inverse(), LinkType::IsBlockedBy);
        assert_eq!(LinkType::IsBlockedBy.inverse(), LinkType::Blocks);
        assert_eq!(LinkType::RelatesTo.inverse(), LinkType::RelatesTo);
    }

    #[test]
    fn test_unfixed_dates_are_absent() {
        let epic = Epic {
            id: 1,
            iid: 1,
            group_id: 1,
            title: "roadmap".into(),
            description: None,
            state: EpicState::Opened,
            confidential: false,
            labels: vec![],
            parent_id: None,
            color: DEFAULT_EPIC_COLOR.into(),
            start_date_fixed: Some(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            start_date_is_fixed: false,
            due_date_fixed: None,
            due_date_is_fixed: false,
            author_id: 1,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        // A stored fixed date is ignored while the flag says "inherited".
        assert_eq!(epic.start_date(), None);
        assert_eq!(epic.due_date(), None);
    }
}
