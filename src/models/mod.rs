pub mod audit;
pub mod epic;
pub mod group;
pub mod member;
pub mod merge_request;
pub mod token;
pub mod user;

pub use audit::{AuditEvent, EntityType};
pub use epic::{Epic, EpicState, LinkType, RelatedEpicLink};
pub use group::{Group, GroupSettings, Plan, Project, SeatControl, Subscription, Visibility};
pub use member::{GroupLink, Invitation, Member, MemberRole, MemberState, MembershipSource};
pub use merge_request::{MergeRequest, MergeRequestState};
pub use token::{PersonalAccessToken, TokenScope};
pub use user::{User, UserKind, UserState};
