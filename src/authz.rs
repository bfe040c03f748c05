//! Role lattice and per-resource access resolution.
//!
//! Access flows down the hierarchy: a member of a group holds the same
//! level in every subgroup and project beneath it. Share edges
//! (`GroupLink`) grant the invited group's members access to the shared
//! group, capped at the link's level. Admins in admin mode bypass role
//! checks entirely; visibility rules still answer 404 for resources that
//! must not leak their existence.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::ApiError;
use crate::middleware::auth::CurrentUser;
use crate::models::group::{Group, GroupId, Project, Visibility};
use crate::models::member::MembershipSource;
use crate::models::user::UserId;
use crate::store::Store;

/// Membership tiers, ordered. Serialized as the numeric level, which is
/// the wire format for `access_level` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AccessLevel {
    MinimalAccess,
    Guest,
    Reporter,
    Developer,
    Maintainer,
    Owner,
}

impl AccessLevel {
    pub fn as_u8(self) -> u8 {
        match self {
            AccessLevel::MinimalAccess => 5,
            AccessLevel::Guest => 10,
            AccessLevel::Reporter => 20,
            AccessLevel::Developer => 30,
            AccessLevel::Maintainer => 40,
            AccessLevel::Owner => 50,
        }
    }

    pub fn from_u8(v: u8) -> Option<AccessLevel> {
        match v {
            5 => Some(AccessLevel::MinimalAccess),
            10 => Some(AccessLevel::Guest),
            20 => Some(AccessLevel::Reporter),
            30 => Some(AccessLevel::Developer),
            40 => Some(AccessLevel::Maintainer),
            50 => Some(AccessLevel::Owner),
            _ => None,
        }
    }
}

impl Serialize for AccessLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for AccessLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = u8::deserialize(deserializer)?;
        AccessLevel::from_u8(v)
            .ok_or_else(|| D::Error::custom(format!("invalid access level: {}", v)))
    }
}

/// Highest level the user holds on the group, considering the ancestor
/// chain and share edges. `None` for non-members.
pub fn group_access(store: &Store, user_id: UserId, group_id: GroupId) -> Option<AccessLevel> {
    let chain = store.ancestor_chain(group_id);
    let mut best: Option<AccessLevel> = None;

    for gid in &chain {
        if let Some(m) = store.find_member(MembershipSource::Group(*gid), user_id) {
            if m.is_active() {
                best = best.max(Some(m.access_level));
            }
        }
    }

    // Share edges into any group on the chain.
    for link in store.links_into(&chain) {
        if let Some(level) = direct_group_access(store, user_id, link.invited_group) {
            best = best.max(Some(level.min(link.access)));
        }
    }

    best
}

/// Access via direct memberships on the invited group's own chain,
/// ignoring further share edges (no transitive sharing).
fn direct_group_access(store: &Store, user_id: UserId, group_id: GroupId) -> Option<AccessLevel> {
    store
        .ancestor_chain(group_id)
        .iter()
        .filter_map(|gid| store.find_member(MembershipSource::Group(*gid), user_id))
        .filter(|m| m.is_active())
        .map(|m| m.access_level)
        .max()
}

pub fn project_access(store: &Store, user_id: UserId, project: &Project) -> Option<AccessLevel> {
    let direct = store
        .find_member(MembershipSource::Project(project.id), user_id)
        .filter(|m| m.is_active())
        .map(|m| m.access_level);
    direct.max(group_access(store, user_id, project.group_id))
}

pub fn source_access(
    store: &Store,
    user_id: UserId,
    source: MembershipSource,
) -> Option<AccessLevel> {
    match source {
        MembershipSource::Group(gid) => group_access(store, user_id, gid),
        MembershipSource::Project(pid) => {
            let project = store.project(pid)?;
            project_access(store, user_id, &project)
        }
    }
}

fn admin_override(user: Option<&CurrentUser>) -> bool {
    user.map(|u| u.admin_mode()).unwrap_or(false)
}

/// 404 when the group must not be known to exist for this caller.
pub fn require_group_visible(
    store: &Store,
    user: Option<&CurrentUser>,
    group: &Group,
) -> Result<(), ApiError> {
    if group.visibility == Visibility::Public || admin_override(user) {
        return Ok(());
    }
    let visible = user
        .map(|u| group_access(store, u.user.id, group.id).is_some())
        .unwrap_or(false);
    if visible {
        Ok(())
    } else {
        Err(ApiError::NotFound("Group"))
    }
}

/// 404 for invisible, 403 for visible-but-underprivileged.
pub fn require_group_access(
    store: &Store,
    user: Option<&CurrentUser>,
    group: &Group,
    required: AccessLevel,
) -> Result<(), ApiError> {
    require_group_visible(store, user, group)?;
    if admin_override(user) {
        return Ok(());
    }
    let level = user.and_then(|u| group_access(store, u.user.id, group.id));
    if level >= Some(required) {
        Ok(())
    } else {
        tracing::warn!(group = group.id, required = required.as_u8(), "group access denied");
        Err(ApiError::Forbidden)
    }
}

pub fn require_project_visible(
    store: &Store,
    user: Option<&CurrentUser>,
    project: &Project,
) -> Result<(), ApiError> {
    if project.visibility == Visibility::Public || admin_override(user) {
        return Ok(());
    }
    let visible = user
        .map(|u| project_access(store, u.user.id, project).is_some())
        .unwrap_or(false);
    if visible {
        Ok(())
    } else {
        Err(ApiError::NotFound("Project"))
    }
}

pub fn require_project_access(
    store: &Store,
    user: Option<&CurrentUser>,
    project: &Project,
    required: AccessLevel,
) -> Result<(), ApiError> {
    require_project_visible(store, user, project)?;
    if admin_override(user) {
        return Ok(());
    }
    let level = user.and_then(|u| project_access(store, u.user.id, project));
    if level >= Some(required) {
        Ok(())
    } else {
        tracing::warn!(project = project.id, required = required.as_u8(), "project access denied");
        Err(ApiError::Forbidden)
    }
}

/// Admin-area gate: admin account with admin mode active.
pub fn require_admin(user: Option<&CurrentUser>) -> Result<&CurrentUser, ApiError> {
    let user = user.ok_or(ApiError::Unauthorized)?;
    if user.admin_mode() {
        Ok(user)
    } else {
        tracing::warn!(user = user.user.id, "admin area denied");
        Err(ApiError::Forbidden)
    }
}

pub fn require_user(user: Option<&CurrentUser>) -> Result<&CurrentUser, ApiError> {
    user.ok_or(ApiError::Unauthorized)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AccessLevel::Owner > AccessLevel::Maintainer);
        assert!(AccessLevel::Maintainer > AccessLevel::Developer);
        assert!(AccessLevel::Guest > AccessLevel::MinimalAccess);
    }

    #[test]
    fn test_numeric_roundtrip() {
        for level in [
            AccessLevel::MinimalAccess,
            AccessLevel::Guest,
            AccessLevel::Reporter,
            AccessLevel::Developer,
            AccessLevel::Maintainer,
            AccessLevel::Owner,
        ] {
            assert_eq!(AccessLevel::from_u8(level.as_u8()), Some(level));
        }
        assert_eq!(AccessLevel::from_u8(15), None);
        assert_eq!(AccessLevel::from_u8(0), None);
    }

    #[test]
    fn test_serializes_as_number() {
        let json = serde_json::to_string(&AccessLevel::Developer).unwrap();
        assert_eq!(json, "30");
        let back: AccessLevel = serde_json::from_str("50").unwrap();
        assert_eq!(back, AccessLevel::Owner);
        assert!(serde_json::from_str::<AccessLevel>("17").is_err());
    }
}
