//! Deletes an account and migrates its contributions to the instance
//! ghost user. Every step re-reads current state, so a redelivered job
//! finds nothing left to do: authorship rewrites key off the dying
//! user's id and group deletion re-checks the owner set.

use serde_json::json;

use crate::authz::AccessLevel;
use crate::models::audit::EntityType;
use crate::models::member::MembershipSource;
use crate::models::user::UserId;
use crate::store::Store;

pub fn run(store: &Store, user_id: UserId, initiator_id: UserId, hard_delete: bool) {
    let user = match store.user(user_id) {
        Some(u) => u,
        // Already migrated; redelivery is a no-op.
        None => return,
    };

    let sole_owned = sole_owned_groups(store, user_id);
    if !sole_owned.is_empty() && !hard_delete {
        tracing::warn!(
            user = user_id,
            groups = ?sole_owned,
            "refusing soft delete: user is sole owner of groups"
        );
        return;
    }

    let ghost = store.ghost_user();
    store.revoke_tokens_of(user_id);

    // Sole-owned groups go down with the account under hard delete.
    for gid in sole_owned {
        tracing::info!(group = gid, user = user_id, "deleting group sole-owned by deleted user");
        store.delete_group(gid);
    }

    for membership in store.memberships_of(user_id) {
        store.remove_member(membership.source, user_id);
    }

    if hard_delete {
        for epic in store.epics_authored_by(user_id) {
            store.delete_epic(epic.id);
        }
    } else {
        for epic in store.epics_authored_by(user_id) {
            store.reassign_epic_author(epic.id, ghost.id);
        }
    }

    // The audit trail survives either way, attributed to the ghost.
    store.reassign_audit_author(user_id, ghost.id);

    store.record_audit(
        initiator_id,
        EntityType::User,
        user_id,
        json!({
            "custom_message": "user destroyed",
            "username": user.username,
            "hard_delete": hard_delete,
        }),
        None,
    );

    store.delete_user(user_id);
    tracing::info!(user = user_id, hard_delete, "ghost migration complete");
}

/// Groups (top or sub) where the user is the only active owner.
pub fn sole_owned_groups(store: &Store, user_id: UserId) -> Vec<u64> {
    store
        .memberships_of(user_id)
        .iter()
        .filter_map(|m| match m.source {
            MembershipSource::Group(gid)
                if m.access_level == AccessLevel::Owner && m.is_active() =>
            {
                Some(gid)
            }
            _ => None,
        })
        .filter(|gid| {
            !store
                .members_of(MembershipSource::Group(*gid))
                .iter()
                .any(|m| {
                    m.user_id != user_id
                        && m.access_level == AccessLevel::Owner
                        && m.is_active()
                })
        })
        .collect()
}
