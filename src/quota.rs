//! Billable-seat math and admission checks against a top-level group's
//! subscription. Reads committed store state, so a successful admit is
//! visible to the very next request.

use std::collections::HashSet;

use crate::authz::AccessLevel;
use crate::entitlements::Entitlements;
use crate::models::group::{Group, Plan, SeatControl};
use crate::models::member::MembershipSource;
use crate::models::user::{User, UserId};
use crate::store::Store;

pub const SEAT_LIMIT_REASON: &str = "seat_limit_exceeded_error";
pub const SEAT_LIMIT_MESSAGE: &str =
    "There are not enough available seats to invite this many users.";
pub const SEAT_LIMIT_MESSAGE_NON_OWNER: &str =
    "There are not enough available seats to invite this many users. \
     Ask a user with the Owner role to purchase more seats.";
pub const PROMOTION_QUEUED_MESSAGE: &str = "Request queued for administrator approval.";

/// Whether a level consumes a seat under the given plan. Guests (and
/// minimal access) ride free on ultimate.
pub fn billable_level(plan: Plan, level: AccessLevel) -> bool {
    match plan {
        Plan::Ultimate => level >= AccessLevel::Reporter,
        _ => level >= AccessLevel::Guest,
    }
}

/// Distinct users consuming seats anywhere in the root group's
/// hierarchy: direct members of its groups and projects plus members
/// reaching in through share edges, capped at the link level. Service
/// accounts, bots, and awaiting members never count.
pub fn billable_users(store: &Store, root: &Group) -> HashSet<UserId> {
    let plan = root.subscription.map(|s| s.plan).unwrap_or(Plan::Free);
    let groups = store.hierarchy(root.id);
    let mut out = HashSet::new();

    let mut consider = |user_id: UserId, level: AccessLevel| {
        if !billable_level(plan, level) {
            return;
        }
        if let Some(user) = store.user(user_id) {
            if user.is_human() && user.active() {
                out.insert(user_id);
            }
        }
    };

    for gid in &groups {
        for m in store.members_of(MembershipSource::Group(*gid)) {
            if m.is_active() {
                consider(m.user_id, m.access_level);
            }
        }
    }
    for project in store.projects_in(&groups) {
        for m in store.members_of(MembershipSource::Project(project.id)) {
            if m.is_active() {
                consider(m.user_id, m.access_level);
            }
        }
    }
    for link in store.links_into(&groups) {
        for m in store.members_of(MembershipSource::Group(link.invited_group)) {
            if m.is_active() {
                consider(m.user_id, m.access_level.min(link.access));
            }
        }
    }

    out
}

pub fn seats_in_use(store: &Store, root: &Group) -> u32 {
    billable_users(store, root).len() as u32
}

#[derive(Debug, PartialEq, Eq)]
pub enum SeatDecision {
    Admit,
    Reject { message: &'static str },
}

/// Admission check for one incoming member. Callers admitting a batch
/// run this per user in request order, inserting each admitted member
/// before checking the next, which is what yields exact-K admission.
pub fn check_seat(
    store: &Store,
    ents: &Entitlements,
    source: MembershipSource,
    actor_is_owner: bool,
    user: &User,
    access_level: AccessLevel,
) -> SeatDecision {
    if !ents.saas() {
        return SeatDecision::Admit;
    }

    let root = match root_of(store, source) {
        Some(g) => g,
        None => return SeatDecision::Admit,
    };
    let subscription = match root.subscription {
        Some(s) => s,
        None => return SeatDecision::Admit,
    };
    if root.settings.seat_control != SeatControl::BlockOverages {
        return SeatDecision::Admit;
    }
    if !billable_level(subscription.plan, access_level) {
        return SeatDecision::Admit;
    }
    if !user.is_human() {
        return SeatDecision::Admit;
    }
    if billable_users(store, &root).contains(&user.id) {
        // Already consuming a seat here; a second membership is free.
        return SeatDecision::Admit;
    }

    if seats_in_use(store, &root) + 1 <= subscription.seats {
        SeatDecision::Admit
    } else {
        tracing::warn!(group = root.id, seats = subscription.seats, "seat limit reached");
        SeatDecision::Reject {
            message: if actor_is_owner {
                SEAT_LIMIT_MESSAGE
            } else {
                SEAT_LIMIT_MESSAGE_NON_OWNER
            },
        }
    }
}

/// Promotion management queues additions that would make the user newly
/// billable instead of applying them (self-managed ultimate only).
pub fn should_queue_promotion(
    store: &Store,
    ents: &Entitlements,
    user: &User,
    access_level: AccessLevel,
) -> bool {
    if !ents.member_promotion_management() || !user.is_human() {
        return false;
    }
    if !billable_level(Plan::Ultimate, access_level) {
        return false;
    }
    // Users already billable somewhere are promoted without review.
    !store
        .memberships_of(user.id)
        .iter()
        .any(|m| m.is_active() && billable_level(Plan::Ultimate, m.access_level))
}

fn root_of(store: &Store, source: MembershipSource) -> Option<Group> {
    match source {
        MembershipSource::Group(gid) => store.root_ancestor(gid),
        MembershipSource::Project(pid) => {
            let project = store.project(pid)?;
            store.root_ancestor(project.group_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::group::{Subscription, Visibility};
    use crate::models::member::{Member, MemberState};
    use crate::models::user::UserKind;
    use chrono::Utc;

    fn add(store: &Store, user: &User, source: MembershipSource, level: AccessLevel) {
        store.add_member(Member {
            user_id: user.id,
            source,
            access_level: level,
            member_role_id: None,
            state: MemberState::Active,
            expires_at: None,
            created_at: Utc::now(),
        });
    }

    fn saas_group(store: &Store, plan: Plan, seats: u32) -> Group {
        let group = store.create_group(
            "acme",
            "Acme",
            Visibility::Private,
            None,
            Some(Subscription { plan, seats }),
        );
        store
            .update_group(group.id, |g| g.settings.seat_control = SeatControl::BlockOverages)
            .unwrap()
    }

    #[test]
    fn test_guests_ride_free_on_ultimate_only() {
        assert!(!billable_level(Plan::Ultimate, AccessLevel::Guest));
        assert!(billable_level(Plan::Premium, AccessLevel::Guest));
        assert!(billable_level(Plan::Ultimate, AccessLevel::Reporter));
        assert!(!billable_level(Plan::Premium, AccessLevel::MinimalAccess));
    }

    #[test]
    fn test_billable_users_spans_hierarchy_and_dedups() {
        let store = Store::new();
        let root = saas_group(&store, Plan::Premium, 10);
        let sub = store.create_group("dev", "Dev", Visibility::Private, Some(root.id), None);
        let project = store.create_project("app", "App", Visibility::Private, sub.id);

        let alice = store.create_user("alice", "Alice", "a@x.com", false, UserKind::Human);
        let bob = store.create_user("bob", "Bob", "b@x.com", false, UserKind::Human);
        let robot = store.create_user("sa", "SA", "sa@x.com", false, UserKind::ServiceAccount { provisioned_by: root.id });

        add(&store, &alice, MembershipSource::Group(root.id), AccessLevel::Owner);
        add(&store, &alice, MembershipSource::Project(project.id), AccessLevel::Developer);
        add(&store, &bob, MembershipSource::Group(sub.id), AccessLevel::Developer);
        add(&store, &robot, MembershipSource::Group(root.id), AccessLevel::Developer);

        let root = store.group(root.id).unwrap();
        let billable = billable_users(&store, &root);
        assert_eq!(billable.len(), 2);
        assert!(billable.contains(&alice.id));
        assert!(billable.contains(&bob.id));
    }

    #[test]
    fn test_seat_check_blocks_at_capacity() {
        let store = Store::new();
        let ents = Entitlements::default();
        ents.set_saas(true);
        let root = saas_group(&store, Plan::Premium, 1);

        let owner = store.create_user("owner", "Owner", "o@x.com", false, UserKind::Human);
        add(&store, &owner, MembershipSource::Group(root.id), AccessLevel::Owner);

        let stranger = store.create_user("new", "New", "n@x.com", false, UserKind::Human);
        let decision = check_seat(
            &store,
            &ents,
            MembershipSource::Group(root.id),
            true,
            &stranger,
            AccessLevel::Developer,
        );
        assert_eq!(decision, SeatDecision::Reject { message: SEAT_LIMIT_MESSAGE });

        // The same user, already billable, re-admits for free.
        let again = check_seat(
            &store,
            &ents,
            MembershipSource::Group(root.id),
            true,
            &owner,
            AccessLevel::Developer,
        );
        assert_eq!(again, SeatDecision::Admit);
    }

    #[test]
    fn test_seat_check_ignored_off_saas() {
        let store = Store::new();
        let ents = Entitlements::default();
        let root = saas_group(&store, Plan::Premium, 0);
        let user = store.create_user("u", "U", "u@x.com", false, UserKind::Human);

        let decision = check_seat(
            &store,
            &ents,
            MembershipSource::Group(root.id),
            true,
            &user,
            AccessLevel::Developer,
        );
        assert_eq!(decision, SeatDecision::Admit);
    }

    #[test]
    fn test_non_owner_gets_purchase_hint() {
        let store = Store::new();
        let ents = Entitlements::default();
        ents.set_saas(true);
        let root = saas_group(&store, Plan::Premium, 0);
        let user = store.create_user("u", "U", "u@x.com", false, UserKind::Human);

        let decision = check_seat(
            &store,
            &ents,
            MembershipSource::Group(root.id),
            false,
            &user,
            AccessLevel::Developer,
        );
        assert_eq!(
            decision,
            SeatDecision::Reject { message: SEAT_LIMIT_MESSAGE_NON_OWNER }
        );
    }

    #[test]
    fn test_promotion_queueing_targets_new_billable_users() {
        let store = Store::new();
        let ents = Entitlements::default();
        ents.set_instance_plan(Plan::Ultimate);
        ents.set_member_promotion_management(true);

        let group = store.create_group("g", "G", Visibility::Private, None, None);
        let newbie = store.create_user("new", "New", "n@x.com", false, UserKind::Human);
        let veteran = store.create_user("vet", "Vet", "v@x.com", false, UserKind::Human);
        add(&store, &veteran, MembershipSource::Group(group.id), AccessLevel::Developer);

        assert!(should_queue_promotion(&store, &ents, &newbie, AccessLevel::Developer));
        assert!(!should_queue_promotion(&store, &ents, &newbie, AccessLevel::Guest));
        assert!(!should_queue_promotion(&store, &ents, &veteran, AccessLevel::Maintainer));
    }
}
