//! Membership and invitation flows: seat enforcement (exact-K batch
//! admission), promotion queueing, minimal access, and custom roles.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::app;
use gatehouse::authz::AccessLevel;
use gatehouse::entitlements::Feature;
use gatehouse::models::group::{Plan, Visibility};
use gatehouse::models::member::MembershipSource;
use gatehouse::quota;

#[tokio::test]
async fn test_add_single_member_succeeds() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "status": "success" }));
    assert!(app
        .state
        .store
        .find_member(MembershipSource::Group(group.id), newbie.id)
        .is_some());
}

#[tokio::test]
async fn test_add_member_requires_owner_and_auth() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (maintainer, maintainer_token) = app.user("maintainer", false);
    app.add_member(&maintainer, MembershipSource::Group(group.id), AccessLevel::Maintainer);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&maintainer_token),
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            None,
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;
    // The group is private and the caller anonymous.
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_invalid_access_level_is_rejected() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({ "user_id": newbie.id, "access_level": 17 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_seat_limit_rejects_with_structured_error() {
    let app = app();
    app.state.entitlements.set_saas(true);
    let group = app.saas_group("acme", Plan::Premium, 1);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body,
        json!({
            "status": "error",
            "message": "There are not enough available seats to invite this many users.",
            "reason": "seat_limit_exceeded_error",
        })
    );
    assert!(app
        .state
        .store
        .find_member(MembershipSource::Group(group.id), newbie.id)
        .is_none());
}

#[tokio::test]
async fn test_non_owner_seat_message_suggests_purchase() {
    let app = app();
    app.state.entitlements.set_saas(true);
    let group = app.saas_group("acme", Plan::Premium, 1);
    let project = app
        .state
        .store
        .create_project("app", "app", Visibility::Private, group.id);
    let (owner, _) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (maintainer, maintainer_token) = app.user("maintainer", false);
    app.add_member(&maintainer, MembershipSource::Project(project.id), AccessLevel::Maintainer);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/projects/{}/members", project.id),
            Some(&maintainer_token),
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "error");
    assert_eq!(body["reason"], "seat_limit_exceeded_error");
    assert!(body["message"]
        .as_str()
        .unwrap()
        .contains("Ask a user with the Owner role to purchase more seats"));
}

#[tokio::test]
async fn test_batch_admits_exactly_the_seats_that_fit() {
    let app = app();
    app.state.entitlements.set_saas(true);
    // Three seats; the owner consumes one, so exactly two invitees fit.
    let group = app.saas_group("acme", Plan::Premium, 3);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (u1, _) = app.user("u1", false);
    let (u2, _) = app.user("u2", false);
    let (u3, _) = app.user("u3", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({
                "user_id": format!("{},{},{}", u1.id, u2.id, u3.id),
                "access_level": 30,
            })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "error");
    assert_eq!(body["reason"], "seat_limit_exceeded_error");
    // Exactly the overflow user is reported, keyed by username.
    assert_eq!(
        body["message"],
        json!({ "u3": quota::SEAT_LIMIT_MESSAGE })
    );

    let source = MembershipSource::Group(group.id);
    assert!(app.state.store.find_member(source, u1.id).is_some());
    assert!(app.state.store.find_member(source, u2.id).is_some());
    assert!(app.state.store.find_member(source, u3.id).is_none());
}

#[tokio::test]
async fn test_already_billable_user_admits_for_free() {
    let app = app();
    app.state.entitlements.set_saas(true);
    let group = app.saas_group("acme", Plan::Premium, 2);
    let project = app
        .state
        .store
        .create_project("app", "app", Visibility::Private, group.id);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (dev, _) = app.user("dev", false);
    app.add_member(&dev, MembershipSource::Group(group.id), AccessLevel::Developer);

    // Both seats are taken, but dev already holds one.
    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/projects/{}/members", project.id),
            Some(&owner_token),
            Some(json!({ "user_id": dev.id, "access_level": 40 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "status": "success" }));
}

#[tokio::test]
async fn test_minimal_access_gated_by_license() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (minimal, _) = app.user("minimal", false);
    app.add_member(&minimal, MembershipSource::Group(group.id), AccessLevel::MinimalAccess);

    let path = format!("/api/v4/groups/{}/members", group.id);

    // Licensed: the member is listed.
    app.state.entitlements.set_licensed(Feature::MinimalAccessRole, true);
    let (_, _, body) = app.get(&path, Some(&owner_token)).await;
    let ids: Vec<u64> = body.as_array().unwrap().iter().map(|m| m["id"].as_u64().unwrap()).collect();
    assert!(ids.contains(&minimal.id));

    // Unlicensed: filtered out, and the singular read hides it too.
    app.state.entitlements.set_licensed(Feature::MinimalAccessRole, false);
    let (_, _, body) = app.get(&path, Some(&owner_token)).await;
    let ids: Vec<u64> = body.as_array().unwrap().iter().map(|m| m["id"].as_u64().unwrap()).collect();
    assert!(!ids.contains(&minimal.id));
    let (status, _, _) = app
        .get(&format!("{}/{}", path, minimal.id), Some(&owner_token))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Granting minimal access without the license is a validation error.
    let (stranger, _) = app.user("stranger", false);
    let (status, _, body) = app
        .request(
            "POST",
            &path,
            Some(&owner_token),
            Some(json!({ "user_id": stranger.id, "access_level": 5 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"]["access_level"][0], "is not included in the list");
}

#[tokio::test]
async fn test_member_role_assignment_rules() {
    let app = app();
    app.state.entitlements.set_licensed(Feature::CustomRoles, true);
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (guest, _) = app.user("guest", false);
    app.add_member(&guest, MembershipSource::Group(group.id), AccessLevel::Guest);

    let role = app
        .state
        .store
        .create_member_role(Some(group.id), "incident responder", AccessLevel::Guest);
    let path = format!("/api/v4/groups/{}/members/{}", group.id, guest.id);

    // Matching root group and base level: assigned and exposed.
    let (status, _, body) = app
        .request(
            "PUT",
            &path,
            Some(&owner_token),
            Some(json!({ "access_level": 10, "member_role_id": role.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["member_role"]["id"].as_u64().unwrap(), role.id);

    // Explicit null unsets it.
    let (status, _, body) = app
        .request(
            "PUT",
            &path,
            Some(&owner_token),
            Some(json!({ "access_level": 20, "member_role_id": null })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["member_role"], json!(null));

    // A role anchored in a foreign group reads as not found.
    let foreign_group = app.group("other", Visibility::Private);
    let foreign = app
        .state
        .store
        .create_member_role(Some(foreign_group.id), "other role", AccessLevel::Guest);
    let (status, _, body) = app
        .request(
            "PUT",
            &path,
            Some(&owner_token),
            Some(json!({ "access_level": 10, "member_role_id": foreign.id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"]["member_role"][0], "not found");

    // Base access level mismatch.
    let (status, _, body) = app
        .request(
            "PUT",
            &path,
            Some(&owner_token),
            Some(json!({ "access_level": 30, "member_role_id": role.id })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["message"]["member_role_id"][0]
        .as_str()
        .unwrap()
        .contains("base access level"));

    // Instance-level roles are assignable anywhere.
    let instance_role = app
        .state
        .store
        .create_member_role(None, "instance guest", AccessLevel::Guest);
    let (status, _, body) = app
        .request(
            "PUT",
            &path,
            Some(&owner_token),
            Some(json!({ "access_level": 10, "member_role_id": instance_role.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["member_role"]["id"].as_u64().unwrap(), instance_role.id);
}

#[tokio::test]
async fn test_member_role_ignored_without_license() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (guest, _) = app.user("guest", false);
    app.add_member(&guest, MembershipSource::Group(group.id), AccessLevel::Guest);
    let role = app
        .state
        .store
        .create_member_role(Some(group.id), "unused", AccessLevel::Guest);

    let (status, _, body) = app
        .request(
            "PUT",
            &format!("/api/v4/groups/{}/members/{}", group.id, guest.id),
            Some(&owner_token),
            Some(json!({ "access_level": 10, "member_role_id": role.id })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["member_role"], json!(null));
}

#[tokio::test]
async fn test_promotion_management_queues_new_billable_users() {
    let app = app();
    app.state.entitlements.set_instance_plan(Plan::Ultimate);
    app.state.entitlements.set_member_promotion_management(true);
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (newbie, _) = app.user("newbie", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({ "user_id": newbie.id, "access_level": 30 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body,
        json!({
            "status": "success",
            "queued_users": { "newbie": "Request queued for administrator approval." },
        })
    );
    let member = app
        .state
        .store
        .find_member(MembershipSource::Group(group.id), newbie.id)
        .unwrap();
    assert_eq!(
        serde_json::to_value(member.state).unwrap(),
        json!("awaiting")
    );

    // A guest is not billable on ultimate and lands directly.
    let (guest, _) = app.user("guestuser", false);
    let (_, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/members", group.id),
            Some(&owner_token),
            Some(json!({ "user_id": guest.id, "access_level": 10 })),
        )
        .await;
    assert_eq!(body, json!({ "status": "success" }));
}

#[tokio::test]
async fn test_last_owner_cannot_be_demoted_or_removed() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);

    let path = format!("/api/v4/groups/{}/members/{}", group.id, owner.id);
    let (status, _, _) = app
        .request("PUT", &path, Some(&owner_token), Some(json!({ "access_level": 30 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _, _) = app.request("DELETE", &path, Some(&owner_token), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // With a second owner both operations go through.
    let (second, _) = app.user("second", false);
    app.add_member(&second, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (status, _, _) = app.request("DELETE", &path, Some(&owner_token), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn test_member_state_endpoint_is_saas_only() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (dev, _) = app.user("dev", false);
    app.add_member(&dev, MembershipSource::Group(group.id), AccessLevel::Developer);

    let path = format!("/api/v4/groups/{}/members/{}/state", group.id, dev.id);

    let (status, _, _) = app
        .request("PUT", &path, Some(&owner_token), Some(json!({ "state": "awaiting" })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    app.state.entitlements.set_saas(true);
    let (status, _, body) = app
        .request("PUT", &path, Some(&owner_token), Some(json!({ "state": "awaiting" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "awaiting");

    let (status, _, _) = app
        .request("PUT", &path, Some(&owner_token), Some(json!({ "state": "limbo" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_billable_members_listing() {
    let app = app();
    app.state.entitlements.set_saas(true);
    let group = app.saas_group("acme", Plan::Ultimate, 10);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (dev, _) = app.user("dev", false);
    app.add_member(&dev, MembershipSource::Group(group.id), AccessLevel::Developer);
    let (guest, _) = app.user("guest", false);
    app.add_member(&guest, MembershipSource::Group(group.id), AccessLevel::Guest);

    let (status, _, body) = app
        .get(&format!("/api/v4/groups/{}/billable_members", group.id), Some(&owner_token))
        .await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<u64> = body.as_array().unwrap().iter().map(|m| m["id"].as_u64().unwrap()).collect();
    // Guests are free on ultimate.
    assert_eq!(ids, vec![owner.id, dev.id]);
}

// ── Invitations ──────────────────────────────────────────────────

#[tokio::test]
async fn test_email_invitation_roundtrip() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);

    let base = format!("/api/v4/groups/{}/invitations", group.id);
    let (status, _, body) = app
        .request(
            "POST",
            &base,
            Some(&owner_token),
            Some(json!({ "email": "guy@example.org", "access_level": 30 })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, json!({ "status": "success" }));

    let (_, _, body) = app.get(&base, Some(&owner_token)).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["invite_email"], "guy@example.org");

    // Re-inviting the same address reports per identifier.
    let (_, _, body) = app
        .request(
            "POST",
            &base,
            Some(&owner_token),
            Some(json!({ "email": "guy@example.org", "access_level": 30 })),
        )
        .await;
    assert_eq!(body["status"], "error");
    assert_eq!(body["message"]["guy@example.org"], "Member already invited");

    let (status, _, _) = app
        .request("DELETE", &format!("{}/guy@example.org", base), Some(&owner_token), None)
        .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _, _) = app
        .request("DELETE", &format!("{}/guy@example.org", base), Some(&owner_token), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_email_invite_blocked_by_seat_limit() {
    let app = app();
    app.state.entitlements.set_saas(true);
    let group = app.saas_group("acme", Plan::Premium, 1);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/invitations", group.id),
            Some(&owner_token),
            Some(json!({ "email": "guy@example.com", "access_level": 30 })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body,
        json!({
            "status": "error",
            "message": "There are not enough available seats to invite this many users.",
            "reason": "seat_limit_exceeded_error",
        })
    );
    assert!(app
        .state
        .store
        .find_invitation(MembershipSource::Group(group.id), "guy@example.com")
        .is_none());
}

#[tokio::test]
async fn test_invitations_require_a_recipient() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/invitations", group.id),
            Some(&owner_token),
            Some(json!({ "access_level": 30 })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_mixed_invitation_reports_each_identifier() {
    let app = app();
    let group = app.group("acme", Visibility::Private);
    let (owner, owner_token) = app.user("owner", false);
    app.add_member(&owner, MembershipSource::Group(group.id), AccessLevel::Owner);
    let (dev, _) = app.user("dev", false);
    app.add_member(&dev, MembershipSource::Group(group.id), AccessLevel::Developer);
    let (fresh, _) = app.user("fresh", false);

    let (status, _, body) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/invitations", group.id),
            Some(&owner_token),
            Some(json!({
                "user_id": format!("{},{}", dev.id, fresh.id),
                "email": "new@example.org",
                "access_level": 20,
            })),
        )
        .await;

    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "error");
    // The existing member fails, the others land.
    assert_eq!(body["message"]["dev"], "Member already exists");
    assert!(app
        .state
        .store
        .find_member(MembershipSource::Group(group.id), fresh.id)
        .is_some());
    assert!(app
        .state
        .store
        .find_invitation(MembershipSource::Group(group.id), "new@example.org")
        .is_some());
}
