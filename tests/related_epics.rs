//! Related-epic links: license gating, cross-group visibility, duplicate
//! and self-link rejection.

mod common;

use axum::http::StatusCode;
use serde_json::json;

use common::{app, TestApp};
use gatehouse::authz::AccessLevel;
use gatehouse::entitlements::Feature;
use gatehouse::models::epic::Epic;
use gatehouse::models::group::{Group, Visibility};
use gatehouse::models::member::MembershipSource;
use gatehouse::models::user::User;

fn setup(app: &TestApp) -> (Group, User, String, Epic, Epic) {
    app.state
        .entitlements
        .license_all(&[Feature::Epics, Feature::RelatedEpics]);
    let group = app.group("acme", Visibility::Public);
    let (dev, token) = app.user("dev", false);
    app.add_member(&dev, MembershipSource::Group(group.id), AccessLevel::Developer);
    let a = app.state.store.create_epic(group.id, dev.id, |e| e.title = "alpha".into());
    let b = app.state.store.create_epic(group.id, dev.id, |e| e.title = "beta".into());
    (group, dev, token, a, b)
}

#[tokio::test]
async fn test_requires_related_epics_license() {
    let app = app();
    app.state.entitlements.set_licensed(Feature::Epics, true);
    let group = app.group("acme", Visibility::Public);
    let (dev, token) = app.user("dev", false);
    let epic = app.state.store.create_epic(group.id, dev.id, |e| e.title = "solo".into());

    let (status, _, _) = app
        .get(
            &format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, epic.iid),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_create_list_and_delete_link() {
    let app = app();
    let (group, _dev, token, a, b) = setup(&app);

    let base = format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, a.iid);
    let (status, _, body) = app
        .request(
            "POST",
            &base,
            Some(&token),
            Some(json!({
                "target_group_id": group.id,
                "target_epic_iid": b.iid,
                "link_type": "blocks",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["link_type"], "blocks");
    let link_id = body["id"].as_u64().unwrap();

    // Listed from the source side with the declared type.
    let (_, _, body) = app.get(&base, Some(&token)).await;
    assert_eq!(body.as_array().unwrap().len(), 1);
    assert_eq!(body[0]["id"].as_u64().unwrap(), b.id);
    assert_eq!(body[0]["link_type"], "blocks");
    assert_eq!(body[0]["related_epic_link_id"].as_u64().unwrap(), link_id);

    // Seen from the target, the type inverts.
    let from_target = format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, b.iid);
    let (_, _, body) = app.get(&from_target, Some(&token)).await;
    assert_eq!(body[0]["id"].as_u64().unwrap(), a.id);
    assert_eq!(body[0]["link_type"], "is_blocked_by");

    // Duplicate (either direction) conflicts.
    let (status, _, _) = app
        .request(
            "POST",
            &from_target,
            Some(&token),
            Some(json!({ "target_group_id": group.id, "target_epic_iid": a.iid })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Delete returns the removed link.
    let (status, _, _) = app
        .request("DELETE", &format!("{}/{}", base, link_id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let (_, _, body) = app.get(&base, Some(&token)).await;
    assert!(body.as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_self_link_is_unprocessable() {
    let app = app();
    let (group, _dev, token, a, _b) = setup(&app);

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, a.iid),
            Some(&token),
            Some(json!({ "target_group_id": group.id, "target_epic_iid": a.iid })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_invisible_target_is_not_found() {
    let app = app();
    let (group, _dev, token, a, _b) = setup(&app);

    // A private group the caller has no membership in.
    let private = app.group("private", Visibility::Private);
    let (outsider, _) = app.user("outsider", false);
    app.add_member(&outsider, MembershipSource::Group(private.id), AccessLevel::Owner);
    let hidden = app
        .state
        .store
        .create_epic(private.id, outsider.id, |e| e.title = "hidden".into());

    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, a.iid),
            Some(&token),
            Some(json!({ "target_group_id": private.id, "target_epic_iid": hidden.iid })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // An unknown link type is a parameter error.
    let (status, _, _) = app
        .request(
            "POST",
            &format!("/api/v4/groups/{}/epics/{}/related_epics", group.id, a.iid),
            Some(&token),
            Some(json!({
                "target_group_id": group.id,
                "target_epic_iid": a.iid,
                "link_type": "entangles",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}
