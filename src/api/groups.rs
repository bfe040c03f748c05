use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::api::find_group;
use crate::authz::{self, AccessLevel};
use crate::entitlements::Feature;
use crate::errors::ApiError;
use crate::middleware::auth::MaybeUser;
use crate::models::audit::EntityType;
use crate::models::group::{Group, SeatControl, Visibility};
use crate::models::member::GroupLink;
use crate::AppState;

/// Licensed-only attributes are omitted from the payload entirely, not
/// nulled: clients on unlicensed instances never see the key.
fn group_json(state: &AppState, group: &Group) -> serde_json::Value {
    let mut body = json!({
        "id": group.id,
        "path": group.path,
        "name": group.name,
        "visibility": group.visibility,
        "parent_id": group.parent_id,
        "seat_control": group.settings.seat_control,
        "created_at": group.created_at,
    });
    if state.entitlements.licensed(Feature::CustomFileTemplates) {
        body["file_template_project_id"] = json!(group.settings.file_template_project_id);
    }
    body
}

/// GET /groups/:id
pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group = find_group(&state, id)?;
    authz::require_group_visible(&state.store, user.as_ref(), &group)?;
    Ok(Json(group_json(&state, &group)))
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateGroupParams {
    pub name: Option<String>,
    pub visibility: Option<Visibility>,
    pub seat_control: Option<SeatControl>,
    pub service_account_creation_by_owners: Option<bool>,
    pub file_template_project_id: Option<u64>,
}

/// PUT /groups/:id — owners only; maintainers are refused.
pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<UpdateGroupParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let group = find_group(&state, id)?;
    let current = authz::require_user(user.as_ref())?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;

    let file_template_licensed = state.entitlements.licensed(Feature::CustomFileTemplates);
    let updated = state
        .store
        .update_group(group.id, |g| {
            if let Some(name) = &params.name {
                g.name = name.clone();
            }
            if let Some(v) = params.visibility {
                g.visibility = v;
            }
            if let Some(sc) = params.seat_control {
                g.settings.seat_control = sc;
            }
            if let Some(allow) = params.service_account_creation_by_owners {
                g.settings.service_account_creation_by_owners = allow;
            }
            // Ignored, not rejected, without the license.
            if file_template_licensed {
                if let Some(pid) = params.file_template_project_id {
                    g.settings.file_template_project_id = Some(pid);
                }
            }
        })
        .ok_or(ApiError::NotFound("Group"))?;

    state.store.record_audit(
        current.user.id,
        EntityType::Group,
        group.id,
        json!({ "change": "group_settings" }),
        None,
    );

    Ok(Json(group_json(&state, &updated)))
}

#[derive(Debug, Deserialize)]
pub struct ShareParams {
    pub group_id: u64,
    pub group_access: u8,
    pub member_role_id: Option<u64>,
}

/// POST /groups/:id/share — members of the invited group gain access
/// here, capped at `group_access`.
pub async fn share(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<ShareParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    let current = authz::require_user(user.as_ref())?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;

    let access = AccessLevel::from_u8(params.group_access)
        .ok_or_else(|| ApiError::BadRequest("group_access does not have a valid value".into()))?;

    if params.group_id == group.id {
        return Err(ApiError::BadRequest("cannot share a group with itself".into()));
    }
    let invited = state
        .store
        .group(params.group_id)
        .ok_or(ApiError::NotFound("Group"))?;
    authz::require_group_visible(&state.store, user.as_ref(), &invited)?;

    if state.store.group_link(group.id, invited.id).is_some() {
        return Err(ApiError::Conflict(
            "The group has already been shared with this group".into(),
        ));
    }

    let member_role_id = match params.member_role_id {
        Some(role_id) if state.entitlements.licensed(Feature::CustomRoles) => {
            let role = state
                .store
                .member_role(role_id)
                .ok_or_else(|| ApiError::validation("member_role", &["not found"]))?;
            if let Some(ns) = role.namespace {
                let root = state.store.root_ancestor(group.id).map(|g| g.id);
                if root != Some(ns) {
                    return Err(ApiError::validation("member_role", &["not found"]));
                }
            }
            if role.base_access_level != access {
                return Err(ApiError::validation(
                    "member_role_id",
                    &["the custom role's base access level does not match the current access level"],
                ));
            }
            Some(role.id)
        }
        _ => None,
    };

    let link = state.store.add_group_link(GroupLink {
        id: 0,
        shared_group: group.id,
        invited_group: invited.id,
        access,
        member_role_id,
        created_at: chrono::Utc::now(),
    });

    state.store.record_audit(
        current.user.id,
        EntityType::Group,
        group.id,
        json!({ "add": "group_share", "shared_with_group_id": invited.id }),
        None,
    );

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": link.id,
            "group_id": link.invited_group,
            "group_access": link.access,
            "member_role_id": link.member_role_id,
        })),
    )
        .into_response())
}

/// DELETE /groups/:id/share/:group_id
pub async fn unshare(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, shared_with)): Path<(u64, u64)>,
) -> Result<StatusCode, ApiError> {
    let group = find_group(&state, id)?;
    let current = authz::require_user(user.as_ref())?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;

    if !state.store.remove_group_link(group.id, shared_with) {
        return Err(ApiError::NotFound("Group Link"));
    }

    state.store.record_audit(
        current.user.id,
        EntityType::Group,
        group.id,
        json!({ "remove": "group_share", "shared_with_group_id": shared_with }),
        None,
    );
    Ok(StatusCode::NO_CONTENT)
}
