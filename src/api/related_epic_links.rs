use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;

use crate::api::epics::epic_json;
use crate::api::find_group;
use crate::authz::{self, AccessLevel};
use crate::entitlements::Feature;
use crate::errors::ApiError;
use crate::middleware::auth::{CurrentUser, MaybeUser};
use crate::models::epic::{Epic, LinkType, RelatedEpicLink};
use crate::AppState;

fn require_licensed(state: &AppState) -> Result<(), ApiError> {
    if state.entitlements.licensed(Feature::Epics)
        && state.entitlements.licensed(Feature::RelatedEpics)
    {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// Both ends of a link must be readable; a missing or invisible epic is
/// indistinguishable from one that does not exist.
fn readable_epic(
    state: &AppState,
    user: Option<&CurrentUser>,
    group_id: u64,
    epic_iid: u64,
) -> Result<Epic, ApiError> {
    let group = find_group(state, group_id)?;
    authz::require_group_visible(&state.store, user, &group)?;
    state
        .store
        .epic_by_iid(group.id, epic_iid)
        .filter(|e| {
            !e.confidential
                || user
                    .map(|u| {
                        u.admin_mode()
                            || e.author_id == u.user.id
                            || authz::group_access(&state.store, u.user.id, e.group_id)
                                >= Some(AccessLevel::Reporter)
                    })
                    .unwrap_or(false)
        })
        .ok_or(ApiError::NotFound("Epic"))
}

/// The opposite end of the link plus the edge metadata, seen from
/// `epic`'s side.
fn link_json(state: &AppState, epic: &Epic, link: &RelatedEpicLink) -> serde_json::Value {
    let (other_id, link_type) = if link.source_epic_id == epic.id {
        (link.target_epic_id, link.link_type)
    } else {
        (link.source_epic_id, link.link_type.inverse())
    };
    let other = state.store.epic(other_id);
    let mut body = match other {
        Some(e) => serde_json::to_value(epic_json(&state.store, &e)).unwrap_or_default(),
        None => json!({}),
    };
    body["related_epic_link_id"] = json!(link.id);
    body["link_type"] = json!(link_type);
    body["link_created_at"] = json!(link.created_at);
    body
}

/// GET /groups/:id/epics/:epic_iid/related_epics
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, epic_iid)): Path<(u64, u64)>,
) -> Result<Json<Vec<serde_json::Value>>, ApiError> {
    require_licensed(&state)?;
    let epic = readable_epic(&state, user.as_ref(), id, epic_iid)?;

    let mut links = state.store.epic_links_of(epic.id);
    links.sort_by_key(|l| l.id);
    let body = links
        .iter()
        .filter(|l| {
            // Hide edges whose far end the caller cannot read.
            let other = if l.source_epic_id == epic.id {
                l.target_epic_id
            } else {
                l.source_epic_id
            };
            state
                .store
                .epic(other)
                .map(|e| readable_epic(&state, user.as_ref(), e.group_id, e.iid).is_ok())
                .unwrap_or(false)
        })
        .map(|l| link_json(&state, &epic, l))
        .collect();
    Ok(Json(body))
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkParams {
    pub target_group_id: u64,
    pub target_epic_iid: u64,
    pub link_type: Option<String>,
}

/// POST /groups/:id/epics/:epic_iid/related_epics
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, epic_iid)): Path<(u64, u64)>,
    Json(params): Json<CreateLinkParams>,
) -> Result<Response, ApiError> {
    require_licensed(&state)?;
    authz::require_user(user.as_ref())?;
    let source = readable_epic(&state, user.as_ref(), id, epic_iid)?;
    let target = readable_epic(
        &state,
        user.as_ref(),
        params.target_group_id,
        params.target_epic_iid,
    )?;

    let link_type = match params.link_type.as_deref() {
        None | Some("relates_to") => LinkType::RelatesTo,
        Some("blocks") => LinkType::Blocks,
        Some("is_blocked_by") => LinkType::IsBlockedBy,
        Some(other) => {
            return Err(ApiError::BadRequest(format!(
                "link_type does not have a valid value: {}",
                other
            )))
        }
    };

    if source.id == target.id {
        return Err(ApiError::Unprocessable(
            "an epic cannot be related to itself".into(),
        ));
    }
    if state.store.epic_link_between(source.id, target.id).is_some() {
        return Err(ApiError::Conflict("epics are already related".into()));
    }

    let link = state.store.add_epic_link(RelatedEpicLink {
        id: 0,
        source_epic_id: source.id,
        target_epic_id: target.id,
        link_type,
        created_at: Utc::now(),
    });

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": link.id,
            "source_epic": epic_json(&state.store, &source),
            "target_epic": epic_json(&state.store, &target),
            "link_type": link.link_type,
            "created_at": link.created_at,
        })),
    )
        .into_response())
}

/// DELETE /groups/:id/epics/:epic_iid/related_epics/:link_id — returns
/// the removed link.
pub async fn destroy(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, epic_iid, link_id)): Path<(u64, u64, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_licensed(&state)?;
    authz::require_user(user.as_ref())?;
    let epic = readable_epic(&state, user.as_ref(), id, epic_iid)?;

    let link = state
        .store
        .epic_link(link_id)
        .filter(|l| l.source_epic_id == epic.id || l.target_epic_id == epic.id)
        .ok_or(ApiError::NotFound("Epic Link"))?;

    let body = link_json(&state, &epic, &link);
    state.store.remove_epic_link(link.id);
    Ok(Json(body))
}
