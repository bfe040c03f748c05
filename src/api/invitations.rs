use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::members::{
    actor_is_root_owner, group_source, parse_expires_at, project_source, require_manage,
    validate_access_level, ListMembersParams, SourceRef, UserIdList,
};
use crate::authz::{self, AccessLevel};
use crate::errors::ApiError;
use crate::middleware::auth::{CurrentUser, MaybeUser};
use crate::models::group::SeatControl;
use crate::models::member::{Invitation, Member, MembershipSource, MemberState};
use crate::pagination::{offset_headers, offset_page, PageParams};
use crate::quota::{self, SeatDecision};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct InvitationJson {
    pub id: u64,
    pub invite_email: String,
    pub access_level: AccessLevel,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct CreateInvitationsParams {
    pub email: Option<String>,
    pub user_id: Option<UserIdList>,
    pub access_level: u8,
    pub expires_at: Option<String>,
}

/// Seat check for an email invite: the invitee has no account yet, so a
/// rejection depends only on capacity.
fn email_seat_rejection(
    state: &AppState,
    source: &SourceRef,
    actor_owner: bool,
    access_level: AccessLevel,
) -> Option<&'static str> {
    if !state.entitlements.saas() {
        return None;
    }
    let root = match source.source {
        MembershipSource::Group(gid) => state.store.root_ancestor(gid)?,
        MembershipSource::Project(pid) => {
            let project = state.store.project(pid)?;
            state.store.root_ancestor(project.group_id)?
        }
    };
    let subscription = root.subscription?;
    if root.settings.seat_control != SeatControl::BlockOverages {
        return None;
    }
    if !quota::billable_level(subscription.plan, access_level) {
        return None;
    }
    if quota::seats_in_use(&state.store, &root) + 1 <= subscription.seats {
        None
    } else {
        Some(if actor_owner {
            quota::SEAT_LIMIT_MESSAGE
        } else {
            quota::SEAT_LIMIT_MESSAGE_NON_OWNER
        })
    }
}

/// Admission loop shared by the group and project invitation endpoints.
/// Mirrors the members endpoint: exact-K admission, per-identifier error
/// reporting, promotion queueing.
fn invite(
    state: &AppState,
    current: &CurrentUser,
    source: &SourceRef,
    params: &CreateInvitationsParams,
) -> Result<Response, ApiError> {
    let access_level = validate_access_level(params.access_level)?;
    let expires_at = parse_expires_at(params.expires_at.as_deref())?;

    let emails: Vec<String> = params
        .email
        .as_deref()
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();
    let user_ids: Vec<u64> = params.user_id.clone().map(|l| l.0).unwrap_or_default();

    if emails.is_empty() && user_ids.is_empty() {
        return Err(ApiError::BadRequest("email, user_id are missing, exactly one parameter must be provided".into()));
    }

    let actor_owner = actor_is_root_owner(state, current, source);
    let mut errors: BTreeMap<String, String> = BTreeMap::new();
    let mut queued: BTreeMap<String, String> = BTreeMap::new();
    let mut seat_rejection = false;
    let invited_total = emails.len() + user_ids.len();

    for uid in &user_ids {
        let user = match state.store.user(*uid) {
            Some(u) if u.active() => u,
            _ => {
                errors.insert(uid.to_string(), "User not found".into());
                continue;
            }
        };
        if state.store.find_member(source.source, user.id).is_some() {
            errors.insert(user.username.clone(), "Member already exists".into());
            continue;
        }
        match quota::check_seat(
            &state.store,
            &state.entitlements,
            source.source,
            actor_owner,
            &user,
            access_level,
        ) {
            SeatDecision::Reject { message } => {
                state.metrics.seat_rejections.inc();
                seat_rejection = true;
                errors.insert(user.username.clone(), message.to_string());
                continue;
            }
            SeatDecision::Admit => {}
        }

        let member_state =
            if quota::should_queue_promotion(&state.store, &state.entitlements, &user, access_level) {
                queued.insert(user.username.clone(), quota::PROMOTION_QUEUED_MESSAGE.into());
                MemberState::Awaiting
            } else {
                MemberState::Active
            };

        state.store.add_member(Member {
            user_id: user.id,
            source: source.source,
            access_level,
            member_role_id: None,
            state: member_state,
            expires_at,
            created_at: Utc::now(),
        });
        state.metrics.members_added.inc();
        state.store.record_audit(
            current.user.id,
            source.entity.0,
            source.entity.1,
            json!({ "add": "user_access", "member_id": user.id }),
            None,
        );
    }

    for email in &emails {
        if state.store.find_invitation(source.source, email).is_some() {
            errors.insert(email.clone(), "Member already invited".into());
            continue;
        }
        if let Some(user) = state.store.user_by_email(email) {
            if state.store.find_member(source.source, user.id).is_some() {
                errors.insert(email.clone(), "Member already exists".into());
                continue;
            }
        }
        if let Some(message) = email_seat_rejection(state, source, actor_owner, access_level) {
            state.metrics.seat_rejections.inc();
            seat_rejection = true;
            errors.insert(email.clone(), message.to_string());
            continue;
        }

        state.store.add_invitation(Invitation {
            id: 0,
            source: source.source,
            email: email.clone(),
            access_level,
            created_by: current.user.id,
            created_at: Utc::now(),
        });
        state.store.record_audit(
            current.user.id,
            source.entity.0,
            source.entity.1,
            json!({ "add": "invitation", "invite_email": email }),
            None,
        );
    }

    let mut body = serde_json::Map::new();
    if errors.is_empty() {
        body.insert("status".into(), json!("success"));
    } else {
        body.insert("status".into(), json!("error"));
        if errors.len() == 1 && invited_total == 1 && seat_rejection {
            let message = errors.values().next().cloned().unwrap_or_default();
            body.insert("message".into(), json!(message));
        } else {
            body.insert("message".into(), json!(errors));
        }
        if seat_rejection {
            body.insert("reason".into(), json!(quota::SEAT_LIMIT_REASON));
        }
    }
    if !queued.is_empty() {
        body.insert("queued_users".into(), json!(queued));
    }

    Ok((StatusCode::CREATED, Json(serde_json::Value::Object(body))).into_response())
}

pub async fn create_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<CreateInvitationsParams>,
) -> Result<Response, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    invite(&state, current, &source, &params)
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<CreateInvitationsParams>,
) -> Result<Response, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    invite(&state, current, &source, &params)
}

fn list_invitations(
    state: &AppState,
    source: &SourceRef,
    params: &ListMembersParams,
    base_path: &str,
) -> Result<Response, ApiError> {
    let mut rows = state.store.invitations_of(source.source);
    rows.sort_by_key(|i| i.id);

    let page_params = PageParams {
        page: params.page,
        per_page: params.per_page,
        ..Default::default()
    };
    let (page, info) = offset_page(&rows, &page_params);
    let body: Vec<InvitationJson> = page
        .iter()
        .map(|i| InvitationJson {
            id: i.id,
            invite_email: i.email.clone(),
            access_level: i.access_level,
            created_at: i.created_at,
        })
        .collect();
    let mut response = Json(body).into_response();
    offset_headers(
        response.headers_mut(),
        &format!("{}{}", state.config.base_url, base_path),
        &[],
        &info,
    );
    Ok(response)
}

pub async fn list_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListMembersParams>,
) -> Result<Response, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    require_manage(&state, user.as_ref(), &source)?;
    list_invitations(&state, &source, &params, &format!("/api/v4/groups/{}/invitations", id))
}

pub async fn list_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListMembersParams>,
) -> Result<Response, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    require_manage(&state, user.as_ref(), &source)?;
    list_invitations(&state, &source, &params, &format!("/api/v4/projects/{}/invitations", id))
}

fn destroy_invitation(
    state: &AppState,
    user: Option<&CurrentUser>,
    source: &SourceRef,
    email: &str,
) -> Result<StatusCode, ApiError> {
    let current = authz::require_user(user)?;
    require_manage(state, user, source)?;

    if !state.store.remove_invitation(source.source, email) {
        return Err(ApiError::NotFound("Invitation"));
    }
    state.store.record_audit(
        current.user.id,
        source.entity.0,
        source.entity.1,
        json!({ "remove": "invitation", "invite_email": email }),
        None,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn destroy_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, email)): Path<(u64, String)>,
) -> Result<StatusCode, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    destroy_invitation(&state, user.as_ref(), &source, &email)
}

pub async fn destroy_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, email)): Path<(u64, String)>,
) -> Result<StatusCode, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    destroy_invitation(&state, user.as_ref(), &source, &email)
}
