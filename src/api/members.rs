use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;

use crate::api::{find_group, find_project};
use crate::authz::{self, AccessLevel};
use crate::entitlements::Feature;
use crate::errors::ApiError;
use crate::middleware::auth::{CurrentUser, MaybeUser};
use crate::models::audit::EntityType;
use crate::models::group::Group;
use crate::models::member::{Member, MembershipSource, MemberState};
use crate::models::user::{User, UserState};
use crate::pagination::{offset_headers, offset_page, PageParams};
use crate::quota::{self, SeatDecision};
use crate::AppState;

// ── Wire shapes ──────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct MemberRoleJson {
    pub id: u64,
    pub name: String,
    pub base_access_level: AccessLevel,
}

#[derive(Debug, Serialize)]
pub struct MemberJson {
    pub id: u64,
    pub username: String,
    pub name: String,
    pub state: MemberState,
    pub access_level: AccessLevel,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    pub member_role: Option<MemberRoleJson>,
}

fn member_json(state: &AppState, member: &Member, user: &User) -> MemberJson {
    let member_role = member
        .member_role_id
        .and_then(|id| state.store.member_role(id))
        .map(|r| MemberRoleJson {
            id: r.id,
            name: r.name,
            base_access_level: r.base_access_level,
        });
    MemberJson {
        id: user.id,
        username: user.username.clone(),
        name: user.name.clone(),
        state: member.state,
        access_level: member.access_level,
        expires_at: member.expires_at,
        created_at: member.created_at,
        member_role,
    }
}

/// `user_id` arrives as a number or a comma-separated string.
#[derive(Debug, Clone)]
pub struct UserIdList(pub Vec<u64>);

impl<'de> Deserialize<'de> for UserIdList {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            One(u64),
            Many(String),
        }
        match Raw::deserialize(deserializer)? {
            Raw::One(id) => Ok(UserIdList(vec![id])),
            Raw::Many(s) => {
                let ids = s
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(|p| p.parse::<u64>().map_err(|_| D::Error::custom("user_id is invalid")))
                    .collect::<Result<Vec<u64>, _>>()?;
                Ok(UserIdList(ids))
            }
        }
    }
}

// ── Source plumbing ──────────────────────────────────────────────

/// The two membership sources share every code path below; this carries
/// the little that differs.
pub(crate) struct SourceRef {
    pub source: MembershipSource,
    pub entity: (EntityType, u64),
    /// Level required to manage members here.
    pub manage_level: AccessLevel,
    pub group: Option<Group>,
}

pub(crate) fn group_source(
    state: &AppState,
    user: Option<&CurrentUser>,
    id: u64,
) -> Result<SourceRef, ApiError> {
    let group = find_group(state, id)?;
    authz::require_group_visible(&state.store, user, &group)?;
    Ok(SourceRef {
        source: MembershipSource::Group(group.id),
        entity: (EntityType::Group, group.id),
        manage_level: AccessLevel::Owner,
        group: Some(group),
    })
}

pub(crate) fn project_source(
    state: &AppState,
    user: Option<&CurrentUser>,
    id: u64,
) -> Result<SourceRef, ApiError> {
    let project = find_project(state, id)?;
    authz::require_project_visible(&state.store, user, &project)?;
    Ok(SourceRef {
        source: MembershipSource::Project(project.id),
        entity: (EntityType::Project, project.id),
        manage_level: AccessLevel::Maintainer,
        group: None,
    })
}

pub(crate) fn require_manage(
    state: &AppState,
    user: Option<&CurrentUser>,
    source: &SourceRef,
) -> Result<(), ApiError> {
    match source.source {
        MembershipSource::Group(gid) => {
            let group = state.store.group(gid).ok_or(ApiError::NotFound("Group"))?;
            authz::require_group_access(&state.store, user, &group, source.manage_level)
        }
        MembershipSource::Project(pid) => {
            let project = state.store.project(pid).ok_or(ApiError::NotFound("Project"))?;
            authz::require_project_access(&state.store, user, &project, source.manage_level)
        }
    }
}

fn root_group(state: &AppState, source: &SourceRef) -> Option<Group> {
    let gid = match source.source {
        MembershipSource::Group(gid) => gid,
        MembershipSource::Project(pid) => state.store.project(pid)?.group_id,
    };
    state.store.root_ancestor(gid)
}

/// Is the actor an owner of the billing root (drives the seat-limit
/// message wording)?
pub(crate) fn actor_is_root_owner(state: &AppState, user: &CurrentUser, source: &SourceRef) -> bool {
    if user.admin_mode() {
        return true;
    }
    root_group(state, source)
        .map(|root| {
            authz::group_access(&state.store, user.user.id, root.id) == Some(AccessLevel::Owner)
        })
        .unwrap_or(false)
}

// ── Validation shared by create/update ───────────────────────────

pub(crate) fn validate_access_level(raw: u8) -> Result<AccessLevel, ApiError> {
    AccessLevel::from_u8(raw)
        .ok_or_else(|| ApiError::BadRequest("access_level does not have a valid value".into()))
}

fn validate_minimal_access(
    state: &AppState,
    source: &SourceRef,
    level: AccessLevel,
) -> Result<(), ApiError> {
    if level != AccessLevel::MinimalAccess {
        return Ok(());
    }
    let licensed = state.entitlements.licensed(Feature::MinimalAccessRole);
    let top_level_group = source.group.as_ref().map(|g| g.top_level()).unwrap_or(false);
    if licensed && top_level_group {
        Ok(())
    } else {
        Err(ApiError::validation("access_level", &["is not included in the list"]))
    }
}

/// Custom-role assignment rules: the role must live in the source's root
/// group (or be instance-level) and its base level must match the
/// member's access level. Without the license the param is ignored.
fn resolve_member_role(
    state: &AppState,
    source: &SourceRef,
    access_level: AccessLevel,
    member_role_id: u64,
) -> Result<Option<u64>, ApiError> {
    if !state.entitlements.licensed(Feature::CustomRoles) {
        return Ok(None);
    }
    let role = state
        .store
        .member_role(member_role_id)
        .ok_or_else(|| ApiError::validation("member_role", &["not found"]))?;

    if let Some(ns) = role.namespace {
        let root = root_group(state, source).map(|g| g.id);
        if root != Some(ns) {
            return Err(ApiError::validation("member_role", &["not found"]));
        }
    }

    if role.base_access_level != access_level {
        return Err(ApiError::validation(
            "member_role_id",
            &["the custom role's base access level does not match the current access level"],
        ));
    }

    Ok(Some(role.id))
}

pub(crate) fn parse_expires_at(raw: Option<&str>) -> Result<Option<NaiveDate>, ApiError> {
    match raw {
        None | Some("") => Ok(None),
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .map(Some)
            .map_err(|_| ApiError::BadRequest("expires_at is invalid".into())),
    }
}

// ── Listing ──────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ListMembersParams {
    pub query: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

fn list_members(
    state: &AppState,
    source: &SourceRef,
    params: &ListMembersParams,
    base_path: &str,
) -> Result<Response, ApiError> {
    let minimal_licensed = state.entitlements.licensed(Feature::MinimalAccessRole);
    let mut rows: Vec<(Member, User)> = state
        .store
        .members_of(source.source)
        .into_iter()
        // Minimal-access members exist only while the license does.
        .filter(|m| minimal_licensed || m.access_level != AccessLevel::MinimalAccess)
        .filter_map(|m| state.store.user(m.user_id).map(|u| (m, u)))
        .filter(|(_, u)| {
            params
                .query
                .as_deref()
                .map(|q| u.username.contains(q) || u.name.contains(q))
                .unwrap_or(true)
        })
        .collect();
    rows.sort_by_key(|(m, _)| m.user_id);

    let page_params = PageParams {
        page: params.page,
        per_page: params.per_page,
        ..Default::default()
    };
    let (page, info) = offset_page(&rows, &page_params);
    let body: Vec<MemberJson> = page
        .iter()
        .map(|(m, u)| member_json(state, m, u))
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
    list_members(&state, &source, &params, &format!("/api/v4/groups/{}/members", id))
}

pub async fn list_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListMembersParams>,
) -> Result<Response, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    list_members(&state, &source, &params, &format!("/api/v4/projects/{}/members", id))
}

fn show_member(
    state: &AppState,
    source: &SourceRef,
    user_id: u64,
) -> Result<Json<MemberJson>, ApiError> {
    let member = state
        .store
        .find_member(source.source, user_id)
        .ok_or(ApiError::NotFound("Member"))?;
    if member.access_level == AccessLevel::MinimalAccess
        && !state.entitlements.licensed(Feature::MinimalAccessRole)
    {
        return Err(ApiError::NotFound("Member"));
    }
    let user = state.store.user(user_id).ok_or(ApiError::NotFound("Member"))?;
    Ok(Json(member_json(state, &member, &user)))
}

pub async fn show_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
) -> Result<Json<MemberJson>, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    show_member(&state, &source, user_id)
}

pub async fn show_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
) -> Result<Json<MemberJson>, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    show_member(&state, &source, user_id)
}

// ── Creation (single or batch) ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct CreateMemberParams {
    pub user_id: UserIdList,
    pub access_level: u8,
    pub expires_at: Option<String>,
    pub member_role_id: Option<u64>,
}

/// The combined per-user outcome body shared with the invitations
/// endpoint: every id is admitted, queued, or reported by username.
fn admit_users(
    state: &AppState,
    current: &CurrentUser,
    source: &SourceRef,
    params: &CreateMemberParams,
) -> Result<Response, ApiError> {
    let access_level = validate_access_level(params.access_level)?;
    validate_minimal_access(state, source, access_level)?;
    let expires_at = parse_expires_at(params.expires_at.as_deref())?;
    let member_role_id = match params.member_role_id {
        Some(id) => resolve_member_role(state, source, access_level, id)?,
        None => None,
    };

    if params.user_id.0.is_empty() {
        return Err(ApiError::BadRequest("user_id is empty".into()));
    }

    let actor_owner = actor_is_root_owner(state, current, source);
    let mut errors: BTreeMap<String, String> = BTreeMap::new();
    let mut queued: BTreeMap<String, String> = BTreeMap::new();
    let mut seat_rejection = false;

    for uid in &params.user_id.0 {
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
            member_role_id,
            state: member_state,
            expires_at,
            created_at: Utc::now(),
        });
        state.metrics.members_added.inc();
        state.store.record_audit(
            current.user.id,
            source.entity.0,
            source.entity.1,
            json!({
                "add": "user_access",
                "member_id": user.id,
                "access_level": access_level.as_u8(),
            }),
            None,
        );
    }

    let mut body = serde_json::Map::new();
    if errors.is_empty() {
        body.insert("status".into(), json!("success"));
    } else {
        body.insert("status".into(), json!("error"));
        // A lone seat rejection keeps the flat message of the original;
        // anything multi-valued reports per username.
        if errors.len() == 1 && params.user_id.0.len() == 1 && seat_rejection {
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
    Json(params): Json<CreateMemberParams>,
) -> Result<Response, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    admit_users(&state, current, &source, &params)
}

pub async fn create_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<CreateMemberParams>,
) -> Result<Response, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    admit_users(&state, current, &source, &params)
}

// ── Update ───────────────────────────────────────────────────────

/// Distinguishes an absent `member_role_id` from an explicit null (the
/// null unsets the role).
fn double_option<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Option<u64>>, D::Error> {
    Option::<u64>::deserialize(d).map(Some)
}

#[derive(Debug, Deserialize)]
pub struct UpdateMemberParams {
    pub access_level: Option<u8>,
    pub expires_at: Option<String>,
    #[serde(default, deserialize_with = "double_option")]
    pub member_role_id: Option<Option<u64>>,
}

fn last_active_owner(state: &AppState, source: &SourceRef, user_id: u64) -> bool {
    if !matches!(source.source, MembershipSource::Group(_)) {
        return false;
    }
    let member = state.store.find_member(source.source, user_id);
    if member.map(|m| m.access_level) != Some(AccessLevel::Owner) {
        return false;
    }
    !state
        .store
        .members_of(source.source)
        .iter()
        .any(|m| m.user_id != user_id && m.access_level == AccessLevel::Owner && m.is_active())
}

fn update_member(
    state: &AppState,
    current: &CurrentUser,
    source: &SourceRef,
    user_id: u64,
    params: &UpdateMemberParams,
) -> Result<Json<MemberJson>, ApiError> {
    let member = state
        .store
        .find_member(source.source, user_id)
        .ok_or(ApiError::NotFound("Member"))?;

    let access_level = match params.access_level {
        Some(raw) => validate_access_level(raw)?,
        None => member.access_level,
    };
    validate_minimal_access(state, source, access_level)?;

    if access_level < AccessLevel::Owner && last_active_owner(state, source, user_id) {
        tracing::warn!(user = user_id, "refusing to demote the last owner");
        return Err(ApiError::Forbidden);
    }

    let member_role_id = match params.member_role_id {
        // Param absent: keep whatever is there.
        None => member.member_role_id,
        // Explicit null unsets.
        Some(None) => None,
        Some(Some(id)) => {
            if state.entitlements.licensed(Feature::CustomRoles) {
                resolve_member_role(state, source, access_level, id)?
            } else {
                member.member_role_id
            }
        }
    };

    let expires_at = match params.expires_at.as_deref() {
        None => member.expires_at,
        Some(raw) => parse_expires_at(Some(raw))?,
    };

    let updated = state
        .store
        .update_member(source.source, user_id, |m| {
            m.access_level = access_level;
            m.member_role_id = member_role_id;
            m.expires_at = expires_at;
        })
        .ok_or(ApiError::NotFound("Member"))?;

    state.store.record_audit(
        current.user.id,
        source.entity.0,
        source.entity.1,
        json!({
            "change": "access_level",
            "member_id": user_id,
            "to": access_level.as_u8(),
        }),
        None,
    );

    let user = state.store.user(user_id).ok_or(ApiError::NotFound("Member"))?;
    Ok(Json(member_json(state, &updated, &user)))
}

pub async fn update_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Json(params): Json<UpdateMemberParams>,
) -> Result<Json<MemberJson>, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    update_member(&state, current, &source, user_id, &params)
}

pub async fn update_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Json(params): Json<UpdateMemberParams>,
) -> Result<Json<MemberJson>, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    update_member(&state, current, &source, user_id, &params)
}

// ── Removal ──────────────────────────────────────────────────────

fn destroy_member(
    state: &AppState,
    user: Option<&CurrentUser>,
    source: &SourceRef,
    user_id: u64,
) -> Result<StatusCode, ApiError> {
    let current = authz::require_user(user)?;
    // Self-removal is always allowed; anything else needs the manage role.
    if current.user.id != user_id {
        require_manage(state, user, source)?;
    }

    if state.store.find_member(source.source, user_id).is_none() {
        return Err(ApiError::NotFound("Member"));
    }
    if last_active_owner(state, source, user_id) {
        tracing::warn!(user = user_id, "refusing to remove the last owner");
        return Err(ApiError::Forbidden);
    }

    state.store.remove_member(source.source, user_id);
    state.store.record_audit(
        current.user.id,
        source.entity.0,
        source.entity.1,
        json!({ "remove": "user_access", "member_id": user_id }),
        None,
    );
    Ok(StatusCode::NO_CONTENT)
}

pub async fn destroy_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
) -> Result<StatusCode, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    destroy_member(&state, user.as_ref(), &source, user_id)
}

pub async fn destroy_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
) -> Result<StatusCode, ApiError> {
    let source = project_source(&state, user.as_ref(), id)?;
    destroy_member(&state, user.as_ref(), &source, user_id)
}

// ── Billable state ───────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SetStateParams {
    pub state: String,
}

/// PUT /groups/:id/members/:user_id/state — flips a member between
/// active and awaiting (seat review flow). SaaS only.
pub async fn set_state(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Json(params): Json<SetStateParams>,
) -> Result<Json<MemberJson>, ApiError> {
    let source = group_source(&state, user.as_ref(), id)?;
    let current = authz::require_user(user.as_ref())?;
    require_manage(&state, user.as_ref(), &source)?;
    if !state.entitlements.saas() {
        return Err(ApiError::Forbidden);
    }

    let new_state = match params.state.as_str() {
        "active" => MemberState::Active,
        "awaiting" => MemberState::Awaiting,
        _ => return Err(ApiError::BadRequest("state does not have a valid value".into())),
    };

    let member = state
        .store
        .update_member(source.source, user_id, |m| m.state = new_state)
        .ok_or(ApiError::NotFound("Member"))?;
    state.store.record_audit(
        current.user.id,
        source.entity.0,
        source.entity.1,
        json!({ "change": "membership_state", "member_id": user_id }),
        None,
    );

    let target = state.store.user(user_id).ok_or(ApiError::NotFound("Member"))?;
    Ok(Json(member_json(&state, &member, &target)))
}

// ── Billable members ─────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct BillableUserJson {
    pub id: u64,
    pub username: String,
    pub name: String,
    pub state: UserState,
}

/// GET /groups/:id/billable_members — distinct seat-consuming users
/// across the root group's hierarchy.
pub async fn billable(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListMembersParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;
    if !group.top_level() {
        return Err(ApiError::BadRequest(
            "billable members are tracked on top-level groups only".into(),
        ));
    }

    let mut users: Vec<User> = quota::billable_users(&state.store, &group)
        .into_iter()
        .filter_map(|uid| state.store.user(uid))
        .collect();
    users.sort_by_key(|u| u.id);

    let page_params = PageParams {
        page: params.page,
        per_page: params.per_page,
        ..Default::default()
    };
    let (page, info) = offset_page(&users, &page_params);
    let body: Vec<BillableUserJson> = page
        .iter()
        .map(|u| BillableUserJson {
            id: u.id,
            username: u.username.clone(),
            name: u.name.clone(),
            state: u.state,
        })
        .collect();
    let mut response = Json(body).into_response();
    offset_headers(
        response.headers_mut(),
        &format!("{}/api/v4/groups/{}/billable_members", state.config.base_url, group.id),
        &[],
        &info,
    );
    Ok(response)
}
