use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::api::find_group;
use crate::authz::{self, AccessLevel};
use crate::entitlements::Feature;
use crate::errors::ApiError;
use crate::jobs::Job;
use crate::jobs::ghost_migration;
use crate::middleware::auth::{CurrentUser, MaybeUser};
use crate::models::audit::EntityType;
use crate::models::group::Group;
use crate::models::token::TokenScope;
use crate::models::user::{User, UserKind};
use crate::pagination::{offset_headers, offset_page, PageParams};
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct ServiceAccountJson {
    pub id: u64,
    pub username: String,
    pub name: String,
    pub email: String,
}

fn service_account_json(user: &User) -> ServiceAccountJson {
    ServiceAccountJson {
        id: user.id,
        username: user.username.clone(),
        name: user.name.clone(),
        email: user.email.clone(),
    }
}

#[derive(Debug, Serialize)]
pub struct TokenJson {
    pub id: u64,
    pub name: String,
    pub scopes: Vec<TokenScope>,
    pub revoked: bool,
    pub expires_at: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
    /// Present only on create/rotate responses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

fn token_json(token: &crate::models::token::PersonalAccessToken, raw: Option<String>) -> TokenJson {
    TokenJson {
        id: token.id,
        name: token.name.clone(),
        scopes: token.scopes.clone(),
        revoked: token.revoked,
        expires_at: token.expires_at,
        created_at: token.created_at,
        token: raw,
    }
}

/// Service-account management: instance admins always; top-level group
/// owners when the group setting allows it.
fn require_manager(
    state: &AppState,
    user: Option<&CurrentUser>,
    group: &Group,
) -> Result<(), ApiError> {
    let current = authz::require_user(user)?;
    if current.admin_mode() {
        return Ok(());
    }
    authz::require_group_visible(&state.store, user, group)?;
    let is_owner =
        authz::group_access(&state.store, current.user.id, group.id) == Some(AccessLevel::Owner);
    if is_owner && group.settings.service_account_creation_by_owners {
        Ok(())
    } else {
        tracing::warn!(group = group.id, user = current.user.id, "service account management denied");
        Err(ApiError::Forbidden)
    }
}

fn require_licensed(state: &AppState) -> Result<(), ApiError> {
    if state.entitlements.licensed(Feature::ServiceAccounts) {
        Ok(())
    } else {
        Err(ApiError::Forbidden)
    }
}

/// The account must be a service account provisioned by this group:
/// foreign accounts 404 (hidden), non-service accounts 400.
fn find_service_account(state: &AppState, group: &Group, user_id: u64) -> Result<User, ApiError> {
    let user = state.store.user(user_id).ok_or(ApiError::NotFound("User"))?;
    match user.kind {
        UserKind::ServiceAccount { provisioned_by } if provisioned_by == group.id => Ok(user),
        UserKind::ServiceAccount { .. } => Err(ApiError::NotFound("User")),
        _ => Err(ApiError::BadRequest("user is not a service account".into())),
    }
}

// ── Account lifecycle ────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct CreateServiceAccountParams {
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
}

/// POST /groups/:id/service_accounts
pub async fn create(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Json(params): Json<CreateServiceAccountParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;

    if !group.top_level() {
        return Err(ApiError::BadRequest(
            "service accounts can only be created on top-level groups".into(),
        ));
    }

    let username = match params.username {
        Some(u) => u,
        None => {
            let suffix: u32 = rand::thread_rng().gen_range(100_000..1_000_000);
            format!("service_account_group_{}_{}", group.id, suffix)
        }
    };
    if state.store.user_by_username(&username).is_some() {
        return Err(ApiError::validation("username", &["has already been taken"]));
    }

    let email = params
        .email
        .unwrap_or_else(|| format!("{}@noreply.local", username));
    if state.store.user_by_email(&email).is_some() {
        return Err(ApiError::validation("email", &["has already been taken"]));
    }

    let name = params.name.unwrap_or_else(|| "Service account user".into());
    let account = state.store.create_user(
        &username,
        &name,
        &email,
        false,
        UserKind::ServiceAccount { provisioned_by: group.id },
    );

    state.store.record_audit(
        current.user.id,
        EntityType::Group,
        group.id,
        json!({ "add": "service_account", "username": account.username }),
        None,
    );

    Ok((StatusCode::CREATED, Json(service_account_json(&account))).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ListServiceAccountsParams {
    pub order_by: Option<String>,
    pub sort: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// GET /groups/:id/service_accounts
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListServiceAccountsParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;

    let mut rows = state.store.service_accounts_of(group.id);
    match params.order_by.as_deref() {
        Some("username") => rows.sort_by(|a, b| a.username.cmp(&b.username)),
        _ => rows.sort_by_key(|u| u.id),
    }
    if params.sort.as_deref() == Some("desc") {
        rows.reverse();
    }

    let page_params = PageParams {
        page: params.page,
        per_page: params.per_page,
        ..Default::default()
    };
    let (page, info) = offset_page(&rows, &page_params);
    let body: Vec<ServiceAccountJson> = page.iter().map(service_account_json).collect();
    let mut response = Json(body).into_response();
    offset_headers(
        response.headers_mut(),
        &format!("{}/api/v4/groups/{}/service_accounts", state.config.base_url, group.id),
        &[],
        &info,
    );
    Ok(response)
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateServiceAccountParams {
    pub name: Option<String>,
    pub username: Option<String>,
    pub email: Option<String>,
}

/// PATCH /groups/:id/service_accounts/:user_id
pub async fn update(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Json(params): Json<UpdateServiceAccountParams>,
) -> Result<Json<ServiceAccountJson>, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;
    let account = find_service_account(&state, &group, user_id)?;

    if let Some(username) = &params.username {
        if state
            .store
            .user_by_username(username)
            .map(|u| u.id != account.id)
            .unwrap_or(false)
        {
            return Err(ApiError::validation("username", &["has already been taken"]));
        }
    }
    if let Some(email) = &params.email {
        if state
            .store
            .user_by_email(email)
            .map(|u| u.id != account.id)
            .unwrap_or(false)
        {
            return Err(ApiError::validation("email", &["has already been taken"]));
        }
    }

    let updated = state
        .store
        .update_user(account.id, |u| {
            if let Some(name) = &params.name {
                u.name = name.clone();
            }
            if let Some(username) = &params.username {
                u.username = username.clone();
            }
            if let Some(email) = &params.email {
                u.email = email.clone();
            }
        })
        .ok_or(ApiError::NotFound("User"))?;

    state.store.record_audit(
        current.user.id,
        EntityType::Group,
        group.id,
        json!({ "change": "service_account", "member_id": account.id }),
        None,
    );

    Ok(Json(service_account_json(&updated)))
}

#[derive(Debug, Default, Deserialize)]
pub struct DestroyParams {
    pub hard_delete: Option<bool>,
}

/// DELETE /groups/:id/service_accounts/:user_id — 202; the deletion and
/// contribution migration run on the job worker.
pub async fn destroy(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Query(params): Query<DestroyParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;
    let account = find_service_account(&state, &group, user_id)?;

    let hard_delete = params.hard_delete.unwrap_or(false);
    if !hard_delete && !ghost_migration::sole_owned_groups(&state.store, account.id).is_empty() {
        return Err(ApiError::Validation(json!({
            "base": [
                "You must transfer ownership or delete the groups owned by this user before you can delete their account"
            ]
        })));
    }

    state.jobs.enqueue(Job::GhostUserMigration {
        user_id: account.id,
        initiator_id: current.user.id,
        hard_delete,
    });

    Ok(StatusCode::ACCEPTED.into_response())
}

// ── Personal access tokens ───────────────────────────────────────

/// GET /groups/:id/service_accounts/:user_id/personal_access_tokens
pub async fn list_tokens(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
) -> Result<Json<Vec<TokenJson>>, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let account = find_service_account(&state, &group, user_id)?;

    let mut tokens = state.store.tokens_of(account.id);
    tokens.sort_by_key(|t| t.id);
    Ok(Json(tokens.iter().map(|t| token_json(t, None)).collect()))
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenParams {
    pub name: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<String>,
}

/// POST /groups/:id/service_accounts/:user_id/personal_access_tokens
pub async fn create_token(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id)): Path<(u64, u64)>,
    Json(params): Json<CreateTokenParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;
    let account = find_service_account(&state, &group, user_id)?;

    let scopes = params
        .scopes
        .iter()
        .map(|s| {
            TokenScope::parse(s)
                .ok_or_else(|| ApiError::BadRequest(format!("scopes does not have a valid value: {}", s)))
        })
        .collect::<Result<Vec<TokenScope>, ApiError>>()?;
    if scopes.is_empty() {
        return Err(ApiError::BadRequest("scopes is empty".into()));
    }

    let expires_at = match params.expires_at.as_deref() {
        None => None,
        Some(raw) => Some(
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .map_err(|_| ApiError::BadRequest("expires_at is invalid".into()))?,
        ),
    };

    let (raw, token) = state
        .store
        .create_token(account.id, &params.name, scopes, expires_at);

    state.store.record_audit(
        current.user.id,
        EntityType::User,
        account.id,
        json!({ "add": "personal_access_token", "token_name": token.name }),
        None,
    );

    Ok((StatusCode::CREATED, Json(token_json(&token, Some(raw)))).into_response())
}

/// POST .../personal_access_tokens/:token_id/rotate — revokes and
/// replaces; the replacement expires a week out.
pub async fn rotate_token(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id, token_id)): Path<(u64, u64, u64)>,
) -> Result<Json<TokenJson>, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;
    let account = find_service_account(&state, &group, user_id)?;

    let token = state
        .store
        .token(token_id)
        .filter(|t| t.user_id == account.id)
        .ok_or(ApiError::NotFound("Token"))?;
    if !token.active() {
        return Err(ApiError::BadRequest("token already revoked".into()));
    }

    state.store.revoke_token(token.id);
    let expires_at = (Utc::now() + Duration::days(7)).date_naive();
    let (raw, replacement) =
        state
            .store
            .create_token(account.id, &token.name, token.scopes.clone(), Some(expires_at));

    state.store.record_audit(
        current.user.id,
        EntityType::User,
        account.id,
        json!({ "change": "personal_access_token", "token_name": token.name }),
        None,
    );

    Ok(Json(token_json(&replacement, Some(raw))))
}

/// DELETE .../personal_access_tokens/:token_id — revoking an
/// already-revoked token is a forbidden state transition.
pub async fn revoke_token(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, user_id, token_id)): Path<(u64, u64, u64)>,
) -> Result<StatusCode, ApiError> {
    let group = find_group(&state, id)?;
    require_licensed(&state)?;
    require_manager(&state, user.as_ref(), &group)?;
    let current = authz::require_user(user.as_ref())?;
    let account = find_service_account(&state, &group, user_id)?;

    let token = state
        .store
        .token(token_id)
        .filter(|t| t.user_id == account.id)
        .ok_or(ApiError::NotFound("Token"))?;
    if token.revoked {
        return Err(ApiError::MethodNotAllowed("token is already revoked".into()));
    }

    state.store.revoke_token(token.id);
    state.store.record_audit(
        current.user.id,
        EntityType::User,
        account.id,
        json!({ "remove": "personal_access_token", "token_name": token.name }),
        None,
    );
    Ok(StatusCode::NO_CONTENT)
}
