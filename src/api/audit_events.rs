use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::header::LINK;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::api::{find_group, find_project};
use crate::authz::{self, AccessLevel};
use crate::entitlements::{Feature, Flag};
use crate::errors::ApiError;
use crate::middleware::auth::MaybeUser;
use crate::models::audit::{AuditEvent, EntityType};
use crate::pagination::{keyset_link, keyset_page, offset_headers, offset_page, PageParams};
use crate::store::audit::AuditFilter;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct AuditParams {
    pub entity_type: Option<String>,
    pub entity_id: Option<u64>,
    pub author_id: Option<u64>,
    pub created_before: Option<String>,
    pub created_after: Option<String>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
    pub pagination: Option<String>,
    pub cursor: Option<String>,
}

impl AuditParams {
    fn page_params(&self) -> PageParams {
        PageParams {
            page: self.page,
            per_page: self.per_page,
            pagination: self.pagination.clone(),
            cursor: self.cursor.clone(),
        }
    }

    /// Conjunctive filter; `entity_id` is meaningless without a type.
    fn filter(&self) -> Result<AuditFilter, ApiError> {
        let entity_type = match &self.entity_type {
            Some(raw) => Some(
                EntityType::parse(raw)
                    .ok_or_else(|| ApiError::BadRequest("entity_type does not have a valid value".into()))?,
            ),
            None => None,
        };
        if self.entity_id.is_some() && entity_type.is_none() {
            return Err(ApiError::BadRequest("entity_id requires entity_type".into()));
        }

        Ok(AuditFilter {
            entity_type,
            entity_id: self.entity_id,
            author_id: self.author_id,
            created_before: parse_time(self.created_before.as_deref())?,
            created_after: parse_time(self.created_after.as_deref())?,
            scope: None,
        })
    }

    /// Filter params carried into pagination Link targets.
    fn link_query(&self) -> Vec<(String, String)> {
        let mut q = Vec::new();
        let mut push = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                q.push((k.to_string(), v));
            }
        };
        push("entity_type", self.entity_type.clone());
        push("entity_id", self.entity_id.map(|v| v.to_string()));
        push("author_id", self.author_id.map(|v| v.to_string()));
        push("created_before", self.created_before.clone());
        push("created_after", self.created_after.clone());
        q
    }
}

fn parse_time(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, ApiError> {
    match raw {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|_| ApiError::BadRequest("invalid timestamp".into())),
    }
}

fn selected_store<'a>(state: &'a AppState) -> &'a dyn crate::store::audit::AuditEventStore {
    state
        .store
        .audit_store(state.entitlements.flag(Flag::ReadAuditEventsFromPartitionedTables))
}

/// One page of events plus pagination headers, offset or keyset.
fn page_response(
    state: &AppState,
    path: &str,
    params: &AuditParams,
    rows: Vec<AuditEvent>,
) -> Result<Response, ApiError> {
    let page_params = params.page_params();
    let base_url = format!("{}{}", state.config.base_url, path);

    if page_params.keyset() {
        let cursor = page_params.cursor()?;
        let (page, next) = keyset_page(&rows, cursor.as_ref(), page_params.per_page());
        let mut response = Json(page).into_response();
        if let Some(next) = next {
            response.headers_mut().insert(
                LINK,
                keyset_link(&base_url, &params.link_query(), &next, page_params.per_page()),
            );
        }
        Ok(response)
    } else {
        let (page, info) = offset_page(&rows, &page_params);
        let mut response = Json(page).into_response();
        offset_headers(response.headers_mut(), &base_url, &params.link_query(), &info);
        Ok(response)
    }
}

fn require_instance_log(
    state: &AppState,
    user: Option<&crate::middleware::auth::CurrentUser>,
) -> Result<(), ApiError> {
    authz::require_admin(user)?;
    if !state.entitlements.licensed(Feature::AuditEvents) {
        return Err(ApiError::Forbidden);
    }
    Ok(())
}

/// GET /audit_events — the instance-wide log.
pub async fn list_instance(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Query(params): Query<AuditParams>,
) -> Result<Response, ApiError> {
    require_instance_log(&state, user.as_ref())?;
    state.metrics.audit_api_reads.with_label_values(&["instance"]).inc();

    let rows = selected_store(&state).list(&params.filter()?);
    page_response(&state, "/api/v4/audit_events", &params, rows)
}

/// GET /audit_events/:id
pub async fn show_instance(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
) -> Result<Json<AuditEvent>, ApiError> {
    require_instance_log(&state, user.as_ref())?;
    state.metrics.audit_api_reads.with_label_values(&["instance"]).inc();

    selected_store(&state)
        .find(id)
        .map(Json)
        .ok_or(ApiError::NotFound("Audit Event"))
}

/// GET /groups/:id/audit_events
pub async fn list_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<AuditParams>,
) -> Result<Response, ApiError> {
    let group = find_group(&state, id)?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;
    if !state.entitlements.licensed(Feature::AuditEvents) {
        return Err(ApiError::Forbidden);
    }
    state.metrics.audit_api_reads.with_label_values(&["group"]).inc();

    let mut filter = params.filter()?;
    filter.scope = Some((EntityType::Group, group.id));
    let rows = selected_store(&state).list(&filter);
    page_response(
        &state,
        &format!("/api/v4/groups/{}/audit_events", group.id),
        &params,
        rows,
    )
}

/// GET /groups/:id/audit_events/:event_id
pub async fn show_group(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, event_id)): Path<(u64, u64)>,
) -> Result<Json<AuditEvent>, ApiError> {
    let group = find_group(&state, id)?;
    authz::require_group_access(&state.store, user.as_ref(), &group, AccessLevel::Owner)?;
    if !state.entitlements.licensed(Feature::AuditEvents) {
        return Err(ApiError::Forbidden);
    }
    state.metrics.audit_api_reads.with_label_values(&["group"]).inc();

    selected_store(&state)
        .find(event_id)
        .filter(|e| e.entity_type == EntityType::Group && e.entity_id == group.id)
        .map(Json)
        .ok_or(ApiError::NotFound("Audit Event"))
}

/// GET /projects/:id/audit_events
pub async fn list_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<AuditParams>,
) -> Result<Response, ApiError> {
    let project = find_project(&state, id)?;
    authz::require_project_access(&state.store, user.as_ref(), &project, AccessLevel::Maintainer)?;
    if !state.entitlements.licensed(Feature::AuditEvents) {
        return Err(ApiError::Forbidden);
    }
    state.metrics.audit_api_reads.with_label_values(&["project"]).inc();

    let mut filter = params.filter()?;
    filter.scope = Some((EntityType::Project, project.id));
    let rows = selected_store(&state).list(&filter);
    page_response(
        &state,
        &format!("/api/v4/projects/{}/audit_events", project.id),
        &params,
        rows,
    )
}

/// GET /projects/:id/audit_events/:event_id
pub async fn show_project(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, event_id)): Path<(u64, u64)>,
) -> Result<Json<AuditEvent>, ApiError> {
    let project = find_project(&state, id)?;
    authz::require_project_access(&state.store, user.as_ref(), &project, AccessLevel::Maintainer)?;
    if !state.entitlements.licensed(Feature::AuditEvents) {
        return Err(ApiError::Forbidden);
    }
    state.metrics.audit_api_reads.with_label_values(&["project"]).inc();

    selected_store(&state)
        .find(event_id)
        .filter(|e| e.entity_type == EntityType::Project && e.entity_id == project.id)
        .map(Json)
        .ok_or(ApiError::NotFound("Audit Event"))
}
