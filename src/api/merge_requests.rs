use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::Deserialize;
use serde_json::json;

use crate::api::find_project;
use crate::authz;
use crate::entitlements::Feature;
use crate::errors::ApiError;
use crate::middleware::auth::MaybeUser;
use crate::models::merge_request::MergeRequest;
use crate::pagination::{offset_headers, offset_page, PageParams};
use crate::AppState;

/// Approval counters are a licensed attribute: without the feature the
/// keys are absent, the rest of the payload is unchanged.
fn merge_request_json(state: &AppState, mr: &MergeRequest) -> serde_json::Value {
    let mut body = json!({
        "id": mr.id,
        "iid": mr.iid,
        "project_id": mr.project_id,
        "title": mr.title,
        "state": mr.state,
        "author_id": mr.author_id,
        "created_at": mr.created_at,
        "updated_at": mr.updated_at,
    });
    if state.entitlements.licensed(Feature::MergeRequestApprovals) {
        body["approvals_required"] = json!(mr.approvals_required);
        body["approvals_left"] = json!(mr.approvals_left());
    }
    body
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
    pub author_id: Option<u64>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// GET /projects/:id/merge_requests
pub async fn list(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
    Query(params): Query<ListParams>,
) -> Result<Response, ApiError> {
    let project = find_project(&state, id)?;
    authz::require_project_visible(&state.store, user.as_ref(), &project)?;

    let mut rows: Vec<MergeRequest> = state
        .store
        .merge_requests_of(project.id)
        .into_iter()
        .filter(|mr| {
            params
                .state
                .as_deref()
                .map(|s| serde_json::to_value(mr.state).ok() == Some(json!(s)))
                .unwrap_or(true)
        })
        .filter(|mr| params.author_id.map_or(true, |a| mr.author_id == a))
        .collect();
    rows.sort_by_key(|mr| (std::cmp::Reverse(mr.created_at), std::cmp::Reverse(mr.id)));

    let page_params = PageParams {
        page: params.page,
        per_page: params.per_page,
        ..Default::default()
    };
    let (page, info) = offset_page(&rows, &page_params);
    let body: Vec<serde_json::Value> =
        page.iter().map(|mr| merge_request_json(&state, mr)).collect();
    let mut response = Json(body).into_response();
    offset_headers(
        response.headers_mut(),
        &format!(
            "{}/api/v4/projects/{}/merge_requests",
            state.config.base_url, project.id
        ),
        &[],
        &info,
    );
    Ok(response)
}

/// GET /projects/:id/merge_requests/:merge_request_iid
pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path((id, iid)): Path<(u64, u64)>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = find_project(&state, id)?;
    authz::require_project_visible(&state.store, user.as_ref(), &project)?;

    let mr = state
        .store
        .merge_request_by_iid(project.id, iid)
        .ok_or(ApiError::NotFound("Merge Request"))?;
    Ok(Json(merge_request_json(&state, &mr)))
}
