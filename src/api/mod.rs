use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, patch, post, put};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::errors::ApiError;
use crate::middleware::auth;
use crate::models::group::{Group, GroupId, Project, ProjectId};
use crate::AppState;

pub mod audit_events;
pub mod epics;
pub mod groups;
pub mod invitations;
pub mod members;
pub mod merge_requests;
pub mod projects;
pub mod related_epic_links;
pub mod service_accounts;

/// The whole application: health, metrics exposition, and the versioned
/// API with authentication resolved up front.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/-/metrics", get(metrics_handler))
        .nest("/api/v4", api_router())
        .fallback(fallback_404)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .layer(DefaultBodyLimit::max(state.config.max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // Audit events
        .route("/audit_events", get(audit_events::list_instance))
        .route("/audit_events/:id", get(audit_events::show_instance))
        .route("/groups/:id/audit_events", get(audit_events::list_group))
        .route(
            "/groups/:id/audit_events/:event_id",
            get(audit_events::show_group),
        )
        .route("/projects/:id/audit_events", get(audit_events::list_project))
        .route(
            "/projects/:id/audit_events/:event_id",
            get(audit_events::show_project),
        )
        // Epics
        .route("/groups/:id/epics", get(epics::list).post(epics::create))
        .route(
            "/groups/:id/epics/:epic_iid",
            get(epics::show).put(epics::update).delete(epics::destroy),
        )
        // Related epic links
        .route(
            "/groups/:id/epics/:epic_iid/related_epics",
            get(related_epic_links::list).post(related_epic_links::create),
        )
        .route(
            "/groups/:id/epics/:epic_iid/related_epics/:link_id",
            delete(related_epic_links::destroy),
        )
        // Groups
        .route("/groups/:id", get(groups::show).put(groups::update))
        .route("/groups/:id/share", post(groups::share))
        .route("/groups/:id/share/:group_id", delete(groups::unshare))
        .route("/groups/:id/billable_members", get(members::billable))
        // Members
        .route(
            "/groups/:id/members",
            get(members::list_group).post(members::create_group),
        )
        .route(
            "/groups/:id/members/:user_id",
            get(members::show_group)
                .put(members::update_group)
                .delete(members::destroy_group),
        )
        .route("/groups/:id/members/:user_id/state", put(members::set_state))
        .route(
            "/projects/:id/members",
            get(members::list_project).post(members::create_project),
        )
        .route(
            "/projects/:id/members/:user_id",
            get(members::show_project)
                .put(members::update_project)
                .delete(members::destroy_project),
        )
        // Invitations
        .route(
            "/groups/:id/invitations",
            get(invitations::list_group).post(invitations::create_group),
        )
        .route(
            "/groups/:id/invitations/:email",
            delete(invitations::destroy_group),
        )
        .route(
            "/projects/:id/invitations",
            get(invitations::list_project).post(invitations::create_project),
        )
        .route(
            "/projects/:id/invitations/:email",
            delete(invitations::destroy_project),
        )
        // Service accounts
        .route(
            "/groups/:id/service_accounts",
            get(service_accounts::list).post(service_accounts::create),
        )
        .route(
            "/groups/:id/service_accounts/:user_id",
            patch(service_accounts::update).delete(service_accounts::destroy),
        )
        .route(
            "/groups/:id/service_accounts/:user_id/personal_access_tokens",
            get(service_accounts::list_tokens).post(service_accounts::create_token),
        )
        .route(
            "/groups/:id/service_accounts/:user_id/personal_access_tokens/:token_id",
            delete(service_accounts::revoke_token),
        )
        .route(
            "/groups/:id/service_accounts/:user_id/personal_access_tokens/:token_id/rotate",
            post(service_accounts::rotate_token),
        )
        // Projects & merge requests
        .route("/projects/:id", get(projects::show))
        .route("/projects/:id/merge_requests", get(merge_requests::list))
        .route(
            "/projects/:id/merge_requests/:merge_request_iid",
            get(merge_requests::show),
        )
        .fallback(fallback_404)
}

async fn fallback_404() -> ApiError {
    ApiError::NotFound("Resource")
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

/// Lookup helpers shared by the resource modules. Absence is always the
/// resource-named 404.
pub(crate) fn find_group(state: &AppState, id: GroupId) -> Result<Group, ApiError> {
    state.store.group(id).ok_or(ApiError::NotFound("Group"))
}

pub(crate) fn find_project(state: &AppState, id: ProjectId) -> Result<Project, ApiError> {
    state.store.project(id).ok_or(ApiError::NotFound("Project"))
}
