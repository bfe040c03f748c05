use std::sync::Arc;

use axum::extract::{Path, State};
use axum::{Extension, Json};
use serde_json::json;

use crate::api::find_project;
use crate::authz;
use crate::errors::ApiError;
use crate::middleware::auth::MaybeUser;
use crate::AppState;

/// GET /projects/:id — private projects answer 404 to outsiders.
pub async fn show(
    State(state): State<Arc<AppState>>,
    Extension(MaybeUser(user)): Extension<MaybeUser>,
    Path(id): Path<u64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let project = find_project(&state, id)?;
    authz::require_project_visible(&state.store, user.as_ref(), &project)?;

    Ok(Json(json!({
        "id": project.id,
        "path": project.path,
        "name": project.name,
        "visibility": project.visibility,
        "namespace_id": project.group_id,
        "created_at": project.created_at,
    })))
}
