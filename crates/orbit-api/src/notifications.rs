use axum::{Extension, Json, extract::State, response::IntoResponse};

use orbit_types::api::{Claims, UnreadCount};
use orbit_types::models::Collection;
use orbit_types::view::badge_label;

use crate::auth::{AppState, run_db, run_write};
use crate::error::ApiError;

/// The caller's notifications, newest first. Viewing marks them read; the
/// response still shows which ones were unread. Badge queries only see a
/// change when something was actually marked.
pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let (notifications, _marked) =
        run_write(&state, &[Collection::Notifications], move |db| db.view_notifications(&user_id)).await?;
    Ok(Json(notifications))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let count = run_db(&state, move |db| db.unread_count(&user_id)).await?;
    Ok(Json(UnreadCount {
        count,
        label: badge_label(count),
    }))
}
