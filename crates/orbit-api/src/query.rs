//! One-shot generic queries, under the same access policy as live ones.

use axum::{Extension, Json, extract::State, response::IntoResponse};

use orbit_gateway::access::authorize;
use orbit_types::api::Claims;
use orbit_types::query::Query;

use crate::auth::{AppState, run_db};
use crate::error::ApiError;

pub async fn run_query(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(query): Json<Query>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = claims.sub.to_string();
    let page = run_db(&state, move |db| {
        authorize(db, &caller, &query)?;
        db.query_page(&query)
    })
    .await?;
    Ok(Json(page))
}
