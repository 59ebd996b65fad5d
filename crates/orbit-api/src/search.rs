use axum::{
    Json,
    extract::{Query, State},
    response::IntoResponse,
};

use orbit_types::api::SearchParams;

use crate::auth::{AppState, run_db};
use crate::error::ApiError;

pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> Result<impl IntoResponse, ApiError> {
    let results = run_db(&state, move |db| db.search(&params)).await?;
    Ok(Json(results))
}
