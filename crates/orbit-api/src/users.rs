use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    response::IntoResponse,
};

use orbit_types::api::{Claims, PageParams, UpdateProfileRequest};
use orbit_types::models::Collection;

use crate::auth::{AppState, run_db, run_write};
use crate::error::ApiError;
use crate::posts::page_request;

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let user = run_db(&state, move |db| db.get_user(&user_id)).await?;
    Ok(Json(user))
}

pub async fn update_me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let user = run_write(&state, &[Collection::Users], move |db| db.update_profile(&user_id, &req)).await?;
    Ok(Json(user))
}

pub async fn get_user(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = run_db(&state, move |db| db.get_user(&user_id)).await?;
    Ok(Json(user))
}

pub async fn stats(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let stats = run_db(&state, move |db| db.user_stats(&user_id)).await?;
    Ok(Json(stats))
}

pub async fn posts(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let (cursor, limit) = page_request(&params)?;
    let page = run_db(&state, move |db| db.posts_by_author(&user_id, cursor, limit)).await?;
    Ok(Json(page))
}

/// Follow, or unfollow when already following.
pub async fn follow(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(target_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let res = run_write(&state, &[Collection::Users], move |db| db.toggle_follow(&user_id, &target_id)).await?;
    Ok(Json(res))
}
