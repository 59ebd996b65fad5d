use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};

use orbit_db::queries::FEED_PAGE_SIZE;
use orbit_types::api::{
    Claims, CreateCommentRequest, CreatePostRequest, LikeResponse, PageParams, VoteRequest,
    VoteResponse,
};
use orbit_types::models::Collection;
use orbit_types::query::Cursor;

use crate::auth::{AppState, run_db, run_write};
use crate::error::ApiError;

const MAX_PAGE_SIZE: u32 = 50;

/// Decode the cursor and clamp the page size.
pub fn page_request(params: &PageParams) -> Result<(Option<Cursor>, u32), ApiError> {
    let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;
    let limit = params.limit.unwrap_or(FEED_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    Ok((cursor, limit))
}

pub async fn feed(
    State(state): State<AppState>,
    Query(params): Query<PageParams>,
) -> Result<impl IntoResponse, ApiError> {
    let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;
    let page = run_db(&state, move |db| db.feed(cursor)).await?;
    Ok(Json(page))
}

pub async fn recent(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let posts = run_db(&state, |db| db.recent_posts()).await?;
    Ok(Json(posts))
}

pub async fn create_post(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePostRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let author_id = claims.sub.to_string();
    let post = run_write(&state, &[Collection::Posts, Collection::Tags], move |db| {
        db.create_post(&author_id, &req)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(post)))
}

pub async fn get_post(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let post = run_db(&state, move |db| db.get_post(&post_id)).await?;
    Ok(Json(post))
}

pub async fn like(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let uid = user_id.clone();
    let post = run_write(&state, &[Collection::Posts, Collection::Notifications], move |db| {
        db.toggle_like(&post_id, &uid)
    })
    .await?;

    Ok(Json(LikeResponse {
        liked: post.is_liked_by(&user_id),
        likes: post.likes,
    }))
}

pub async fn vote(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<String>,
    Json(req): Json<VoteRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let (post, vote) =
        run_write(&state, &[Collection::Posts], move |db| db.vote(&post_id, &user_id, req.direction)).await?;

    Ok(Json(VoteResponse {
        state: vote,
        score: post.score(),
    }))
}

pub async fn list_comments(
    State(state): State<AppState>,
    Path(post_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let comments = run_db(&state, move |db| db.list_comments(&post_id)).await?;
    Ok(Json(comments))
}

pub async fn add_comment(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(post_id): Path<String>,
    Json(req): Json<CreateCommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let author_id = claims.sub.to_string();
    let comment = run_write(&state, &[Collection::Comments, Collection::Notifications], move |db| {
        db.add_comment(&post_id, &author_id, &req.content)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_size_is_clamped() {
        let (cursor, limit) = page_request(&PageParams::default()).unwrap();
        assert!(cursor.is_none());
        assert_eq!(limit, FEED_PAGE_SIZE);

        let params = PageParams {
            cursor: None,
            limit: Some(10_000),
        };
        assert_eq!(page_request(&params).unwrap().1, MAX_PAGE_SIZE);
    }

    #[test]
    fn bad_cursor_is_a_client_error() {
        let params = PageParams {
            cursor: Some("***".into()),
            limit: None,
        };
        assert!(matches!(page_request(&params), Err(ApiError::Query(_))));
    }
}
