use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::debug;

use orbit_types::api::{Claims, SendMessageRequest, StartConversationRequest};
use orbit_types::models::Collection;

use crate::auth::{AppState, run_db, run_write};
use crate::error::ApiError;

pub async fn list_conversations(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let conversations = run_db(&state, move |db| db.list_conversations(&user_id)).await?;
    Ok(Json(conversations))
}

/// Open the conversation with another user, reusing an existing one.
/// 201 when it was created, 200 when it already existed.
pub async fn start_conversation(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    // A reopened conversation re-evaluates to the same result, so live
    // queries stay quiet.
    let (conversation, created) = run_write(&state, &[Collection::Conversations], move |db| {
        db.start_conversation(&user_id, &req.user_id)
    })
    .await?;

    let status = if created {
        StatusCode::CREATED
    } else {
        debug!("{} reopened conversation {}", claims.username, conversation.id);
        StatusCode::OK
    };
    Ok((status, Json(conversation)))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = claims.sub.to_string();
    let messages = run_db(&state, move |db| db.list_messages(&conversation_id, &user_id)).await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Path(conversation_id): Path<String>,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender_id = claims.sub.to_string();
    let message = run_write(&state, &[Collection::Messages, Collection::Conversations], move |db| {
        db.send_message(&conversation_id, &sender_id, &req.text)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
