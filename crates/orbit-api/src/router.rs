use axum::{
    Router,
    extract::{State, WebSocketUpgrade},
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use orbit_gateway::connection;

use crate::auth::{self, AppState};
use crate::middleware::require_auth;
use crate::{messages, notifications, posts, query, search, users};

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login));

    let protected_routes = Router::new()
        .route("/users/me", get(users::me).patch(users::update_me))
        .route("/users/{user_id}", get(users::get_user))
        .route("/users/{user_id}/stats", get(users::stats))
        .route("/users/{user_id}/posts", get(users::posts))
        .route("/users/{user_id}/follow", post(users::follow))
        .route("/posts", get(posts::feed).post(posts::create_post))
        .route("/posts/recent", get(posts::recent))
        .route("/posts/{post_id}", get(posts::get_post))
        .route("/posts/{post_id}/like", post(posts::like))
        .route("/posts/{post_id}/vote", post(posts::vote))
        .route(
            "/posts/{post_id}/comments",
            get(posts::list_comments).post(posts::add_comment),
        )
        .route(
            "/conversations",
            get(messages::list_conversations).post(messages::start_conversation),
        )
        .route(
            "/conversations/{conversation_id}/messages",
            get(messages::list_messages).post(messages::send_message),
        )
        .route("/notifications", get(notifications::list))
        .route("/notifications/unread-count", get(notifications::unread_count))
        .route("/search", get(search::search))
        .route("/query", post(query::run_query))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    // The gateway authenticates with its own Identify handshake.
    let ws_route = Router::new().route("/gateway", get(ws_upgrade));

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let registrar = state.registrar.clone();
    let jwt_secret = state.jwt_secret.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, registrar, jwt_secret))
}
