use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{EncodingKey, Header, encode};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tower::ServiceExt;
use uuid::Uuid;

use orbit_api::auth::create_token;
use orbit_api::{AppState, AppStateInner, router};
use orbit_db::Database;
use orbit_gateway::Dispatcher;
use orbit_types::api::Claims;
use orbit_types::events::{ErrorKind, GatewayEvent};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "gateway-secret";

/// Serves the full router on an ephemeral port. Returns the router for
/// driving writes, the shared state and the gateway URL.
async fn serve() -> (Router, AppState, String) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let state = AppStateInner::new(db, SECRET.into(), Dispatcher::default());
    let app = router(state.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = app.clone();
    tokio::spawn(async move { axum::serve(listener, server).await });

    (app, state, format!("ws://{}/gateway", addr))
}

/// Creates a user directly in the store and returns (id, token).
fn user(state: &AppState, username: &str) -> (Uuid, String) {
    let user = state
        .db
        .create_user(username, &format!("{}@example.com", username), "h")
        .unwrap();
    let id: Uuid = user.id.parse().unwrap();
    (id, create_token(SECRET, id, &user.username).unwrap())
}

async fn send(ws: &mut Socket, command: Value) {
    ws.send(Message::Text(command.to_string().into())).await.unwrap();
}

async fn next_event(ws: &mut Socket) -> GatewayEvent {
    loop {
        let frame = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {:?}", other),
        }
    }
}

/// The server hangs up without ever sending an event.
async fn assert_closed_without_events(ws: &mut Socket) {
    loop {
        match timeout(Duration::from_secs(5), ws.next()).await.expect("socket stayed open") {
            None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
            Some(Ok(Message::Text(text))) => panic!("expected the socket to close, got {}", text),
            Some(Ok(_)) => continue,
        }
    }
}

async fn identify(url: &str, token: &str) -> Socket {
    let (mut ws, _) = connect_async(url).await.unwrap();
    send(&mut ws, json!({ "type": "Identify", "data": { "token": token } })).await;
    ws
}

#[tokio::test]
async fn bad_or_expired_tokens_are_turned_away() {
    let (_, state, url) = serve().await;

    let mut ws = identify(&url, "not-a-jwt").await;
    assert_closed_without_events(&mut ws).await;

    let (id, _) = user(&state, "alice");
    let forged = create_token("some-other-secret", id, "alice").unwrap();
    let mut ws = identify(&url, &forged).await;
    assert_closed_without_events(&mut ws).await;

    let expired = Claims {
        sub: id,
        username: "alice".into(),
        exp: (chrono::Utc::now() - chrono::Duration::hours(1)).timestamp() as usize,
    };
    let expired = encode(&Header::default(), &expired, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap();
    let mut ws = identify(&url, &expired).await;
    assert_closed_without_events(&mut ws).await;
}

#[tokio::test]
async fn live_query_over_the_socket() {
    let (app, state, url) = serve().await;
    let (alice_id, token) = user(&state, "alice");

    let mut ws = identify(&url, &token).await;
    assert_eq!(
        next_event(&mut ws).await,
        GatewayEvent::Ready {
            user_id: alice_id,
            username: "alice".into()
        }
    );

    send(
        &mut ws,
        json!({
            "type": "Subscribe",
            "data": {
                "subscription_id": "feed",
                "query": {
                    "collection": "posts",
                    "order_by": { "field": "created_at", "direction": "desc" }
                }
            }
        }),
    )
    .await;
    match next_event(&mut ws).await {
        GatewayEvent::Snapshot { subscription_id, documents } => {
            assert_eq!(subscription_id, "feed");
            assert!(documents.is_empty());
        }
        other => panic!("expected the first snapshot, got {:?}", other),
    }

    let req = Request::builder()
        .method("POST")
        .uri("/posts")
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(json!({ "title": "over the wire", "content": "x" }).to_string()))
        .unwrap();
    assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::CREATED);

    match next_event(&mut ws).await {
        GatewayEvent::Snapshot { subscription_id, documents } => {
            assert_eq!(subscription_id, "feed");
            assert_eq!(documents.len(), 1);
            assert_eq!(documents[0].data["title"], "over the wire");
        }
        other => panic!("expected a fresh snapshot, got {:?}", other),
    }

    send(&mut ws, json!({ "type": "Unsubscribe", "data": { "subscription_id": "feed" } })).await;
    assert_eq!(
        next_event(&mut ws).await,
        GatewayEvent::Unsubscribed {
            subscription_id: "feed".into()
        }
    );
    assert_eq!(state.dispatcher.live_subscriptions(), 0);
}

#[tokio::test]
async fn someone_elses_notifications_fail_the_subscription() {
    let (_, state, url) = serve().await;
    let (_, token) = user(&state, "alice");
    let (bob_id, _) = user(&state, "bob");

    let mut ws = identify(&url, &token).await;
    assert!(matches!(next_event(&mut ws).await, GatewayEvent::Ready { .. }));

    send(
        &mut ws,
        json!({
            "type": "Subscribe",
            "data": {
                "subscription_id": "badge",
                "query": {
                    "collection": "notifications",
                    "filters": [{ "field": "user_id", "op": "==", "value": bob_id.to_string() }]
                }
            }
        }),
    )
    .await;
    match next_event(&mut ws).await {
        GatewayEvent::SubscriptionError { subscription_id, kind, .. } => {
            assert_eq!(subscription_id, "badge");
            assert_eq!(kind, ErrorKind::PermissionDenied);
        }
        other => panic!("expected a subscription error, got {:?}", other),
    }
}
