use std::sync::Arc;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use jsonwebtoken::{EncodingKey, Header, encode};
use rand_core::OsRng;
use tracing::info;
use uuid::Uuid;

use orbit_db::Database;
use orbit_gateway::{Dispatcher, Registrar};
use orbit_types::api::{AuthResponse, Claims, LoginRequest, RegisterRequest};
use orbit_types::models::Collection;

use crate::error::ApiError;

const MIN_PASSWORD_LEN: usize = 8;
const TOKEN_LIFETIME_DAYS: i64 = 30;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
    pub registrar: Registrar,
}

impl AppStateInner {
    pub fn new(db: Arc<Database>, jwt_secret: String, dispatcher: Dispatcher) -> AppState {
        let registrar = Registrar::new(db.clone(), dispatcher.clone());
        Arc::new(Self {
            db,
            jwt_secret,
            dispatcher,
            registrar,
        })
    }
}

/// Run blocking store work off the async runtime.
pub async fn run_db<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> orbit_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    Ok(tokio::task::spawn_blocking(move || f(&db)).await??)
}

/// Run a store write off the async runtime and announce `changed` from the
/// same blocking task once it commits. The announcement does not depend on
/// the request future, so a client hanging up mid-write still wakes every
/// live query on those collections.
pub async fn run_write<T, F>(state: &AppState, changed: &'static [Collection], f: F) -> Result<T, ApiError>
where
    F: FnOnce(&Database) -> orbit_db::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = state.db.clone();
    let dispatcher = state.dispatcher.clone();
    Ok(tokio::task::spawn_blocking(move || {
        let out = f(&db)?;
        dispatcher.publish_all(changed);
        Ok::<_, orbit_db::DbError>(out)
    })
    .await??)
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::Validation(format!(
            "password must be at least {} characters",
            MIN_PASSWORD_LEN
        )));
    }

    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| ApiError::Internal(format!("password hashing failed: {}", e)))?
        .to_string();

    let user = run_write(&state, &[Collection::Users], move |db| {
        db.create_user(&req.username, &req.email, &password_hash)
    })
    .await?;

    let user_id = parse_user_id(&user.id)?;
    let token = create_token(&state.jwt_secret, user_id, &user.username)?;
    info!("Registered {} ({})", user.username, user.id);

    Ok((
        StatusCode::CREATED,
        Json(AuthResponse {
            user_id,
            username: user.username,
            token,
        }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let username = req.username.clone();
    let creds = run_db(&state, move |db| db.get_credentials(&username))
        .await?
        .ok_or(ApiError::Unauthorized("invalid username or password"))?;

    // Verify password
    let parsed_hash = PasswordHash::new(&creds.password)
        .map_err(|e| ApiError::Internal(format!("stored hash unreadable: {}", e)))?;
    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| ApiError::Unauthorized("invalid username or password"))?;

    let user_id = parse_user_id(&creds.user_id)?;
    let token = create_token(&state.jwt_secret, user_id, &creds.username)?;

    Ok(Json(AuthResponse {
        user_id,
        username: creds.username,
        token,
    }))
}

pub fn create_token(secret: &str, user_id: Uuid, username: &str) -> Result<String, ApiError> {
    let claims = Claims {
        sub: user_id,
        username: username.to_string(),
        exp: (chrono::Utc::now() + chrono::Duration::days(TOKEN_LIFETIME_DAYS)).timestamp() as usize,
    };

    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(format!("token encoding failed: {}", e)))
}

fn parse_user_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Internal(format!("stored user id is not a uuid: {}", raw)))
}
