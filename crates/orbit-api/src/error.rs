use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::{error, warn};

use orbit_db::DbError;
use orbit_types::api::ErrorBody;
use orbit_types::events::ErrorKind;
use orbit_types::query::QueryError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(&'static str),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthorized(_) => ErrorKind::Unauthorized,
            Self::Validation(_) | Self::Query(_) => ErrorKind::Validation,
            Self::Db(e) => e.kind(),
            Self::Join(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = self.kind();
        let status = status_for(kind);

        // Internal details stay in the log.
        let message = if status.is_server_error() {
            error!("{}", self);
            "something went wrong, try again".to_string()
        } else {
            warn!("{}", self);
            self.to_string()
        };

        (status, Json(ErrorBody { error: kind, message })).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_errors_keep_their_category() {
        let err = ApiError::from(DbError::Forbidden("nope".into()));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
        assert_eq!(err.into_response().status(), StatusCode::FORBIDDEN);

        let err = ApiError::from(QueryError::MalformedCursor);
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn server_errors_hide_details() {
        let err = ApiError::Internal("disk on fire".into());
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
