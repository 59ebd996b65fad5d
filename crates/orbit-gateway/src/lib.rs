//! Live queries over WebSocket: a change dispatcher, the subscription
//! registrar that keeps each query's snapshot current, and the per-socket
//! connection loop.

pub mod access;
pub mod connection;
pub mod dispatcher;
pub mod registrar;

pub use dispatcher::Dispatcher;
pub use registrar::{Delivery, EventSink, Registrar, Subscription};

use orbit_db::DbError;
use orbit_types::events::ErrorKind;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl GatewayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(e) => e.kind(),
            Self::Join(_) => ErrorKind::Internal,
        }
    }
}
