use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Collection, Document};
use crate::query::Query;

/// Broad failure categories surfaced to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    PermissionDenied,
    NotFound,
    Conflict,
    Unavailable,
    Internal,
}

/// Published after every write so live queries on that collection re-evaluate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub collection: Collection,
}

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, username: String },

    /// Full, ordered result set of a live query
    Snapshot {
        subscription_id: String,
        documents: Vec<Document>,
    },

    /// Terminal failure of a live query; nothing further is delivered for it
    SubscriptionError {
        subscription_id: String,
        kind: ErrorKind,
        message: String,
    },

    /// Acknowledges an Unsubscribe
    Unsubscribed { subscription_id: String },
}

impl GatewayEvent {
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::Snapshot { subscription_id, .. }
            | Self::SubscriptionError { subscription_id, .. }
            | Self::Unsubscribed { subscription_id } => Some(subscription_id),
            Self::Ready { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection
    Identify { token: String },

    /// Open a live query. Reusing an id replaces the previous registration.
    Subscribe { subscription_id: String, query: Query },

    /// Release a live query
    Unsubscribe { subscription_id: String },
}
