//! HTTP surface of Orbit: auth, profiles, posts and engagement, messaging,
//! notifications, search and generic queries, plus the gateway upgrade.

pub mod auth;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod notifications;
pub mod posts;
pub mod query;
pub mod router;
pub mod search;
pub mod users;

pub use auth::{AppState, AppStateInner};
pub use error::ApiError;
pub use router::router;
