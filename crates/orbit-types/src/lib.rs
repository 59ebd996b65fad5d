//! Shared types for the Orbit service: documents and entities, query
//! descriptors, gateway wire events, and the client-side live view.

pub mod api;
pub mod events;
pub mod models;
pub mod query;
pub mod view;
pub mod vote;
