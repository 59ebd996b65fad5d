//! Who may run which query. Private collections must be constrained to the
//! caller in the query itself, so a live result can never include another
//! user's documents.

use orbit_db::{Database, DbError, Result};
use orbit_types::models::Collection;
use orbit_types::query::Query;
use serde_json::Value;

pub fn authorize(db: &Database, caller: &str, query: &Query) -> Result<()> {
    query.validate()?;

    match query.collection {
        Collection::Notifications => {
            if !is_caller(query.eq_constraint("user_id"), caller) {
                return Err(denied("notifications must be filtered by user_id == you"));
            }
        }
        Collection::Conversations => {
            if !is_caller(query.contains_constraint("participants"), caller) {
                return Err(denied("conversations must be filtered by participants array-contains you"));
            }
        }
        Collection::Messages => {
            let conversation_id = query
                .eq_constraint("conversation_id")
                .and_then(Value::as_str)
                .ok_or_else(|| denied("messages must be filtered by conversation_id"))?;
            if !db.is_participant(conversation_id, caller)? {
                return Err(denied("not a participant of that conversation"));
            }
        }
        Collection::Users | Collection::Posts | Collection::Comments | Collection::Tags => {}
    }
    Ok(())
}

fn is_caller(value: Option<&Value>, caller: &str) -> bool {
    value.and_then(Value::as_str) == Some(caller)
}

fn denied(reason: &str) -> DbError {
    DbError::Forbidden(reason.to_string())
}
