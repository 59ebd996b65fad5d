use std::collections::BTreeMap;

use orbit_types::models::{Collection, Conversation, Message, User, timestamp};
use orbit_types::query::{Direction, FilterOp, Query};
use rusqlite::Connection;
use tracing::debug;
use uuid::Uuid;

use crate::documents::{find, insert, require, save};
use crate::{Database, DbError, Result};

const MAX_MESSAGE_LEN: usize = 4_000;

impl Database {
    /// Find the conversation between the two users, creating it on first
    /// contact. Returns the conversation and whether it was just created.
    pub fn start_conversation(&self, user_id: &str, other_id: &str) -> Result<(Conversation, bool)> {
        if user_id == other_id {
            return Err(DbError::Validation("cannot start a conversation with yourself".into()));
        }

        self.with_tx(|tx| {
            let pair_key = Conversation::pair_key(user_id, other_id);
            if let Some(existing) = find_by_pair(tx, &pair_key)? {
                return Ok((existing, false));
            }

            let me: User = require(tx, user_id)?;
            let other: User = require(tx, other_id)?;
            let now = timestamp::now();
            let conversation = Conversation {
                id: Uuid::new_v4().to_string(),
                participants: vec![me.id.clone(), other.id.clone()],
                participant_details: BTreeMap::from([
                    (me.id.clone(), me.summary()),
                    (other.id.clone(), other.summary()),
                ]),
                pair_key,
                last_message_at: now,
                created_at: now,
            };
            insert(tx, &conversation)?;

            debug!("Conversation {} started between {} and {}", conversation.id, me.username, other.username);
            Ok((conversation, true))
        })
    }

    pub fn send_message(&self, conversation_id: &str, sender_id: &str, text: &str) -> Result<Message> {
        let text = text.trim();
        if text.is_empty() {
            return Err(DbError::Validation("message cannot be empty".into()));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(DbError::Validation(format!(
                "message exceeds {} characters",
                MAX_MESSAGE_LEN
            )));
        }

        self.with_tx(|tx| {
            let mut conversation = participant_conversation(tx, conversation_id, sender_id)?;
            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation.id.clone(),
                sender_id: sender_id.to_string(),
                text: text.to_string(),
                created_at: timestamp::now(),
            };
            insert(tx, &message)?;

            conversation.last_message_at = message.created_at;
            save(tx, &conversation)?;
            Ok(message)
        })
    }

    /// Oldest first.
    pub fn list_messages(&self, conversation_id: &str, user_id: &str) -> Result<Vec<Message>> {
        self.with_conn(|conn| {
            participant_conversation(conn, conversation_id, user_id)?;
            find(conn, &messages_query(conversation_id))
        })
    }

    /// Most recently active first.
    pub fn list_conversations(&self, user_id: &str) -> Result<Vec<Conversation>> {
        self.with_conn(|conn| find(conn, &conversations_query(user_id)))
    }

    /// Whether `user_id` is one of the conversation's participants. A missing
    /// conversation counts as not participating.
    pub fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            match participant_conversation(conn, conversation_id, user_id) {
                Ok(_) => Ok(true),
                Err(DbError::Forbidden(_) | DbError::NotFound { .. }) => Ok(false),
                Err(e) => Err(e),
            }
        })
    }
}

pub fn conversations_query(user_id: &str) -> Query {
    Query::new(Collection::Conversations)
        .filter("participants", FilterOp::ArrayContains, user_id)
        .order_by("last_message_at", Direction::Desc)
}

pub fn messages_query(conversation_id: &str) -> Query {
    Query::new(Collection::Messages)
        .where_eq("conversation_id", conversation_id)
        .order_by("created_at", Direction::Asc)
}

fn find_by_pair(conn: &Connection, pair_key: &str) -> Result<Option<Conversation>> {
    let query = Query::new(Collection::Conversations)
        .where_eq("pair_key", pair_key)
        .limit(1);
    Ok(find(conn, &query)?.into_iter().next())
}

fn participant_conversation(conn: &Connection, conversation_id: &str, user_id: &str) -> Result<Conversation> {
    let conversation: Conversation = require(conn, conversation_id)?;
    if !conversation.has_participant(user_id) {
        return Err(DbError::Forbidden(format!(
            "not a participant of conversation {}",
            conversation_id
        )));
    }
    Ok(conversation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Database, User, User, User) {
        let db = Database::open_in_memory().unwrap();
        let alice = db.create_user("alice", "alice@example.com", "h").unwrap();
        let bob = db.create_user("bob", "bob@example.com", "h").unwrap();
        let carol = db.create_user("carol", "carol@example.com", "h").unwrap();
        (db, alice, bob, carol)
    }

    #[test]
    fn starting_twice_reuses_the_conversation() {
        let (db, alice, bob, _) = setup();
        let (first, created) = db.start_conversation(&alice.id, &bob.id).unwrap();
        assert!(created);
        let (again, created) = db.start_conversation(&bob.id, &alice.id).unwrap();
        assert!(!created);
        assert_eq!(first.id, again.id);
        assert_eq!(db.list_conversations(&alice.id).unwrap().len(), 1);
        assert_eq!(first.other_participant(&alice.id).unwrap().username, "bob");
    }

    #[test]
    fn pair_index_rejects_a_second_conversation() {
        let (db, alice, bob, _) = setup();
        let (mut dup, _) = db.start_conversation(&alice.id, &bob.id).unwrap();
        dup.id = "other".into();
        let res = db.with_conn(|conn| insert(conn, &dup));
        assert!(matches!(res, Err(DbError::Conflict(_))));
    }

    #[test]
    fn messages_bump_activity_and_list_oldest_first() {
        let (db, alice, bob, carol) = setup();
        let (with_bob, _) = db.start_conversation(&alice.id, &bob.id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let (with_carol, _) = db.start_conversation(&alice.id, &carol.id).unwrap();

        // carol's conversation is newer until bob's gets a message
        let order: Vec<_> = db.list_conversations(&alice.id).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec![with_carol.id.clone(), with_bob.id.clone()]);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let m1 = db.send_message(&with_bob.id, &alice.id, " hi bob ").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let m2 = db.send_message(&with_bob.id, &bob.id, "hey").unwrap();
        assert_eq!(m1.text, "hi bob");

        let order: Vec<_> = db.list_conversations(&alice.id).unwrap().into_iter().map(|c| c.id).collect();
        assert_eq!(order, vec![with_bob.id.clone(), with_carol.id]);

        let ids: Vec<_> = db.list_messages(&with_bob.id, &bob.id).unwrap().into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![m1.id, m2.id]);
    }

    #[test]
    fn outsiders_cannot_read_or_write() {
        let (db, alice, bob, carol) = setup();
        let (conv, _) = db.start_conversation(&alice.id, &bob.id).unwrap();

        assert!(matches!(db.send_message(&conv.id, &carol.id, "hi"), Err(DbError::Forbidden(_))));
        assert!(matches!(db.list_messages(&conv.id, &carol.id), Err(DbError::Forbidden(_))));
        assert!(!db.is_participant(&conv.id, &carol.id).unwrap());
        assert!(db.is_participant(&conv.id, &bob.id).unwrap());
        assert!(!db.is_participant("missing", &bob.id).unwrap());
    }

    #[test]
    fn blank_messages_and_self_conversations_are_rejected() {
        let (db, alice, bob, _) = setup();
        let (conv, _) = db.start_conversation(&alice.id, &bob.id).unwrap();
        assert!(matches!(db.send_message(&conv.id, &alice.id, "   "), Err(DbError::Validation(_))));
        assert!(matches!(db.start_conversation(&alice.id, &alice.id), Err(DbError::Validation(_))));
    }
}
