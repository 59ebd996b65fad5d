use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Named document collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Collection {
    Users,
    Posts,
    Comments,
    Conversations,
    Messages,
    Notifications,
    Tags,
}

impl Collection {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Posts => "posts",
            Self::Comments => "comments",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::Notifications => "notifications",
            Self::Tags => "tags",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A raw document as stored: its id plus the full JSON body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub data: serde_json::Value,
}

impl Document {
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// Typed entities that live in a collection.
pub trait Entity: Serialize + DeserializeOwned + Send + 'static {
    const COLLECTION: Collection;

    fn id(&self) -> &str;
}

/// Server timestamps are stored with microsecond precision in a fixed-width
/// RFC 3339 form so that string order matches time order inside the store.
pub mod timestamp {
    use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn now() -> DateTime<Utc> {
        Utc::now().trunc_subsecs(6)
    }

    pub fn format(ts: &DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn serialize<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&format(ts))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(d)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }

    pub mod option {
        use chrono::{DateTime, Utc};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            ts: &Option<DateTime<Utc>>,
            s: S,
        ) -> Result<S::Ok, S::Error> {
            match ts {
                Some(ts) => super::serialize(ts, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            let raw: Option<String> = Option::deserialize(d)?;
            raw.map(|raw| {
                DateTime::parse_from_rfc3339(&raw)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(serde::de::Error::custom)
            })
            .transpose()
        }
    }
}

// -- Users --

/// Denormalized copy of a user embedded in posts, comments and conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: String,
    pub username: String,
    #[serde(default)]
    pub profile_picture: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSettings {
    pub email_notifications: bool,
    pub push_notifications: bool,
    pub language: String,
}

impl Default for UserSettings {
    fn default() -> Self {
        Self {
            email_notifications: true,
            push_notifications: true,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub bio: String,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub website: Option<String>,
    #[serde(default)]
    pub profile_picture: Option<String>,
    #[serde(default)]
    pub followers: Vec<String>,
    #[serde(default)]
    pub following: Vec<String>,
    #[serde(default)]
    pub settings: UserSettings,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "timestamp::option")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(id: String, username: String, email: String) -> Self {
        Self {
            id,
            username,
            email,
            bio: String::new(),
            location: None,
            website: None,
            profile_picture: None,
            followers: vec![],
            following: vec![],
            settings: UserSettings::default(),
            created_at: timestamp::now(),
            updated_at: None,
        }
    }

    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id.clone(),
            username: self.username.clone(),
            profile_picture: self.profile_picture.clone(),
        }
    }
}

impl Entity for User {
    const COLLECTION: Collection = Collection::Users;

    fn id(&self) -> &str {
        &self.id
    }
}

// -- Posts --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub author: UserSummary,
    pub title: String,
    /// Lowercased title, the key used by prefix search.
    #[serde(default)]
    pub search_title: String,
    pub content: String,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub likes: i64,
    #[serde(default)]
    pub liked_by: Vec<String>,
    #[serde(default)]
    pub upvotes: Vec<String>,
    #[serde(default)]
    pub downvotes: Vec<String>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Entity for Post {
    const COLLECTION: Collection = Collection::Posts;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub id: String,
    pub post_id: String,
    pub author: UserSummary,
    pub content: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Entity for Comment {
    const COLLECTION: Collection = Collection::Comments;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
    pub count: i64,
}

impl Entity for Tag {
    const COLLECTION: Collection = Collection::Tags;

    fn id(&self) -> &str {
        &self.id
    }
}

// -- Messaging --

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participants: Vec<String>,
    pub participant_details: BTreeMap<String, UserSummary>,
    /// Both participant ids, sorted and joined with ':'.
    pub pair_key: String,
    #[serde(with = "timestamp")]
    pub last_message_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Conversation {
    pub fn pair_key(a: &str, b: &str) -> String {
        if a <= b {
            format!("{}:{}", a, b)
        } else {
            format!("{}:{}", b, a)
        }
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The participant that isn't `user_id`.
    pub fn other_participant(&self, user_id: &str) -> Option<&UserSummary> {
        self.participants
            .iter()
            .find(|p| p.as_str() != user_id)
            .and_then(|p| self.participant_details.get(p))
    }
}

impl Entity for Conversation {
    const COLLECTION: Collection = Collection::Conversations;

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Entity for Message {
    const COLLECTION: Collection = Collection::Messages;

    fn id(&self) -> &str {
        &self.id
    }
}

// -- Notifications --

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub read: bool,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
}

impl Entity for Notification {
    const COLLECTION: Collection = Collection::Notifications;

    fn id(&self) -> &str {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_serialize_fixed_width() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let later = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);

        let a = timestamp::format(&early);
        let b = timestamp::format(&later);
        assert_eq!(a, "2026-01-01T00:00:00.000000Z");
        assert_eq!(a.len(), b.len());
        assert!(a < b);
    }

    #[test]
    fn pair_key_is_order_independent() {
        assert_eq!(Conversation::pair_key("b", "a"), Conversation::pair_key("a", "b"));
        assert_eq!(Conversation::pair_key("a", "b"), "a:b");
    }

    #[test]
    fn notification_kind_serializes_as_type() {
        let n = Notification {
            id: "n1".into(),
            user_id: "u1".into(),
            kind: NotificationKind::Info,
            title: "New Like".into(),
            message: "someone liked your post".into(),
            read: false,
            created_at: timestamp::now(),
        };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["type"], "info");
        let back: Notification = serde_json::from_value(value).unwrap();
        assert_eq!(back, n);
    }
}
