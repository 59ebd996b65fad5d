use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Post, Tag, User, UserSettings};
use crate::query::Page;
use crate::vote::{VoteDirection, VoteState};

// -- JWT Claims --

/// JWT claims shared across orbit-api (REST middleware) and orbit-gateway
/// (WebSocket authentication).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub username: String,
    pub exp: usize,
}

/// Usernames are stored lowercased so prefix search is case-insensitive.
/// Returns `None` when the name is unusable.
pub fn normalize_username(raw: &str) -> Option<String> {
    let name = raw.trim().to_lowercase();
    let ok = (3..=32).contains(&name.len())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.');
    ok.then_some(name)
}

// -- Auth --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub username: String,
    pub token: String,
}

// -- Users --

/// Profile and settings form. Absent fields are left untouched.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateProfileRequest {
    pub username: Option<String>,
    pub bio: Option<String>,
    pub location: Option<String>,
    pub website: Option<String>,
    pub profile_picture: Option<String>,
    pub settings: Option<UserSettings>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub posts: usize,
    pub followers: usize,
    pub following: usize,
    pub likes: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FollowResponse {
    pub following: bool,
    pub followers: usize,
}

// -- Posts --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreatePostRequest {
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub media: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PageParams {
    pub cursor: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LikeResponse {
    pub liked: bool,
    pub likes: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VoteRequest {
    pub direction: VoteDirection,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub state: VoteState,
    pub score: i64,
}

// -- Comments --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateCommentRequest {
    pub content: String,
}

// -- Messaging --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StartConversationRequest {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub text: String,
}

// -- Notifications --

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadCount {
    pub count: usize,
    pub label: Option<String>,
}

// -- Search --

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchTab {
    #[default]
    All,
    Users,
    Posts,
    Tags,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateRange {
    #[default]
    All,
    Week,
    Month,
}

impl DateRange {
    pub fn days(self) -> Option<i64> {
        match self {
            Self::All => None,
            Self::Week => Some(7),
            Self::Month => Some(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortBy {
    #[default]
    Recent,
    Likes,
}

#[derive(Debug, Default, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
    #[serde(default)]
    pub tab: SearchTab,
    #[serde(default)]
    pub date: DateRange,
    #[serde(default)]
    pub sort_by: SortBy,
    pub cursor: Option<String>,
}

/// Results per tab; tabs that weren't searched are absent.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SearchResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub users: Option<Page<User>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posts: Option<Page<Post>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Page<Tag>>,
}

// -- Errors --

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: crate::events::ErrorKind,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_normalized() {
        assert_eq!(normalize_username("  Alice_B ").as_deref(), Some("alice_b"));
        assert_eq!(normalize_username("ab"), None);
        assert_eq!(normalize_username("has space"), None);
        assert_eq!(normalize_username(&"x".repeat(33)), None);
    }

    #[test]
    fn search_params_default() {
        let p: SearchParams = serde_json::from_str(r#"{ "q": "rust", "tab": "posts", "sort_by": "likes" }"#).unwrap();
        assert_eq!(p.tab, SearchTab::Posts);
        assert_eq!(p.date, DateRange::All);
        assert_eq!(p.sort_by, SortBy::Likes);
    }
}
