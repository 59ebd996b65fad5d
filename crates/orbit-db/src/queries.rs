use orbit_types::api::{
    CreatePostRequest, FollowResponse, UpdateProfileRequest, UserStats, normalize_username,
};
use orbit_types::models::{
    Collection, Comment, Notification, NotificationKind, Post, Tag, User, timestamp,
};
use orbit_types::query::{Cursor, Direction, Page, Query};
use orbit_types::vote::{VoteDirection, VoteState};
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::documents::{count, find, find_page, insert, load, require, save};
use crate::models::CredentialRow;
use crate::{Database, DbError, Result};

pub const FEED_PAGE_SIZE: u32 = 10;
pub const RECENT_POSTS: u32 = 5;

const MAX_TITLE_LEN: usize = 200;
const MAX_CONTENT_LEN: usize = 10_000;
const MAX_TAGS: usize = 10;

impl Database {
    // -- Users --

    /// Create the credentials row and the public user document together.
    pub fn create_user(&self, username: &str, email: &str, password_hash: &str) -> Result<User> {
        let username = normalize_username(username)
            .ok_or_else(|| DbError::Validation("username must be 3-32 letters, digits, '_' or '.'".into()))?;
        let email = email.trim();
        if !email.contains('@') {
            return Err(DbError::Validation("email address is not valid".into()));
        }

        self.with_tx(|tx| {
            if username_taken(tx, &username)? {
                return Err(DbError::Conflict(format!("username '{}' is taken", username)));
            }
            let user = User::new(Uuid::new_v4().to_string(), username.clone(), email.to_string());
            tx.execute(
                "INSERT INTO credentials (user_id, username, password, created_at) VALUES (?1, ?2, ?3, ?4)",
                (&user.id, &user.username, password_hash, timestamp::format(&user.created_at)),
            )?;
            insert(tx, &user)?;
            debug!("Created user {} ({})", user.username, user.id);
            Ok(user)
        })
    }

    pub fn get_credentials(&self, username: &str) -> Result<Option<CredentialRow>> {
        let username = username.trim().to_lowercase();
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, username, password, created_at FROM credentials WHERE username = ?1",
                    [&username],
                    |row| {
                        Ok(CredentialRow {
                            user_id: row.get(0)?,
                            username: row.get(1)?,
                            password: row.get(2)?,
                            created_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    pub fn get_user(&self, id: &str) -> Result<User> {
        self.with_conn(|conn| require(conn, id))
    }

    pub fn update_profile(&self, user_id: &str, req: &UpdateProfileRequest) -> Result<User> {
        self.with_tx(|tx| {
            let mut user: User = require(tx, user_id)?;

            if let Some(raw) = &req.username {
                let username = normalize_username(raw)
                    .ok_or_else(|| DbError::Validation(format!("invalid username '{}'", raw.trim())))?;
                if username != user.username {
                    if username_taken(tx, &username)? {
                        return Err(DbError::Conflict(format!("username '{}' is taken", username)));
                    }
                    tx.execute(
                        "UPDATE credentials SET username = ?1 WHERE user_id = ?2",
                        (&username, user_id),
                    )?;
                    user.username = username;
                }
            }
            if let Some(bio) = &req.bio {
                user.bio = bio.trim().to_string();
            }
            if let Some(location) = &req.location {
                user.location = non_empty(location);
            }
            if let Some(website) = &req.website {
                user.website = non_empty(website);
            }
            if let Some(picture) = &req.profile_picture {
                user.profile_picture = non_empty(picture);
            }
            if let Some(settings) = &req.settings {
                user.settings = settings.clone();
            }
            user.updated_at = Some(timestamp::now());

            save(tx, &user)?;
            Ok(user)
        })
    }

    /// Follow `target_id`, or unfollow if already following. Both sides of
    /// the edge change in one transaction.
    pub fn toggle_follow(&self, user_id: &str, target_id: &str) -> Result<FollowResponse> {
        if user_id == target_id {
            return Err(DbError::Validation("you cannot follow yourself".into()));
        }
        self.with_tx(|tx| {
            let mut me: User = require(tx, user_id)?;
            let mut target: User = require(tx, target_id)?;

            let following = !me.following.iter().any(|id| id == target_id);
            if following {
                me.following.push(target_id.to_string());
                target.followers.push(user_id.to_string());
            } else {
                me.following.retain(|id| id != target_id);
                target.followers.retain(|id| id != user_id);
            }

            save(tx, &me)?;
            save(tx, &target)?;
            Ok(FollowResponse {
                following,
                followers: target.followers.len(),
            })
        })
    }

    pub fn user_stats(&self, user_id: &str) -> Result<UserStats> {
        self.with_conn(|conn| {
            let user: User = require(conn, user_id)?;
            let posts: Vec<Post> = find(conn, &Query::new(Collection::Posts).where_eq("author.id", user_id))?;
            Ok(UserStats {
                posts: posts.len(),
                followers: user.followers.len(),
                following: user.following.len(),
                likes: posts.iter().map(|p| p.likes).sum(),
            })
        })
    }

    // -- Posts --

    pub fn create_post(&self, author_id: &str, req: &CreatePostRequest) -> Result<Post> {
        let title = req.title.trim();
        let content = req.content.trim();
        if title.is_empty() || content.is_empty() {
            return Err(DbError::Validation("title and content are required".into()));
        }
        if title.chars().count() > MAX_TITLE_LEN || content.chars().count() > MAX_CONTENT_LEN {
            return Err(DbError::Validation("post is too long".into()));
        }
        let tags = normalize_tags(&req.tags);
        if tags.len() > MAX_TAGS {
            return Err(DbError::Validation(format!("at most {} tags per post", MAX_TAGS)));
        }

        self.with_tx(|tx| {
            let author: User = require(tx, author_id)?;
            let post = Post {
                id: Uuid::new_v4().to_string(),
                author: author.summary(),
                title: title.to_string(),
                search_title: title.to_lowercase(),
                content: content.to_string(),
                media: req.media.as_deref().and_then(non_empty),
                tags,
                likes: 0,
                liked_by: vec![],
                upvotes: vec![],
                downvotes: vec![],
                created_at: timestamp::now(),
            };
            insert(tx, &post)?;

            for name in &post.tags {
                let mut tag: Tag = load(tx, name)?.unwrap_or_else(|| Tag {
                    id: name.clone(),
                    name: name.clone(),
                    count: 0,
                });
                tag.count += 1;
                save(tx, &tag)?;
            }

            debug!("Post {} created by {}", post.id, author.username);
            Ok(post)
        })
    }

    pub fn get_post(&self, id: &str) -> Result<Post> {
        self.with_conn(|conn| require(conn, id))
    }

    /// Newest posts first, ten per page.
    pub fn feed(&self, cursor: Option<Cursor>) -> Result<Page<Post>> {
        let query = Query::new(Collection::Posts)
            .order_by("created_at", Direction::Desc)
            .limit(FEED_PAGE_SIZE)
            .start_after(cursor);
        self.with_conn(|conn| find_page(conn, &query))
    }

    pub fn recent_posts(&self) -> Result<Vec<Post>> {
        let query = Query::new(Collection::Posts)
            .order_by("created_at", Direction::Desc)
            .limit(RECENT_POSTS);
        self.with_conn(|conn| find(conn, &query))
    }

    pub fn posts_by_author(&self, author_id: &str, cursor: Option<Cursor>, limit: u32) -> Result<Page<Post>> {
        let query = Query::new(Collection::Posts)
            .where_eq("author.id", author_id)
            .order_by("created_at", Direction::Desc)
            .limit(limit)
            .start_after(cursor);
        self.with_conn(|conn| find_page(conn, &query))
    }

    /// Flip the caller's like on a post. The author hears about new likes
    /// from anyone but themself.
    pub fn toggle_like(&self, post_id: &str, user_id: &str) -> Result<Post> {
        self.with_tx(|tx| {
            let mut post: Post = require(tx, post_id)?;
            let liked = post.toggle_like(user_id);
            save(tx, &post)?;

            if liked && post.author.id != user_id {
                let user: User = require(tx, user_id)?;
                notify(
                    tx,
                    &post.author.id,
                    "New Like",
                    format!("{} liked your post \"{}\"", user.username, post.title),
                )?;
            }
            Ok(post)
        })
    }

    pub fn vote(&self, post_id: &str, user_id: &str, direction: VoteDirection) -> Result<(Post, VoteState)> {
        self.with_tx(|tx| {
            let mut post: Post = require(tx, post_id)?;
            let (state, delta) = post.apply_vote(user_id, direction);
            save(tx, &post)?;
            debug!("Vote on {} by {}: {:?} ({:+})", post_id, user_id, state, delta);
            Ok((post, state))
        })
    }

    // -- Comments --

    pub fn add_comment(&self, post_id: &str, author_id: &str, content: &str) -> Result<Comment> {
        let content = content.trim();
        if content.is_empty() {
            return Err(DbError::Validation("comment cannot be empty".into()));
        }
        if content.chars().count() > MAX_CONTENT_LEN {
            return Err(DbError::Validation("comment is too long".into()));
        }

        self.with_tx(|tx| {
            let post: Post = require(tx, post_id)?;
            let author: User = require(tx, author_id)?;
            let comment = Comment {
                id: Uuid::new_v4().to_string(),
                post_id: post.id.clone(),
                author: author.summary(),
                content: content.to_string(),
                created_at: timestamp::now(),
            };
            insert(tx, &comment)?;

            if post.author.id != author_id {
                notify(
                    tx,
                    &post.author.id,
                    "New Comment",
                    format!("{} commented on your post \"{}\"", author.username, post.title),
                )?;
            }
            Ok(comment)
        })
    }

    /// Newest first.
    pub fn list_comments(&self, post_id: &str) -> Result<Vec<Comment>> {
        self.with_conn(|conn| {
            require::<Post>(conn, post_id)?;
            find(
                conn,
                &Query::new(Collection::Comments)
                    .where_eq("post_id", post_id)
                    .order_by("created_at", Direction::Desc),
            )
        })
    }

    // -- Notifications --

    /// Newest first, as they were before this call. Every unread one is
    /// marked read as part of viewing. Returns the list and how many flipped.
    pub fn view_notifications(&self, user_id: &str) -> Result<(Vec<Notification>, usize)> {
        self.with_tx(|tx| {
            let list: Vec<Notification> = find(
                tx,
                &Query::new(Collection::Notifications)
                    .where_eq("user_id", user_id)
                    .order_by("created_at", Direction::Desc),
            )?;

            let mut marked = 0;
            for n in list.iter().filter(|n| !n.read) {
                let mut n = n.clone();
                n.read = true;
                save(tx, &n)?;
                marked += 1;
            }
            Ok((list, marked))
        })
    }

    pub fn unread_count(&self, user_id: &str) -> Result<usize> {
        self.with_conn(|conn| count(conn, &unread_query(user_id)))
    }
}

/// The badge query: a user's unread notifications.
pub fn unread_query(user_id: &str) -> Query {
    Query::new(Collection::Notifications)
        .where_eq("user_id", user_id)
        .where_eq("read", false)
}

fn username_taken(conn: &Connection, username: &str) -> Result<bool> {
    let found: Option<String> = conn
        .query_row(
            "SELECT user_id FROM credentials WHERE username = ?1",
            [username],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn notify(conn: &Connection, user_id: &str, title: &str, message: String) -> Result<()> {
    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        kind: NotificationKind::Info,
        title: title.to_string(),
        message,
        read: false,
        created_at: timestamp::now(),
    };
    insert(conn, &notification)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Trimmed, lowercased, without a leading '#', first occurrence wins.
fn normalize_tags(raw: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in raw {
        let tag = tag.trim().trim_start_matches('#').trim().to_lowercase();
        if !tag.is_empty() && !tags.contains(&tag) {
            tags.push(tag);
        }
    }
    tags
}
