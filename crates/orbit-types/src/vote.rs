//! Per-user vote and like transitions on a post.
//!
//! These mutate the post in memory only; the store persists the result inside
//! one transaction so the counters can't drift from the membership sets.

use serde::{Deserialize, Serialize};

use crate::models::Post;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteState {
    None,
    Upvoted,
    Downvoted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VoteDirection {
    Up,
    Down,
}

impl VoteState {
    /// State reached by pressing `direction` while in `self`.
    pub fn press(self, direction: VoteDirection) -> Self {
        match (self, direction) {
            (Self::Upvoted, VoteDirection::Up) | (Self::Downvoted, VoteDirection::Down) => {
                Self::None
            }
            (_, VoteDirection::Up) => Self::Upvoted,
            (_, VoteDirection::Down) => Self::Downvoted,
        }
    }

    /// Contribution of this state to a post's score.
    pub fn weight(self) -> i64 {
        match self {
            Self::None => 0,
            Self::Upvoted => 1,
            Self::Downvoted => -1,
        }
    }
}

impl Post {
    pub fn vote_state(&self, user_id: &str) -> VoteState {
        if self.upvotes.iter().any(|u| u == user_id) {
            VoteState::Upvoted
        } else if self.downvotes.iter().any(|u| u == user_id) {
            VoteState::Downvoted
        } else {
            VoteState::None
        }
    }

    /// Upvotes minus downvotes.
    pub fn score(&self) -> i64 {
        self.upvotes.len() as i64 - self.downvotes.len() as i64
    }

    /// Apply a vote press. Returns the new state and the score delta.
    pub fn apply_vote(&mut self, user_id: &str, direction: VoteDirection) -> (VoteState, i64) {
        let before = self.vote_state(user_id);
        let after = before.press(direction);

        self.upvotes.retain(|u| u != user_id);
        self.downvotes.retain(|u| u != user_id);
        match after {
            VoteState::Upvoted => self.upvotes.push(user_id.to_string()),
            VoteState::Downvoted => self.downvotes.push(user_id.to_string()),
            VoteState::None => {}
        }

        (after, after.weight() - before.weight())
    }

    pub fn is_liked_by(&self, user_id: &str) -> bool {
        self.liked_by.iter().any(|u| u == user_id)
    }

    /// Flip `user_id`'s like. Returns true when the post is now liked.
    pub fn toggle_like(&mut self, user_id: &str) -> bool {
        if self.is_liked_by(user_id) {
            self.liked_by.retain(|u| u != user_id);
            self.likes = (self.likes - 1).max(0);
            false
        } else {
            self.liked_by.push(user_id.to_string());
            self.likes += 1;
            true
        }
    }
}
