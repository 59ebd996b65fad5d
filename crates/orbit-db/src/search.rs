//! Prefix search over users, posts and tags.

use chrono::Duration;
use orbit_types::api::{DateRange, SearchParams, SearchResponse, SearchTab, SortBy};
use orbit_types::models::{Collection, Post, Tag, User, timestamp};
use orbit_types::query::{Cursor, Direction, Filter, FilterOp, Page, Query};
use rusqlite::Connection;

use crate::documents::find_page;
use crate::{Database, DbError, Result};

pub const SEARCH_PAGE_SIZE: u32 = 10;

impl Database {
    /// Search one tab, or every tab at once for `SearchTab::All`. The `all`
    /// tab returns first pages only, so a cursor is only accepted when a
    /// single tab is selected.
    pub fn search(&self, params: &SearchParams) -> Result<SearchResponse> {
        let term = params.q.trim().to_lowercase();
        let cursor = params.cursor.as_deref().map(Cursor::decode).transpose()?;

        if params.tab == SearchTab::All {
            if cursor.is_some() {
                return Err(DbError::Validation("pick a tab to page through search results".into()));
            }
            if term.is_empty() {
                return Ok(SearchResponse::default());
            }
        }

        self.with_conn(|conn| {
            let mut response = SearchResponse::default();
            if matches!(params.tab, SearchTab::All | SearchTab::Users) {
                response.users = Some(search_users(conn, &term, cursor.clone())?);
            }
            if matches!(params.tab, SearchTab::All | SearchTab::Posts) {
                response.posts = Some(search_posts(conn, &term, params.date, params.sort_by, cursor.clone())?);
            }
            if matches!(params.tab, SearchTab::All | SearchTab::Tags) {
                response.tags = Some(search_tags(conn, &term, cursor)?);
            }
            Ok(response)
        })
    }
}

fn search_users(conn: &Connection, term: &str, cursor: Option<Cursor>) -> Result<Page<User>> {
    let query = Query::new(Collection::Users)
        .filter("username", FilterOp::StartsWith, term)
        .order_by("username", Direction::Asc)
        .limit(SEARCH_PAGE_SIZE)
        .start_after(cursor);
    find_page(conn, &query)
}

/// Posts whose title starts with `term` or that carry it as a tag.
fn search_posts(
    conn: &Connection,
    term: &str,
    date: DateRange,
    sort_by: SortBy,
    cursor: Option<Cursor>,
) -> Result<Page<Post>> {
    let mut query = Query::new(Collection::Posts);
    if !term.is_empty() {
        query = query
            .any(Filter::new("search_title", FilterOp::StartsWith, term))
            .any(Filter::new("tags", FilterOp::ArrayContains, term));
    }
    if let Some(days) = date.days() {
        let since = timestamp::now() - Duration::days(days);
        query = query.filter("created_at", FilterOp::Ge, timestamp::format(&since));
    }
    let order = match sort_by {
        SortBy::Recent => "created_at",
        SortBy::Likes => "likes",
    };
    let query = query
        .order_by(order, Direction::Desc)
        .limit(SEARCH_PAGE_SIZE)
        .start_after(cursor);
    find_page(conn, &query)
}

fn search_tags(conn: &Connection, term: &str, cursor: Option<Cursor>) -> Result<Page<Tag>> {
    let query = Query::new(Collection::Tags)
        .filter("name", FilterOp::StartsWith, term)
        .order_by("name", Direction::Asc)
        .limit(SEARCH_PAGE_SIZE)
        .start_after(cursor);
    find_page(conn, &query)
}
