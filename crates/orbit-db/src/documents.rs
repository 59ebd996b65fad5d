//! Generic document storage and the query engine behind both one-shot and
//! live queries.
//!
//! Documents are JSON blobs in one table keyed by (collection, id). Filters
//! compile to `json_extract` predicates; values are always bound, and field
//! paths are validated by `Query::validate` before they are spliced into SQL.

use orbit_types::models::{Collection, Document, Entity};
use orbit_types::query::{Cursor, Direction, Filter, FilterOp, Page, Query, QueryError};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, ErrorCode, OptionalExtension, params_from_iter};
use serde_json::Value;
use tracing::trace;

use crate::{Database, DbError, Result};

impl Database {
    pub fn query(&self, query: &Query) -> Result<Vec<Document>> {
        self.with_conn(|conn| run_query(conn, query))
    }

    pub fn query_page(&self, query: &Query) -> Result<Page<Document>> {
        self.with_conn(|conn| query_page(conn, query))
    }

    pub fn count(&self, query: &Query) -> Result<usize> {
        self.with_conn(|conn| count(conn, query))
    }

    pub fn get_document(&self, collection: Collection, id: &str) -> Result<Option<Document>> {
        self.with_conn(|conn| get(conn, collection, id))
    }

    pub fn load<E: Entity>(&self, id: &str) -> Result<Option<E>> {
        self.with_conn(|conn| load(conn, id))
    }

    /// Insert or replace an entity as-is.
    pub fn save<E: Entity>(&self, entity: &E) -> Result<()> {
        self.with_conn(|conn| save(conn, entity))
    }
}

pub fn run_query(conn: &Connection, query: &Query) -> Result<Vec<Document>> {
    let compiled = compile(query, Select::Rows)?;
    trace!("query {}: {}", query.collection, compiled.sql);

    let mut stmt = conn.prepare(&compiled.sql)?;
    let rows = stmt
        .query_map(params_from_iter(compiled.params.iter()), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let docs = rows
        .into_iter()
        .map(|(id, data)| {
            Ok(Document {
                id,
                data: serde_json::from_str(&data)?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Reject the ordering here, before any page hands out a cursor it could
    // not resume from.
    if let Some(order) = &query.order_by {
        for doc in &docs {
            order.value_of(doc)?;
        }
    }
    Ok(docs)
}

pub fn count(conn: &Connection, query: &Query) -> Result<usize> {
    let compiled = compile(query, Select::Count)?;
    let n: i64 = conn.query_row(&compiled.sql, params_from_iter(compiled.params.iter()), |row| {
        row.get(0)
    })?;
    Ok(n as usize)
}

/// Run a limited query and describe where the next page starts. A full page
/// is taken to mean there may be more.
pub fn query_page(conn: &Connection, query: &Query) -> Result<Page<Document>> {
    let items = run_query(conn, query)?;
    let has_more = query.limit.is_some_and(|limit| items.len() == limit as usize);
    let next_cursor = match (&query.order_by, items.last()) {
        (Some(order), Some(last)) if has_more => Some(Cursor::after(last, order)?.encode()),
        _ => None,
    };
    Ok(Page {
        items,
        next_cursor,
        has_more,
    })
}

pub fn get(conn: &Connection, collection: Collection, id: &str) -> Result<Option<Document>> {
    let data: Option<String> = conn
        .query_row(
            "SELECT data FROM documents WHERE collection = ?1 AND id = ?2",
            (collection.as_str(), id),
            |row| row.get(0),
        )
        .optional()?;

    data.map(|data| {
        Ok(Document {
            id: id.to_string(),
            data: serde_json::from_str(&data)?,
        })
    })
    .transpose()
}

pub fn put_raw(conn: &Connection, collection: Collection, id: &str, data: &Value) -> Result<()> {
    conn.execute(
        "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)
         ON CONFLICT(collection, id) DO UPDATE SET data = excluded.data",
        (collection.as_str(), id, serde_json::to_string(data)?),
    )?;
    Ok(())
}

/// Insert a new entity; an existing id or a unique-index hit is a conflict.
pub fn insert<E: Entity>(conn: &Connection, entity: &E) -> Result<()> {
    let data = serde_json::to_string(entity)?;
    conn.execute(
        "INSERT INTO documents (collection, id, data) VALUES (?1, ?2, ?3)",
        (E::COLLECTION.as_str(), entity.id(), data),
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation => {
            DbError::Conflict(format!("{} {} already exists", E::COLLECTION, entity.id()))
        }
        e => e.into(),
    })?;
    Ok(())
}

pub fn save<E: Entity>(conn: &Connection, entity: &E) -> Result<()> {
    put_raw(conn, E::COLLECTION, entity.id(), &serde_json::to_value(entity)?)
}

pub fn load<E: Entity>(conn: &Connection, id: &str) -> Result<Option<E>> {
    get(conn, E::COLLECTION, id)?
        .map(|doc| doc.decode().map_err(DbError::from))
        .transpose()
}

pub fn require<E: Entity>(conn: &Connection, id: &str) -> Result<E> {
    load(conn, id)?.ok_or_else(|| DbError::not_found(E::COLLECTION, id))
}

pub fn find<E: Entity>(conn: &Connection, query: &Query) -> Result<Vec<E>> {
    debug_assert_eq!(query.collection, E::COLLECTION);
    run_query(conn, query)?
        .iter()
        .map(|doc| doc.decode().map_err(DbError::from))
        .collect()
}

pub fn find_page<E: Entity>(conn: &Connection, query: &Query) -> Result<Page<E>> {
    debug_assert_eq!(query.collection, E::COLLECTION);
    query_page(conn, query)?.try_map(|doc| doc.decode().map_err(DbError::from))
}

// -- Compilation --

enum Select {
    Rows,
    Count,
}

struct Compiled {
    sql: String,
    params: Vec<SqlValue>,
}

struct Params(Vec<SqlValue>);

impl Params {
    /// Bind a value and return its placeholder.
    fn bind(&mut self, value: SqlValue) -> String {
        self.0.push(value);
        format!("?{}", self.0.len())
    }
}

fn field_expr(field: &str) -> String {
    if field == "id" {
        "id".to_string()
    } else {
        format!("json_extract(data, '$.{}')", field)
    }
}

fn sql_value(field: &str, value: &Value) -> std::result::Result<SqlValue, QueryError> {
    let unsupported = |reason| QueryError::UnsupportedValue {
        field: field.to_string(),
        reason,
    };
    match value {
        Value::Null => Ok(SqlValue::Null),
        // json_extract yields 1/0 for true/false
        Value::Bool(b) => Ok(SqlValue::Integer(i64::from(*b))),
        Value::Number(n) => n
            .as_i64()
            .map(SqlValue::Integer)
            .or_else(|| n.as_f64().map(SqlValue::Real))
            .ok_or_else(|| unsupported("number out of range")),
        Value::String(s) => Ok(SqlValue::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => Err(unsupported("only scalar values can be compared")),
    }
}

fn predicate(filter: &Filter, params: &mut Params) -> std::result::Result<String, QueryError> {
    let expr = field_expr(&filter.field);
    let value = sql_value(&filter.field, &filter.value)?;

    let sql = match filter.op {
        FilterOp::Eq if filter.value.is_null() => format!("{} IS NULL", expr),
        FilterOp::Eq => format!("{} = {}", expr, params.bind(value)),
        FilterOp::Lt => format!("{} < {}", expr, params.bind(value)),
        FilterOp::Le => format!("{} <= {}", expr, params.bind(value)),
        FilterOp::Gt => format!("{} > {}", expr, params.bind(value)),
        FilterOp::Ge => format!("{} >= {}", expr, params.bind(value)),
        FilterOp::ArrayContains => format!(
            "EXISTS (SELECT 1 FROM json_each(documents.data, '$.{}') WHERE json_each.value = {})",
            filter.field,
            params.bind(value)
        ),
        FilterOp::StartsWith => {
            let prefix = filter.value.as_str().unwrap_or_default();
            // U+10FFFF sorts after every other character in SQLite's binary collation
            let upper = format!("{}\u{10FFFF}", prefix);
            let lo = params.bind(SqlValue::Text(prefix.to_string()));
            let hi = params.bind(SqlValue::Text(upper));
            format!("({e} >= {lo} AND {e} <= {hi})", e = expr)
        }
    };
    Ok(sql)
}

/// Everything strictly after `cursor` in the (field, id) ordering. SQLite
/// sorts NULL lowest, so missing fields come first ascending and last
/// descending.
fn after_cursor(
    expr: &str,
    direction: Direction,
    cursor: &Cursor,
    field: &str,
    params: &mut Params,
) -> std::result::Result<String, QueryError> {
    let id = params.bind(SqlValue::Text(cursor.id.clone()));
    if cursor.value.is_null() {
        return Ok(match direction {
            Direction::Asc => format!("({e} IS NOT NULL OR id > {id})", e = expr),
            Direction::Desc => format!("({e} IS NULL AND id < {id})", e = expr),
        });
    }

    let v = params.bind(sql_value(field, &cursor.value)?);
    Ok(match direction {
        Direction::Asc => format!("({e} > {v} OR ({e} = {v} AND id > {id}))", e = expr),
        Direction::Desc => {
            format!("({e} < {v} OR ({e} = {v} AND id < {id}) OR {e} IS NULL)", e = expr)
        }
    })
}

fn compile(query: &Query, select: Select) -> std::result::Result<Compiled, QueryError> {
    query.validate()?;

    let mut params = Params(Vec::new());
    let mut sql = match select {
        Select::Rows => String::from("SELECT id, data FROM documents"),
        Select::Count => String::from("SELECT COUNT(*) FROM documents"),
    };
    let collection = params.bind(SqlValue::Text(query.collection.as_str().to_string()));
    sql.push_str(&format!(" WHERE collection = {}", collection));

    for filter in &query.filters {
        sql.push_str(" AND ");
        sql.push_str(&predicate(filter, &mut params)?);
    }

    if !query.any_of.is_empty() {
        let alternatives = query
            .any_of
            .iter()
            .map(|f| predicate(f, &mut params))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        sql.push_str(&format!(" AND ({})", alternatives.join(" OR ")));
    }

    if let (Some(order), Some(cursor)) = (&query.order_by, &query.start_after) {
        let expr = field_expr(&order.field);
        sql.push_str(" AND ");
        sql.push_str(&after_cursor(&expr, order.direction, cursor, &order.field, &mut params)?);
    }

    if let Select::Rows = select {
        match &query.order_by {
            Some(order) => {
                let dir = match order.direction {
                    Direction::Asc => "ASC",
                    Direction::Desc => "DESC",
                };
                sql.push_str(&format!(
                    " ORDER BY {} {dir}, id {dir}",
                    field_expr(&order.field),
                    dir = dir
                ));
            }
            None => sql.push_str(" ORDER BY id ASC"),
        }
        if let Some(limit) = query.limit {
            let limit = params.bind(SqlValue::Integer(i64::from(limit)));
            sql.push_str(&format!(" LIMIT {}", limit));
        }
    }

    Ok(Compiled {
        sql,
        params: params.0,
    })
}
