use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD as B64;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::models::{Collection, Document};

/// Upper bound on any single page or live result set.
pub const MAX_LIMIT: u32 = 500;

const MAX_FIELD_LEN: usize = 128;

#[derive(Debug, Error, PartialEq)]
pub enum QueryError {
    #[error("invalid field path '{0}'")]
    InvalidField(String),

    #[error("limit must be between 1 and 500, got {0}")]
    InvalidLimit(u32),

    #[error("a cursor requires an ordering")]
    CursorWithoutOrder,

    #[error("malformed cursor")]
    MalformedCursor,

    #[error("unsupported value for '{field}': {reason}")]
    UnsupportedValue { field: String, reason: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterOp {
    #[serde(rename = "==")]
    Eq,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "array-contains")]
    ArrayContains,
    #[serde(rename = "starts-with")]
    StartsWith,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn new(field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    fn validate(&self) -> Result<(), QueryError> {
        validate_field(&self.field)?;
        match (&self.op, &self.value) {
            (_, Value::Array(_) | Value::Object(_)) => Err(QueryError::UnsupportedValue {
                field: self.field.clone(),
                reason: "only scalar values can be compared",
            }),
            (FilterOp::StartsWith, v) if !v.is_string() => Err(QueryError::UnsupportedValue {
                field: self.field.clone(),
                reason: "starts-with needs a string",
            }),
            (FilterOp::Lt | FilterOp::Le | FilterOp::Gt | FilterOp::Ge, Value::Null) => {
                Err(QueryError::UnsupportedValue {
                    field: self.field.clone(),
                    reason: "range comparison against null",
                })
            }
            _ => Ok(()),
        }
    }

    /// Returns the value when this is an equality constraint on `field`.
    pub fn eq_value(&self, field: &str) -> Option<&Value> {
        (self.field == field && self.op == FilterOp::Eq).then_some(&self.value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    /// The document's position in this ordering. A missing field is null;
    /// arrays and objects have no position, so a cursor could never resume
    /// after them.
    pub fn value_of(&self, doc: &Document) -> Result<Value, QueryError> {
        let value = if self.field == "id" {
            Value::String(doc.id.clone())
        } else {
            field_value(&doc.data, &self.field)
                .cloned()
                .unwrap_or(Value::Null)
        };
        match value {
            Value::Array(_) | Value::Object(_) => Err(QueryError::UnsupportedValue {
                field: self.field.clone(),
                reason: "ordering needs scalar values",
            }),
            value => Ok(value),
        }
    }
}

/// Position just past the last document of a page: its ordering value and id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cursor {
    pub value: Value,
    pub id: String,
}

impl Cursor {
    pub fn after(doc: &Document, order_by: &OrderBy) -> Result<Self, QueryError> {
        Ok(Self {
            value: order_by.value_of(doc)?,
            id: doc.id.clone(),
        })
    }

    /// Opaque form handed to clients.
    pub fn encode(&self) -> String {
        // Serializing a Value-and-String struct cannot fail.
        let json = serde_json::to_vec(self).unwrap_or_default();
        B64.encode(json)
    }

    pub fn decode(raw: &str) -> Result<Self, QueryError> {
        let bytes = B64.decode(raw).map_err(|_| QueryError::MalformedCursor)?;
        serde_json::from_slice(&bytes).map_err(|_| QueryError::MalformedCursor)
    }
}

/// A filter + order descriptor against one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: Collection,
    /// All of these must hold.
    #[serde(default)]
    pub filters: Vec<Filter>,
    /// When non-empty, at least one of these must hold.
    #[serde(default)]
    pub any_of: Vec<Filter>,
    #[serde(default)]
    pub order_by: Option<OrderBy>,
    #[serde(default)]
    pub limit: Option<u32>,
    /// Sent and received in the encoded form `Page::next_cursor` hands out.
    #[serde(default, with = "cursor_token")]
    pub start_after: Option<Cursor>,
}

mod cursor_token {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::Cursor;

    pub fn serialize<S: Serializer>(cursor: &Option<Cursor>, s: S) -> Result<S::Ok, S::Error> {
        match cursor {
            Some(cursor) => s.serialize_some(&cursor.encode()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Cursor>, D::Error> {
        Option::<String>::deserialize(d)?
            .map(|raw| Cursor::decode(&raw).map_err(D::Error::custom))
            .transpose()
    }
}

impl Query {
    pub fn new(collection: Collection) -> Self {
        Self {
            collection,
            filters: vec![],
            any_of: vec![],
            order_by: None,
            limit: None,
            start_after: None,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::new(field, op, value));
        self
    }

    pub fn where_eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter(field, FilterOp::Eq, value)
    }

    pub fn any(mut self, filter: Filter) -> Self {
        self.any_of.push(filter);
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn start_after(mut self, cursor: Option<Cursor>) -> Self {
        self.start_after = cursor;
        self
    }

    pub fn validate(&self) -> Result<(), QueryError> {
        for f in self.filters.iter().chain(self.any_of.iter()) {
            f.validate()?;
        }
        if let Some(order) = &self.order_by {
            validate_field(&order.field)?;
        }
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_LIMIT {
                return Err(QueryError::InvalidLimit(limit));
            }
        }
        if self.start_after.is_some() && self.order_by.is_none() {
            return Err(QueryError::CursorWithoutOrder);
        }
        Ok(())
    }

    /// First equality constraint on `field`, if any.
    pub fn eq_constraint(&self, field: &str) -> Option<&Value> {
        self.filters.iter().find_map(|f| f.eq_value(field))
    }

    /// First array-contains constraint on `field`, if any.
    pub fn contains_constraint(&self, field: &str) -> Option<&Value> {
        self.filters
            .iter()
            .find(|f| f.field == field && f.op == FilterOp::ArrayContains)
            .map(|f| &f.value)
    }
}

/// One page of a one-shot ordered query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Self {
            items: vec![],
            next_cursor: None,
            has_more: false,
        }
    }

    pub fn try_map<U, E>(self, f: impl FnMut(T) -> Result<U, E>) -> Result<Page<U>, E> {
        Ok(Page {
            items: self.items.into_iter().map(f).collect::<Result<_, _>>()?,
            next_cursor: self.next_cursor,
            has_more: self.has_more,
        })
    }
}

/// Field paths are dot-separated identifiers, e.g. `author.id`.
pub fn validate_field(path: &str) -> Result<(), QueryError> {
    let valid = !path.is_empty()
        && path.len() <= MAX_FIELD_LEN
        && path.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(QueryError::InvalidField(path.to_string()))
    }
}

/// Resolve a dotted path inside a JSON document.
pub fn field_value<'a>(data: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(data, |v, seg| v.get(seg))
}
