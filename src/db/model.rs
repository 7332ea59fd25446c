//! Row and query models used by repositories.
//!
//! Keep these structs focused on the data moved in and out of SQL. Business
//! logic lives in higher layers.

use chrono::{DateTime, Utc};
use serde_json::Value;

/// Outbox row handed to the queue consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxMessage {
    pub id: i64,
    pub message_id: String,
    pub candidate_id: String,
    /// base64(JSON) payload, same encoding as a push envelope's `data`.
    pub data: String,
    pub attempt: i32,
}

/// A JSON document stored under `(collection, id)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub collection: String,
    pub id: String,
    pub body: Value,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Equality filters on top-level fields, optional ordering, and a limit.
/// Without an explicit order, the most recently written documents come first.
#[derive(Debug, Clone, PartialEq)]
pub struct DocQuery {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: u32,
}

impl DocQuery {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            filters: Vec::new(),
            order_by: None,
            limit: 50,
        }
    }

    pub fn filter(mut self, field: impl Into<String>, value: Value) -> Self {
        self.filters.push((field.into(), value));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }
}
