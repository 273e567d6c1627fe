use serde::{Deserialize, Serialize};
use std::fmt;

use crate::models::conversation::ResultRow;

/// Why the guard refused a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectionKind {
    ForbiddenKeyword,
    NotSelect,
    TableNotAllowed,
}

impl RejectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionKind::ForbiddenKeyword => "forbidden-keyword",
            RejectionKind::NotSelect => "not-select",
            RejectionKind::TableNotAllowed => "table-not-allowed",
        }
    }
}

impl fmt::Display for RejectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of validating one candidate query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryDecision {
    pub accepted: bool,
    /// Comment-free query text in its original casing
    pub normalized_sql: String,
    pub rejection_reason: Option<String>,
    pub rejection_kind: Option<RejectionKind>,
}

impl QueryDecision {
    pub fn accept(normalized_sql: String) -> Self {
        Self {
            accepted: true,
            normalized_sql,
            rejection_reason: None,
            rejection_kind: None,
        }
    }

    pub fn reject(normalized_sql: String, kind: RejectionKind, reason: String) -> Self {
        Self {
            accepted: false,
            normalized_sql,
            rejection_reason: Some(reason),
            rejection_kind: Some(kind),
        }
    }
}

/// Rows returned by an executed query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryResultSet {
    pub rows: Vec<ResultRow>,
    pub count: usize,
    /// True when the row cap stopped the read before the query was exhausted
    pub truncated: bool,
}

impl QueryResultSet {
    pub fn new(rows: Vec<ResultRow>, truncated: bool) -> Self {
        let count = rows.len();
        Self { rows, count, truncated }
    }
}
