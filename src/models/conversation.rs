use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use chrono::{DateTime, Utc};
use std::fmt;
use uuid::Uuid;

/// One row of a query result, column name to scalar value
pub type ResultRow = Map<String, Value>;

/// Longest auto-derived thread title, in characters
const TITLE_MAX_CHARS: usize = 60;

/// Role of a turn within a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            "system" => Some(TurnRole::System),
            _ => None,
        }
    }
}

impl fmt::Display for TurnRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Metadata attached to an assistant turn
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_count: Option<usize>,
    /// Set when the row cap cut the result set short
    #[serde(skip_serializing_if = "Option::is_none")]
    pub truncated: Option<bool>,
    /// Kind of guard rejection, for handled rejections
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TurnMetadata {
    pub fn for_provider(provider: &str, model: &str) -> Self {
        Self {
            provider: Some(provider.to_string()),
            model: Some(model.to_string()),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.unwrap_or(false)
    }
}

/// A durable conversation belonging to one user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationThread {
    pub id: Uuid,
    pub user_id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConversationThread {
    pub fn new(user_id: String, title: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            title: title.filter(|t| !t.trim().is_empty()),
            created_at: now,
            updated_at: now,
        }
    }
}

/// A persisted message within a thread. Turns are never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub thread_id: Uuid,
    pub role: TurnRole,
    pub content: String,
    pub query_generated: Option<String>,
    pub query_results: Option<Vec<ResultRow>>,
    pub metadata: Option<TurnMetadata>,
    pub created_at: DateTime<Utc>,
}

/// A turn waiting to be appended to a thread
#[derive(Debug, Clone, PartialEq)]
pub struct NewTurn {
    pub role: TurnRole,
    pub content: String,
    pub query_generated: Option<String>,
    pub query_results: Option<Vec<ResultRow>>,
    pub metadata: Option<TurnMetadata>,
}

impl NewTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role(TurnRole::System, content)
    }

    fn with_role(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            query_generated: None,
            query_results: None,
            metadata: None,
        }
    }

    pub fn with_query(mut self, sql: impl Into<String>, results: Vec<ResultRow>) -> Self {
        self.query_generated = Some(sql.into());
        self.query_results = Some(results);
        self
    }

    pub fn with_metadata(mut self, metadata: TurnMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Only assistant turns may carry generated SQL or results
    pub fn validate(&self) -> Result<(), String> {
        if self.role != TurnRole::Assistant
            && (self.query_generated.is_some() || self.query_results.is_some())
        {
            return Err(format!("a {} turn cannot carry generated SQL or results", self.role));
        }
        Ok(())
    }

    pub fn into_turn(self, thread_id: Uuid) -> Turn {
        Turn {
            id: Uuid::new_v4(),
            thread_id,
            role: self.role,
            content: self.content,
            query_generated: self.query_generated,
            query_results: self.query_results,
            metadata: self.metadata,
            created_at: Utc::now(),
        }
    }
}

/// Title derived from the first user question of a thread
pub fn derive_title(content: &str) -> Option<String> {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }
    let mut title: String = collapsed.chars().take(TITLE_MAX_CHARS).collect();
    if collapsed.chars().count() > TITLE_MAX_CHARS {
        title = title.trim_end().to_string();
        title.push('…');
    }
    Some(title)
}

/// Request to create a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateThreadRequest {
    pub user_id: String,
    pub title: Option<String>,
}

/// Request carrying a natural language question
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
}
