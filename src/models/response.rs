use serde::{Deserialize, Serialize};

use crate::models::conversation::{ConversationThread, Turn};

/// Error response for API
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub status_code: u16,
}

/// A thread together with its turns
#[derive(Debug, Serialize, Deserialize)]
pub struct ThreadTurnsResponse {
    pub thread: ConversationThread,
    pub turns: Vec<Turn>,
}
