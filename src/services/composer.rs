use log::{info, warn};
use serde_json::Value;

use crate::models::query::{QueryResultSet, RejectionKind};
use crate::services::error::GatewayError;
use crate::services::llm::{CompletionRequest, LlmProvider, TextStream};
use crate::services::transcript::{LlmTranscriptBuilder, PREVIEW_ROWS};

pub const COMPOSITION_MAX_TOKENS: u32 = 2000;
pub const COMPOSITION_TEMPERATURE: f32 = 0.7;

pub const OPERATION_NOT_ALLOWED: &str = "**Operation not allowed.**\n\n\
I can only read workflow data. Requests that would create, change or delete data are not supported.";

pub const TABLE_NOT_ACCESSIBLE: &str = "**Table not accessible.**\n\n\
That data isn't available to me. I can only read the tables I've been given access to.";

pub const GENERIC_QUERY_ERROR: &str = "**Something went wrong.**\n\n\
I couldn't run a query for that question. Try rephrasing it or asking something more specific.";

pub const QUERY_NOT_GENERABLE: &str = "**I couldn't build a query for that.**\n\n\
The question doesn't seem to relate to the workflow data I can access. Try rephrasing it in terms of that data.";

/// Fixed reply for a guard rejection
pub fn canned_rejection(kind: RejectionKind) -> &'static str {
    match kind {
        RejectionKind::ForbiddenKeyword | RejectionKind::NotSelect => OPERATION_NOT_ALLOWED,
        RejectionKind::TableNotAllowed => TABLE_NOT_ACCESSIBLE,
    }
}

/// Turns a question, the executed query and its rows into a Markdown answer
#[derive(Debug, Clone)]
pub struct ResponseComposer {
    transcript: LlmTranscriptBuilder,
}

impl ResponseComposer {
    pub fn new(transcript: LlmTranscriptBuilder) -> Self {
        Self { transcript }
    }

    fn request(&self, question: &str, sql: &str, results: &QueryResultSet) -> CompletionRequest {
        CompletionRequest::new(
            self.transcript.build_answer_composition_prompt(question, sql, &results.rows),
            COMPOSITION_MAX_TOKENS,
            COMPOSITION_TEMPERATURE,
        )
    }

    pub async fn compose(
        &self,
        provider: &dyn LlmProvider,
        question: &str,
        sql: &str,
        results: &QueryResultSet,
    ) -> Result<String, GatewayError> {
        let answer = provider.complete(&self.request(question, sql, results)).await?;
        if answer.trim().is_empty() {
            warn!("{} returned an empty answer, using result summary", provider.display_name());
            return Ok(fallback_summary(results));
        }
        info!("Composed answer of {} chars", answer.len());
        Ok(answer.trim().to_string())
    }

    pub async fn compose_stream(
        &self,
        provider: &dyn LlmProvider,
        question: &str,
        sql: &str,
        results: &QueryResultSet,
    ) -> Result<TextStream, GatewayError> {
        provider.complete_stream(&self.request(question, sql, results)).await
    }
}

fn cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.replace('|', "\\|").replace('\n', " "),
        other => other.to_string(),
    }
}

/// Plain Markdown rendering of the results when the model gives nothing back
pub fn fallback_summary(results: &QueryResultSet) -> String {
    let first = match results.rows.first() {
        Some(row) => row,
        None => return "The query returned no rows.".to_string(),
    };

    if results.count == 1 && first.len() == 1 {
        if let Some((column, value)) = first.iter().next() {
            return format!("**{}**: {}", column, cell(value));
        }
    }

    let columns: Vec<&String> = first.keys().collect();
    let mut out = format!(
        "| {} |\n|{}\n",
        columns.iter().map(|c| c.as_str()).collect::<Vec<_>>().join(" | "),
        " --- |".repeat(columns.len())
    );
    for row in results.rows.iter().take(PREVIEW_ROWS) {
        let cells: Vec<String> = columns
            .iter()
            .map(|c| row.get(c.as_str()).map(cell).unwrap_or_default())
            .collect();
        out.push_str(&format!("| {} |\n", cells.join(" | ")));
    }

    if results.count > PREVIEW_ROWS {
        out.push_str(&format!("\nShowing {} of {} rows.", PREVIEW_ROWS, results.count));
    }
    out.trim_end().to_string()
}
