use once_cell::sync::Lazy;
use regex::Regex;

use crate::services::error::GatewayError;

static THINK_BLOCK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<(think|thinking|reasoning)>.*?</(think|thinking|reasoning)>").expect("valid regex")
});

static FENCED_BLOCK: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```[ \t]*(?:sql)?[ \t]*\r?\n?(.*?)```").expect("valid regex"));

static FENCE_OPENING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)```[ \t]*sql\b").expect("valid regex"));

/// Isolate the candidate SQL from a raw model completion.
///
/// Reasoning blocks are dropped, a fenced block is unwrapped (stray fences are removed) and
/// the result is trimmed. Cleaning repeats until the text stops changing, so the function is
/// idempotent.
pub fn extract(raw_completion: &str) -> Result<String, GatewayError> {
    let mut current = raw_completion.to_string();
    loop {
        let next = clean_once(&current);
        if next == current {
            break;
        }
        current = next;
    }

    if current.is_empty() {
        return Err(GatewayError::EmptyGeneration);
    }
    Ok(current)
}

fn clean_once(text: &str) -> String {
    let mut cleaned = THINK_BLOCK.replace_all(text, "").into_owned();

    // Some models only emit the closing tag of their reasoning
    if let Some(idx) = cleaned.rfind("</think>") {
        cleaned = cleaned[idx + "</think>".len()..].to_string();
    }

    if let Some(inner) = FENCED_BLOCK.captures(&cleaned).and_then(|c| c.get(1)) {
        cleaned = inner.as_str().to_string();
    }

    let cleaned = FENCE_OPENING.replace_all(&cleaned, "");
    cleaned.replace("```", "").trim().to_string()
}
