use anyhow::{anyhow, Context, Result};
use dotenv::dotenv;
use std::env;
use std::str::FromStr;

use crate::services::query_guard::DEFAULT_ALLOWED_TABLES;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub analytics_database_url: String,
    pub analytics_pool_size: u32,
    pub chat_database_url: Option<String>,
    pub ai_chat_enabled: bool,
    pub ai_provider: String,
    pub ai_model: Option<String>,
    pub ai_api_key: String,
    pub ai_base_url: Option<String>,
    pub ai_request_timeout_secs: u64,
    pub ai_allowed_tables: Vec<String>,
    pub ai_permissive_statements: bool,
    pub chat_history_cache_ttl_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        Ok(Self {
            server_port: parsed("SERVER_PORT", 8080)?,
            analytics_database_url: env::var("ANALYTICS_DATABASE_URL")
                .context("ANALYTICS_DATABASE_URL must be set")?,
            analytics_pool_size: parsed("ANALYTICS_POOL_SIZE", 4)?,
            chat_database_url: optional("CHAT_DATABASE_URL"),
            ai_chat_enabled: flag("AI_CHAT_ENABLED", false)?,
            ai_provider: optional("AI_PROVIDER").unwrap_or_else(|| "openai".to_string()),
            ai_model: optional("AI_MODEL"),
            ai_api_key: env::var("AI_API_KEY").unwrap_or_default(),
            ai_base_url: optional("AI_BASE_URL"),
            ai_request_timeout_secs: parsed("AI_REQUEST_TIMEOUT_SECS", 120)?,
            ai_allowed_tables: optional("AI_ALLOWED_TABLES")
                .map(|v| table_list(&v))
                .unwrap_or_else(|| DEFAULT_ALLOWED_TABLES.iter().map(|t| t.to_string()).collect()),
            ai_permissive_statements: flag("AI_PERMISSIVE_STATEMENTS", false)?,
            chat_history_cache_ttl_secs: parsed("CHAT_HISTORY_CACHE_TTL_SECS", 300)?,
        })
    }
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn parsed<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match optional(name) {
        Some(value) => value
            .parse()
            .map_err(|e| anyhow!("{} must be a valid number, got '{}': {}", name, value, e)),
        None => Ok(default),
    }
}

fn flag(name: &str, default: bool) -> Result<bool> {
    match optional(name).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow!("{} must be a boolean, got '{}'", name, v)),
        },
    }
}

fn table_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}
