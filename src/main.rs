mod config;
mod handlers;
mod models;
mod services;

use actix_cors::Cors;
use actix_web::{middleware::Logger, web, App, HttpServer};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use config::Config;
use services::llm::HttpProviderFactory;
use services::query_executor::{ReadOnlyDatabase, SqliteReadOnlyDatabase};
use services::query_guard::QueryGuard;
use services::{CachedChatStore, ChatGateway, ChatStoreTrait, MemoryChatStore, MemorySettingsService, SqliteChatStore};

fn startup_error(e: anyhow::Error) -> io::Error {
    log::error!("❌ Startup failed: {:#}", e);
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    log::info!("🚀 Starting workflow chat gateway");

    // Load configuration from environment variables
    let config = Config::from_env().map_err(startup_error)?;

    let analytics = SqliteReadOnlyDatabase::connect(&config.analytics_database_url, config.analytics_pool_size)
        .await
        .map_err(startup_error)?;
    let settings = MemorySettingsService::from_config(&config);
    let providers = Arc::new(
        HttpProviderFactory::new(Duration::from_secs(config.ai_request_timeout_secs)).map_err(startup_error)?,
    );

    let mut guard = QueryGuard::new(config.ai_allowed_tables.iter().cloned());
    if config.ai_permissive_statements {
        guard = guard.permissive();
    }
    log::info!("🛡️ Query guard allows tables: {}", guard.allowed_tables().join(", "));
    if !config.ai_chat_enabled {
        log::warn!("⚠️ AI chat is disabled; ask requests will be refused");
    }

    let ttl = Duration::from_secs(config.chat_history_cache_ttl_secs);
    match &config.chat_database_url {
        Some(url) => {
            log::info!("💾 Using SQLite chat store");
            let store = CachedChatStore::new(SqliteChatStore::connect(url).await.map_err(startup_error)?, ttl);
            serve(config.server_port, ChatGateway::new(store, settings, analytics, providers, guard)).await
        }
        None => {
            log::info!("💾 Using in-memory chat store for local development");
            let store = CachedChatStore::new(MemoryChatStore::new(), ttl);
            serve(config.server_port, ChatGateway::new(store, settings, analytics, providers, guard)).await
        }
    }
}

async fn serve<S, D>(port: u16, gateway: ChatGateway<S, MemorySettingsService, D>) -> io::Result<()>
where
    S: ChatStoreTrait + Clone,
    D: ReadOnlyDatabase,
{
    let gateway = web::Data::new(gateway);

    // Start HTTP server
    log::info!("🌐 Starting server at http://127.0.0.1:{}", port);
    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(Cors::permissive())
            .app_data(gateway.clone())
            .configure(handlers::routes::<S, MemorySettingsService, D>)
    })
    .bind(format!("127.0.0.1:{}", port))
    .map_err(|e| {
        log::error!("❌ Failed to bind to port {}: {}", port, e);
        e
    })?
    .run()
    .await
}
