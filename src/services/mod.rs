pub mod composer;
pub mod database;
pub mod error;
pub mod gateway;
pub mod history_cache;
pub mod llm;
pub mod memory_db;
pub mod query_executor;
pub mod query_guard;
pub mod settings;
pub mod sql_extractor;
pub mod transcript;

use anyhow::Result;
use uuid::Uuid;

use crate::models::conversation::{ConversationThread, NewTurn, Turn, TurnRole};
use crate::models::settings::ProviderConfiguration;

// Define traits for service functionality
#[async_trait::async_trait]
pub trait ChatStoreTrait: Send + Sync + 'static {
    async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread>;
    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>>;
    async fn delete_thread(&self, thread_id: Uuid) -> Result<bool>;
    async fn clear_turns(&self, thread_id: Uuid) -> Result<()>;
    /// Fails for an unknown thread or a turn that does not validate
    async fn append_turn(&self, thread_id: Uuid, turn: NewTurn) -> Result<Turn>;
    /// Oldest first
    async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>>;
    async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>>;
}

pub trait SettingsProviderTrait: Send + Sync + 'static {
    fn provider_configuration(&self) -> Result<ProviderConfiguration>;
}

// Implement the traits for both SQLite and memory services
#[async_trait::async_trait]
impl ChatStoreTrait for database::SqliteChatStore {
    async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
        self.create_thread(user_id, title).await
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
        self.get_thread(thread_id).await
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
        self.delete_thread(thread_id).await
    }

    async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
        self.clear_turns(thread_id).await
    }

    async fn append_turn(&self, thread_id: Uuid, turn: NewTurn) -> Result<Turn> {
        self.append_turn(thread_id, turn).await
    }

    async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
        self.list_turns(thread_id).await
    }

    async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
        self.last_turn(thread_id, role).await
    }
}

#[async_trait::async_trait]
impl ChatStoreTrait for memory_db::MemoryChatStore {
    async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
        self.create_thread(user_id, title).await
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
        self.get_thread(thread_id).await
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
        self.delete_thread(thread_id).await
    }

    async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
        self.clear_turns(thread_id).await
    }

    async fn append_turn(&self, thread_id: Uuid, turn: NewTurn) -> Result<Turn> {
        self.append_turn(thread_id, turn).await
    }

    async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
        self.list_turns(thread_id).await
    }

    async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
        self.last_turn(thread_id, role).await
    }
}

impl SettingsProviderTrait for settings::MemorySettingsService {
    fn provider_configuration(&self) -> Result<ProviderConfiguration> {
        self.get()
    }
}

// Re-export the services
pub use database::SqliteChatStore;
pub use gateway::ChatGateway;
pub use history_cache::CachedChatStore;
pub use memory_db::MemoryChatStore;
pub use settings::MemorySettingsService;
