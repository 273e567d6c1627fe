use anyhow::{anyhow, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::models::conversation::{derive_title, ConversationThread, NewTurn, Turn, TurnRole};

#[derive(Debug, Default)]
struct State {
    threads: HashMap<Uuid, ConversationThread>,
    turns: HashMap<Uuid, Vec<Turn>>,
}

/// Chat transcripts kept in process memory
#[derive(Clone, Debug, Default)]
pub struct MemoryChatStore {
    state: Arc<Mutex<State>>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
        let thread = ConversationThread::new(user_id.to_string(), title);
        let mut state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        state.threads.insert(thread.id, thread.clone());
        state.turns.insert(thread.id, Vec::new());
        Ok(thread)
    }

    pub async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
        let state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        Ok(state.threads.get(&thread_id).cloned())
    }

    /// Delete a thread and its turns; false when it did not exist
    pub async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
        let mut state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        state.turns.remove(&thread_id);
        Ok(state.threads.remove(&thread_id).is_some())
    }

    pub async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        if !state.threads.contains_key(&thread_id) {
            return Err(anyhow!("Thread {} not found", thread_id));
        }
        state.turns.insert(thread_id, Vec::new());
        Ok(())
    }

    pub async fn append_turn(&self, thread_id: Uuid, new_turn: NewTurn) -> Result<Turn> {
        new_turn.validate().map_err(|e| anyhow!(e))?;
        let mut state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;

        let thread = state
            .threads
            .get_mut(&thread_id)
            .ok_or_else(|| anyhow!("Thread {} not found", thread_id))?;
        if thread.title.is_none() && new_turn.role == TurnRole::User {
            thread.title = derive_title(&new_turn.content);
        }
        thread.updated_at = Utc::now();

        let turn = new_turn.into_turn(thread_id);
        state.turns.entry(thread_id).or_default().push(turn.clone());
        Ok(turn)
    }

    pub async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
        let state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        Ok(state.turns.get(&thread_id).cloned().unwrap_or_default())
    }

    pub async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
        let state = self.state.lock().map_err(|_| anyhow!("Failed to lock chat store"))?;
        Ok(state.turns.get(&thread_id).and_then(|turns| {
            turns
                .iter()
                .rev()
                .find(|t| role.map_or(true, |r| t.role == r))
                .cloned()
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_in_order_and_titles_from_first_question() {
        let store = MemoryChatStore::new();
        let thread = store.create_thread("user-1", None).await.unwrap();

        store.append_turn(thread.id, NewTurn::user("  How many\nworkflows are there? ")).await.unwrap();
        store
            .append_turn(thread.id, NewTurn::assistant("Three.").with_query("SELECT 3", vec![]))
            .await
            .unwrap();
        store.append_turn(thread.id, NewTurn::user("And tasks?")).await.unwrap();

        let turns = store.list_turns(thread.id).await.unwrap();
        let roles: Vec<TurnRole> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec![TurnRole::User, TurnRole::Assistant, TurnRole::User]);

        let thread = store.get_thread(thread.id).await.unwrap().unwrap();
        assert_eq!(thread.title.as_deref(), Some("How many workflows are there?"));

        let last_assistant = store.last_turn(thread.id, Some(TurnRole::Assistant)).await.unwrap().unwrap();
        assert_eq!(last_assistant.content, "Three.");
        let last = store.last_turn(thread.id, None).await.unwrap().unwrap();
        assert_eq!(last.content, "And tasks?");
    }

    #[tokio::test]
    async fn rejects_unknown_thread_and_sql_on_user_turns() {
        let store = MemoryChatStore::new();
        assert!(store.append_turn(Uuid::new_v4(), NewTurn::user("hi")).await.is_err());

        let thread = store.create_thread("user-1", Some("Mine".into())).await.unwrap();
        let bad = NewTurn::user("hi").with_query("SELECT 1", vec![]);
        assert!(store.append_turn(thread.id, bad).await.is_err());
        assert!(store.list_turns(thread.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_and_delete_cascade() {
        let store = MemoryChatStore::new();
        let thread = store.create_thread("user-1", None).await.unwrap();
        store.append_turn(thread.id, NewTurn::user("q")).await.unwrap();

        store.clear_turns(thread.id).await.unwrap();
        assert!(store.list_turns(thread.id).await.unwrap().is_empty());
        assert!(store.get_thread(thread.id).await.unwrap().is_some());

        store.append_turn(thread.id, NewTurn::user("q")).await.unwrap();
        assert!(store.delete_thread(thread.id).await.unwrap());
        assert!(store.list_turns(thread.id).await.unwrap().is_empty());
        assert!(!store.delete_thread(thread.id).await.unwrap());
    }
}
