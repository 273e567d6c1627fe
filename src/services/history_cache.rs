use anyhow::{anyhow, Result};
use log::debug;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::models::conversation::{ConversationThread, NewTurn, Turn, TurnRole};
use crate::services::ChatStoreTrait;

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<Uuid, (Vec<Turn>, Instant)>,
    /// Bumped on every write to a thread; a read only fills the cache when it is unchanged
    generations: HashMap<Uuid, u64>,
}

impl CacheState {
    fn generation(&self, thread_id: Uuid) -> u64 {
        self.generations.get(&thread_id).copied().unwrap_or(0)
    }
}

/// Per-thread read-through cache of turn lists over any chat store.
/// Every write to a thread drops its entry.
#[derive(Clone, Debug)]
pub struct CachedChatStore<S: ChatStoreTrait> {
    inner: S,
    state: Arc<Mutex<CacheState>>,
    ttl: Duration,
}

impl<S: ChatStoreTrait> CachedChatStore<S> {
    pub fn new(inner: S, ttl: Duration) -> Self {
        Self {
            inner,
            state: Arc::new(Mutex::new(CacheState::default())),
            ttl,
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(|_| anyhow!("Failed to lock history cache"))
    }

    /// Fresh cached turns, or the generation a read-through must observe to fill the entry
    fn cached(&self, thread_id: Uuid) -> Result<std::result::Result<Vec<Turn>, u64>> {
        let mut state = self.lock()?;
        if let Some((turns, stored_at)) = state.entries.get(&thread_id) {
            if stored_at.elapsed() < self.ttl {
                return Ok(Ok(turns.clone()));
            }
            state.entries.remove(&thread_id);
        }
        Ok(Err(state.generation(thread_id)))
    }

    fn store(&self, thread_id: Uuid, turns: &[Turn], generation: u64) -> Result<()> {
        let mut state = self.lock()?;
        let ttl = self.ttl;
        state.entries.retain(|_, (_, stored_at)| stored_at.elapsed() < ttl);
        if state.generation(thread_id) != generation {
            debug!("Not caching history for thread {}: written during the read", thread_id);
            return Ok(());
        }
        state.entries.insert(thread_id, (turns.to_vec(), Instant::now()));
        Ok(())
    }

    fn invalidate(&self, thread_id: Uuid) -> Result<()> {
        let mut state = self.lock()?;
        state.entries.remove(&thread_id);
        *state.generations.entry(thread_id).or_insert(0) += 1;
        Ok(())
    }
}

#[async_trait::async_trait]
impl<S: ChatStoreTrait> ChatStoreTrait for CachedChatStore<S> {
    async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
        self.inner.create_thread(user_id, title).await
    }

    async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
        self.inner.get_thread(thread_id).await
    }

    async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
        self.invalidate(thread_id)?;
        self.inner.delete_thread(thread_id).await
    }

    async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
        self.invalidate(thread_id)?;
        self.inner.clear_turns(thread_id).await
    }

    async fn append_turn(&self, thread_id: Uuid, turn: NewTurn) -> Result<Turn> {
        let result = self.inner.append_turn(thread_id, turn).await;
        self.invalidate(thread_id)?;
        result
    }

    async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
        let generation = match self.cached(thread_id)? {
            Ok(turns) => {
                debug!("History cache hit for thread {}", thread_id);
                return Ok(turns);
            }
            Err(generation) => generation,
        };
        let turns = self.inner.list_turns(thread_id).await?;
        self.store(thread_id, &turns, generation)?;
        Ok(turns)
    }

    async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
        if let Ok(turns) = self.cached(thread_id)? {
            return Ok(turns
                .into_iter()
                .rev()
                .find(|t| role.map_or(true, |r| t.role == r)));
        }
        self.inner.last_turn(thread_id, role).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory_db::MemoryChatStore;

    #[tokio::test]
    async fn reads_are_cached_until_a_write() {
        let inner = MemoryChatStore::new();
        let cache = CachedChatStore::new(inner.clone(), Duration::from_secs(60));
        let thread = cache.create_thread("user-1", None).await.unwrap();
        cache.append_turn(thread.id, NewTurn::user("first")).await.unwrap();
        assert_eq!(cache.list_turns(thread.id).await.unwrap().len(), 1);

        // a write behind the cache's back stays invisible until the entry is dropped
        inner.append_turn(thread.id, NewTurn::user("hidden")).await.unwrap();
        assert_eq!(cache.list_turns(thread.id).await.unwrap().len(), 1);

        cache.append_turn(thread.id, NewTurn::user("third")).await.unwrap();
        let turns = cache.list_turns(thread.id).await.unwrap();
        assert_eq!(turns.len(), 3);
        assert_eq!(
            cache.last_turn(thread.id, Some(TurnRole::User)).await.unwrap().unwrap().content,
            "third"
        );
    }

    #[tokio::test]
    async fn entries_expire() {
        let inner = MemoryChatStore::new();
        let cache = CachedChatStore::new(inner.clone(), Duration::from_millis(0));
        let thread = cache.create_thread("user-1", None).await.unwrap();
        cache.list_turns(thread.id).await.unwrap();

        inner.append_turn(thread.id, NewTurn::user("fresh")).await.unwrap();
        assert_eq!(cache.list_turns(thread.id).await.unwrap().len(), 1);
    }

    /// Store whose reads return a snapshot only after a delay
    #[derive(Clone)]
    struct SlowReads {
        inner: MemoryChatStore,
        delay: Duration,
    }

    #[async_trait::async_trait]
    impl ChatStoreTrait for SlowReads {
        async fn create_thread(&self, user_id: &str, title: Option<String>) -> Result<ConversationThread> {
            self.inner.create_thread(user_id, title).await
        }

        async fn get_thread(&self, thread_id: Uuid) -> Result<Option<ConversationThread>> {
            self.inner.get_thread(thread_id).await
        }

        async fn delete_thread(&self, thread_id: Uuid) -> Result<bool> {
            self.inner.delete_thread(thread_id).await
        }

        async fn clear_turns(&self, thread_id: Uuid) -> Result<()> {
            self.inner.clear_turns(thread_id).await
        }

        async fn append_turn(&self, thread_id: Uuid, turn: NewTurn) -> Result<Turn> {
            self.inner.append_turn(thread_id, turn).await
        }

        async fn list_turns(&self, thread_id: Uuid) -> Result<Vec<Turn>> {
            let turns = self.inner.list_turns(thread_id).await?;
            tokio::time::sleep(self.delay).await;
            Ok(turns)
        }

        async fn last_turn(&self, thread_id: Uuid, role: Option<TurnRole>) -> Result<Option<Turn>> {
            self.inner.last_turn(thread_id, role).await
        }
    }

    #[tokio::test]
    async fn append_during_a_read_is_not_hidden() {
        let slow = SlowReads { inner: MemoryChatStore::new(), delay: Duration::from_millis(100) };
        let cache = CachedChatStore::new(slow, Duration::from_secs(300));
        let thread = cache.create_thread("user-1", None).await.unwrap();

        let (stale, appended) = tokio::join!(cache.list_turns(thread.id), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cache.append_turn(thread.id, NewTurn::user("during")).await
        });
        assert!(stale.unwrap().is_empty());
        appended.unwrap();

        assert_eq!(cache.list_turns(thread.id).await.unwrap().len(), 1);
        assert_eq!(
            cache.last_turn(thread.id, None).await.unwrap().unwrap().content,
            "during"
        );
    }

    #[tokio::test]
    async fn expired_entries_are_pruned_on_fill() {
        let cache = CachedChatStore::new(MemoryChatStore::new(), Duration::from_millis(30));
        let first = cache.create_thread("user-1", None).await.unwrap();
        let second = cache.create_thread("user-1", None).await.unwrap();
        cache.list_turns(first.id).await.unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        cache.list_turns(second.id).await.unwrap();

        let state = cache.state.lock().unwrap();
        assert!(!state.entries.contains_key(&first.id));
        assert!(state.entries.contains_key(&second.id));
    }

    #[tokio::test]
    async fn clear_invalidates() {
        let cache = CachedChatStore::new(MemoryChatStore::new(), Duration::from_secs(60));
        let thread = cache.create_thread("user-1", None).await.unwrap();
        cache.append_turn(thread.id, NewTurn::user("q")).await.unwrap();
        assert_eq!(cache.list_turns(thread.id).await.unwrap().len(), 1);

        cache.clear_turns(thread.id).await.unwrap();
        assert!(cache.list_turns(thread.id).await.unwrap().is_empty());
    }
}
