//! Conversation persistence: a durable backend plus an optional cache.
//!
//! | Tier | Trait | Implementations |
//! |------|-------|-----------------|
//! | Durable | [`ConversationBackend`] | [`SqliteConversations`], [`InMemoryConversations`] |
//! | Cache | [`ConversationCache`] | [`MemoryCache`] (TTL, bounded window per conversation) |
//!
//! Writes go to the durable backend first; the cache is then updated on a
//! best-effort basis (failures are logged and ignored). Reads are served
//! from the cache only when the cached window is known to cover the
//! requested number of messages; otherwise they fall through to the
//! durable backend and refill the cache. A refill is dropped if a write to
//! the same conversation landed while it was reading, so results are
//! identical with the cache disabled.
//!
//! Transcripts are append-only and ordered by `(created_at, insertion)`.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use uuid::Uuid;

use knowbridge_core::models::{ContextUsed, Conversation, Message, Role};

use crate::error::RagError;

#[async_trait]
pub trait ConversationBackend: Send + Sync {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()>;

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Append a message. Returns `false` if the conversation does not exist.
    async fn append_message(&self, message: &Message) -> Result<bool>;

    /// Up to `limit` most recent messages, most recent first.
    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>>;

    /// Delete a conversation and its messages. Returns `false` if unknown.
    async fn delete_conversation(&self, id: &str) -> Result<bool>;
}

// ============ SQLite ============

pub struct SqliteConversations {
    pool: SqlitePool,
}

impl SqliteConversations {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

/// Current time at the millisecond precision the durable store keeps, so
/// cached and persisted copies compare equal.
fn now_millis() -> DateTime<Utc> {
    from_millis(Utc::now().timestamp_millis())
}

#[async_trait]
impl ConversationBackend for SqliteConversations {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        sqlx::query(
            "INSERT INTO conversations (id, user_id, created_at, metadata_json) VALUES (?, ?, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(conversation.created_at.timestamp_millis())
        .bind(serde_json::to_string(&conversation.metadata)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let row = sqlx::query(
            "SELECT id, user_id, created_at, metadata_json FROM conversations WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            let metadata_json: String = r.get("metadata_json");
            Ok(Conversation {
                id: r.get("id"),
                user_id: r.get("user_id"),
                created_at: from_millis(r.get("created_at")),
                metadata: serde_json::from_str(&metadata_json)?,
            })
        })
        .transpose()
    }

    async fn append_message(&self, message: &Message) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, role, content, created_at, context_json)
            SELECT ?, ?, ?, ?, ?, ?
            WHERE EXISTS (SELECT 1 FROM conversations WHERE id = ?)
            "#,
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at.timestamp_millis())
        .bind(serde_json::to_string(&message.context_used)?)
        .bind(&message.conversation_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, role, content, created_at, context_json
            FROM messages
            WHERE conversation_id = ?
            ORDER BY created_at DESC, seq DESC
            LIMIT ?
            "#,
        )
        .bind(conversation_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|r| {
                let role: String = r.get("role");
                let context_json: String = r.get("context_json");
                Ok(Message {
                    id: r.get("id"),
                    conversation_id: r.get("conversation_id"),
                    role: role.parse()?,
                    content: r.get("content"),
                    created_at: from_millis(r.get("created_at")),
                    context_used: serde_json::from_str(&context_json)?,
                })
            })
            .collect()
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM messages WHERE conversation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let removed = sqlx::query("DELETE FROM conversations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(removed > 0)
    }
}

// ============ In-memory ============

#[derive(Default)]
pub struct InMemoryConversations {
    data: RwLock<HashMap<String, (Conversation, Vec<Message>)>>,
}

impl InMemoryConversations {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(_: T) -> anyhow::Error {
    anyhow!("conversation store lock poisoned")
}

#[async_trait]
impl ConversationBackend for InMemoryConversations {
    async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
        let mut data = self.data.write().map_err(poisoned)?;
        data.insert(conversation.id.clone(), (conversation.clone(), Vec::new()));
        Ok(())
    }

    async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data.get(id).map(|(c, _)| c.clone()))
    }

    async fn append_message(&self, message: &Message) -> Result<bool> {
        let mut data = self.data.write().map_err(poisoned)?;
        match data.get_mut(&message.conversation_id) {
            Some((_, messages)) => {
                // Stable insert keeps (created_at, insertion) order.
                let pos = messages.partition_point(|m| m.created_at <= message.created_at);
                messages.insert(pos, message.clone());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let data = self.data.read().map_err(poisoned)?;
        Ok(data
            .get(conversation_id)
            .map(|(_, messages)| messages.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn delete_conversation(&self, id: &str) -> Result<bool> {
        let mut data = self.data.write().map_err(poisoned)?;
        Ok(data.remove(id).is_some())
    }
}

// ============ Cache ============

/// The most recent messages of a conversation, oldest first.
#[derive(Debug, Clone, Default)]
pub struct CachedWindow {
    pub messages: Vec<Message>,
    /// The window holds the entire transcript.
    pub complete: bool,
}

impl CachedWindow {
    fn covers(&self, limit: usize) -> bool {
        self.complete || self.messages.len() >= limit
    }
}

/// Read-through cache in front of a [`ConversationBackend`].
///
/// Filling is two-phase so a slow reader cannot overwrite newer writes:
/// [`reserve`](ConversationCache::reserve) is taken *before* the durable
/// read, and [`fill`](ConversationCache::fill) only stores the window if no
/// [`append`](ConversationCache::append) or
/// [`invalidate`](ConversationCache::invalidate) for that conversation
/// happened in between.
#[async_trait]
pub trait ConversationCache: Send + Sync {
    async fn get(&self, conversation_id: &str) -> Result<Option<CachedWindow>>;
    /// Start a fill; returns the ticket to pass to `fill`.
    async fn reserve(&self, conversation_id: &str) -> Result<u64>;
    /// Store `window` if `ticket` is still current. Returns whether it was stored.
    async fn fill(&self, conversation_id: &str, ticket: u64, window: CachedWindow) -> Result<bool>;
    /// Append to a cached window; voids any fill in progress.
    async fn append(&self, message: &Message) -> Result<()>;
    async fn invalidate(&self, conversation_id: &str) -> Result<()>;
}

enum Slot {
    Filling { ticket: u64, since: Instant },
    Ready { stored_at: Instant, window: CachedWindow },
}

impl Slot {
    fn age(&self) -> Duration {
        match self {
            Slot::Filling { since, .. } => since.elapsed(),
            Slot::Ready { stored_at, .. } => stored_at.elapsed(),
        }
    }
}

struct CacheState {
    slots: HashMap<String, Slot>,
    next_ticket: u64,
}

/// In-process cache with a TTL and a per-conversation message cap.
///
/// The TTL runs from the fill; appends do not extend it. Expired slots are
/// swept whenever a fill is reserved, so conversations that are never read
/// again do not accumulate.
pub struct MemoryCache {
    state: Mutex<CacheState>,
    ttl: Duration,
    window: usize,
}

impl MemoryCache {
    pub fn new(ttl: Duration, window: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                slots: HashMap::new(),
                next_ticket: 0,
            }),
            ttl,
            window: window.max(1),
        }
    }

    fn trim(&self, window: &mut CachedWindow) {
        if window.messages.len() > self.window {
            let excess = window.messages.len() - self.window;
            window.messages.drain(..excess);
            window.complete = false;
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, CacheState>> {
        self.state.lock().map_err(poisoned)
    }
}

#[async_trait]
impl ConversationCache for MemoryCache {
    async fn get(&self, conversation_id: &str) -> Result<Option<CachedWindow>> {
        let mut state = self.lock()?;
        match state.slots.get(conversation_id) {
            Some(slot) if slot.age() > self.ttl => {
                state.slots.remove(conversation_id);
                Ok(None)
            }
            Some(Slot::Ready { window, .. }) => Ok(Some(window.clone())),
            _ => Ok(None),
        }
    }

    async fn reserve(&self, conversation_id: &str) -> Result<u64> {
        let mut state = self.lock()?;
        let ttl = self.ttl;
        state.slots.retain(|_, slot| slot.age() <= ttl);
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        state.slots.insert(
            conversation_id.to_string(),
            Slot::Filling {
                ticket,
                since: Instant::now(),
            },
        );
        Ok(ticket)
    }

    async fn fill(
        &self,
        conversation_id: &str,
        ticket: u64,
        mut window: CachedWindow,
    ) -> Result<bool> {
        self.trim(&mut window);
        let mut state = self.lock()?;
        match state.slots.get(conversation_id) {
            Some(Slot::Filling { ticket: current, .. }) if *current == ticket => {
                state.slots.insert(
                    conversation_id.to_string(),
                    Slot::Ready {
                        stored_at: Instant::now(),
                        window,
                    },
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append(&self, message: &Message) -> Result<()> {
        let mut state = self.lock()?;
        match state.slots.get_mut(&message.conversation_id) {
            Some(Slot::Ready { window, .. }) => {
                let pos = window
                    .messages
                    .partition_point(|m| m.created_at <= message.created_at);
                window.messages.insert(pos, message.clone());
                self.trim(window);
            }
            Some(Slot::Filling { .. }) => {
                state.slots.remove(&message.conversation_id);
            }
            None => {}
        }
        Ok(())
    }

    async fn invalidate(&self, conversation_id: &str) -> Result<()> {
        let mut state = self.lock()?;
        state.slots.remove(conversation_id);
        Ok(())
    }
}

// ============ Store ============

/// Two-tier conversation store used by the orchestrator and the API.
pub struct ConversationStore {
    backend: Arc<dyn ConversationBackend>,
    cache: Option<Arc<dyn ConversationCache>>,
    default_user_id: String,
}

impl ConversationStore {
    pub fn new(
        backend: Arc<dyn ConversationBackend>,
        cache: Option<Arc<dyn ConversationCache>>,
        default_user_id: impl Into<String>,
    ) -> Self {
        Self {
            backend,
            cache,
            default_user_id: default_user_id.into(),
        }
    }

    pub async fn create_conversation(
        &self,
        user_id: Option<&str>,
        metadata: BTreeMap<String, String>,
    ) -> Result<Conversation, RagError> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.unwrap_or(&self.default_user_id).to_string(),
            created_at: now_millis(),
            metadata,
        };
        let ticket = self.reserve(&conversation.id).await;
        self.backend.insert_conversation(&conversation).await?;
        let window = CachedWindow {
            messages: Vec::new(),
            complete: true,
        };
        self.fill(&conversation.id, ticket, window).await;
        Ok(conversation)
    }

    pub async fn get_conversation(&self, id: &str) -> Result<Conversation, RagError> {
        self.backend
            .get_conversation(id)
            .await?
            .ok_or_else(|| RagError::ConversationNotFound(id.to_string()))
    }

    pub async fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: &str,
        context_used: Vec<ContextUsed>,
    ) -> Result<Message, RagError> {
        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            role,
            content: content.to_string(),
            created_at: now_millis(),
            context_used,
        };
        if !self.backend.append_message(&message).await? {
            return Err(RagError::ConversationNotFound(conversation_id.to_string()));
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.append(&message).await {
                warn!(conversation_id, error = %e, "cache append failed");
            }
        }
        Ok(message)
    }

    /// Up to `limit` most recent messages, most recent first.
    pub async fn get_messages(
        &self,
        conversation_id: &str,
        limit: usize,
    ) -> Result<Vec<Message>, RagError> {
        if let Some(cache) = &self.cache {
            match cache.get(conversation_id).await {
                Ok(Some(window)) if window.covers(limit) => {
                    return Ok(window.messages.into_iter().rev().take(limit).collect());
                }
                Ok(_) => {}
                Err(e) => warn!(conversation_id, error = %e, "cache read failed"),
            }
        }

        let ticket = self.reserve(conversation_id).await;
        let messages = self.backend.recent_messages(conversation_id, limit).await?;
        if messages.is_empty() && self.backend.get_conversation(conversation_id).await?.is_none() {
            return Err(RagError::ConversationNotFound(conversation_id.to_string()));
        }

        let window = CachedWindow {
            complete: messages.len() < limit,
            messages: messages.iter().rev().cloned().collect(),
        };
        self.fill(conversation_id, ticket, window).await;
        Ok(messages)
    }

    /// Best-effort fill ticket; `None` without a cache or when it fails.
    async fn reserve(&self, conversation_id: &str) -> Option<u64> {
        let cache = self.cache.as_ref()?;
        match cache.reserve(conversation_id).await {
            Ok(ticket) => Some(ticket),
            Err(e) => {
                warn!(conversation_id, error = %e, "cache reserve failed");
                None
            }
        }
    }

    async fn fill(&self, conversation_id: &str, ticket: Option<u64>, window: CachedWindow) {
        let (Some(cache), Some(ticket)) = (&self.cache, ticket) else {
            return;
        };
        match cache.fill(conversation_id, ticket, window).await {
            Ok(true) => {}
            Ok(false) => debug!(conversation_id, "cache fill superseded by a write"),
            Err(e) => warn!(conversation_id, error = %e, "cache write failed"),
        }
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), RagError> {
        let existed = self.backend.delete_conversation(conversation_id).await?;
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.invalidate(conversation_id).await {
                warn!(conversation_id, error = %e, "cache invalidate failed");
            }
        }
        if existed {
            Ok(())
        } else {
            Err(RagError::ConversationNotFound(conversation_id.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Pauses the first armed `recent_messages` call after it has read,
    /// until `release` is notified.
    #[derive(Default)]
    struct GatedBackend {
        inner: InMemoryConversations,
        armed: std::sync::atomic::AtomicBool,
        read_done: tokio::sync::Notify,
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ConversationBackend for GatedBackend {
        async fn insert_conversation(&self, conversation: &Conversation) -> Result<()> {
            self.inner.insert_conversation(conversation).await
        }
        async fn get_conversation(&self, id: &str) -> Result<Option<Conversation>> {
            self.inner.get_conversation(id).await
        }
        async fn append_message(&self, message: &Message) -> Result<bool> {
            self.inner.append_message(message).await
        }
        async fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
            let messages = self.inner.recent_messages(conversation_id, limit).await?;
            if self.armed.swap(false, std::sync::atomic::Ordering::SeqCst) {
                self.read_done.notify_one();
                self.release.notified().await;
            }
            Ok(messages)
        }
        async fn delete_conversation(&self, id: &str) -> Result<bool> {
            self.inner.delete_conversation(id).await
        }
    }

    /// A cache whose every operation fails.
    struct BrokenCache;

    #[async_trait]
    impl ConversationCache for BrokenCache {
        async fn get(&self, _: &str) -> Result<Option<CachedWindow>> {
            Err(anyhow!("cache down"))
        }
        async fn reserve(&self, _: &str) -> Result<u64> {
            Err(anyhow!("cache down"))
        }
        async fn fill(&self, _: &str, _: u64, _: CachedWindow) -> Result<bool> {
            Err(anyhow!("cache down"))
        }
        async fn append(&self, _: &Message) -> Result<()> {
            Err(anyhow!("cache down"))
        }
        async fn invalidate(&self, _: &str) -> Result<()> {
            Err(anyhow!("cache down"))
        }
    }

    fn store(cache: Option<Arc<dyn ConversationCache>>) -> ConversationStore {
        ConversationStore::new(Arc::new(InMemoryConversations::new()), cache, "anonymous")
    }

    async fn transcript(store: &ConversationStore) -> Vec<String> {
        let conv = store.create_conversation(Some("u1"), BTreeMap::new()).await.unwrap();
        for i in 0..7 {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            store
                .add_message(&conv.id, role, &format!("m{}", i), Vec::new())
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        for limit in [1, 3, 7, 20] {
            let msgs = store.get_messages(&conv.id, limit).await.unwrap();
            seen.push(msgs.iter().map(|m| m.content.clone()).collect::<Vec<_>>().join(","));
        }
        seen
    }

    #[tokio::test]
    async fn test_cache_disabled_equivalence() {
        let plain = transcript(&store(None)).await;
        let cached = transcript(&store(Some(Arc::new(MemoryCache::new(
            Duration::from_secs(60),
            4,
        )))))
        .await;
        let broken = transcript(&store(Some(Arc::new(BrokenCache)))).await;
        assert_eq!(plain, cached);
        assert_eq!(plain, broken);
        assert_eq!(plain[1], "m6,m5,m4");
    }

    #[tokio::test]
    async fn test_unknown_conversation() {
        let s = store(Some(Arc::new(MemoryCache::new(Duration::from_secs(60), 10))));
        assert!(matches!(
            s.add_message("nope", Role::User, "hi", Vec::new()).await,
            Err(RagError::ConversationNotFound(_))
        ));
        assert!(matches!(
            s.get_messages("nope", 5).await,
            Err(RagError::ConversationNotFound(_))
        ));
        assert!(matches!(
            s.delete_conversation("nope").await,
            Err(RagError::ConversationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_invalidates_cache() {
        let s = store(Some(Arc::new(MemoryCache::new(Duration::from_secs(60), 10))));
        let conv = s.create_conversation(None, BTreeMap::new()).await.unwrap();
        assert_eq!(conv.user_id, "anonymous");
        s.add_message(&conv.id, Role::User, "hi", Vec::new()).await.unwrap();
        s.delete_conversation(&conv.id).await.unwrap();
        assert!(s.get_messages(&conv.id, 5).await.is_err());
    }

    #[tokio::test]
    async fn test_expired_cache_entry_is_a_miss() {
        let cache = MemoryCache::new(Duration::ZERO, 10);
        let ticket = cache.reserve("c1").await.unwrap();
        assert!(cache.fill("c1", ticket, CachedWindow::default()).await.unwrap());
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(cache.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_append_does_not_extend_ttl() {
        let cache = MemoryCache::new(Duration::from_millis(60), 10);
        let ticket = cache.reserve("c1").await.unwrap();
        cache.fill("c1", ticket, CachedWindow::default()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let message = Message {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            role: Role::User,
            content: "hi".to_string(),
            created_at: now_millis(),
            context_used: Vec::new(),
        };
        cache.append(&message).await.unwrap();
        assert_eq!(cache.get("c1").await.unwrap().unwrap().messages.len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get("c1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_during_fill_voids_ticket() {
        let cache = MemoryCache::new(Duration::from_secs(60), 10);
        let stale = cache.reserve("c1").await.unwrap();
        cache.invalidate("c1").await.unwrap();
        assert!(!cache.fill("c1", stale, CachedWindow::default()).await.unwrap());
        assert!(cache.get("c1").await.unwrap().is_none());

        let first = cache.reserve("c1").await.unwrap();
        let second = cache.reserve("c1").await.unwrap();
        assert!(!cache.fill("c1", first, CachedWindow::default()).await.unwrap());
        assert!(cache.fill("c1", second, CachedWindow::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_entries_are_swept() {
        let cache = MemoryCache::new(Duration::from_millis(20), 10);
        for i in 0..50 {
            let id = format!("c{}", i);
            let ticket = cache.reserve(&id).await.unwrap();
            cache.fill(&id, ticket, CachedWindow::default()).await.unwrap();
        }
        assert_eq!(cache.state.lock().unwrap().slots.len(), 50);

        tokio::time::sleep(Duration::from_millis(40)).await;
        cache.reserve("fresh").await.unwrap();
        assert_eq!(cache.state.lock().unwrap().slots.len(), 1);
    }

    #[tokio::test]
    async fn test_refill_racing_an_append_is_not_cached() {
        let backend = Arc::new(GatedBackend::default());
        let cache = Arc::new(MemoryCache::new(Duration::from_secs(60), 10));
        let store = Arc::new(ConversationStore::new(
            backend.clone(),
            Some(cache.clone()),
            "anonymous",
        ));
        let conv = store.create_conversation(None, BTreeMap::new()).await.unwrap();
        cache.invalidate(&conv.id).await.unwrap();

        backend.armed.store(true, std::sync::atomic::Ordering::SeqCst);
        let reader = tokio::spawn({
            let store = store.clone();
            let id = conv.id.clone();
            async move { store.get_messages(&id, 10).await.unwrap() }
        });
        backend.read_done.notified().await;
        store
            .add_message(&conv.id, Role::User, "hi", Vec::new())
            .await
            .unwrap();
        backend.release.notify_one();
        assert!(reader.await.unwrap().is_empty());

        let served = store.get_messages(&conv.id, 10).await.unwrap();
        let durable = backend.inner.recent_messages(&conv.id, 10).await.unwrap();
        assert_eq!(durable.len(), 1);
        assert_eq!(served, durable);
    }

    #[tokio::test]
    async fn test_sqlite_backend_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        crate::migrate::run_migrations(&pool).await.unwrap();
        let s = ConversationStore::new(Arc::new(SqliteConversations::new(pool)), None, "anon");

        let mut meta = BTreeMap::new();
        meta.insert("channel".to_string(), "web".to_string());
        let conv = s.create_conversation(Some("u7"), meta).await.unwrap();
        assert_eq!(s.get_conversation(&conv.id).await.unwrap(), conv);

        s.add_message(&conv.id, Role::User, "q", Vec::new()).await.unwrap();
        let cited = vec![ContextUsed {
            source: "vpn.md".to_string(),
            snippet: "Install".to_string(),
            score: 0.9,
        }];
        s.add_message(&conv.id, Role::Assistant, "a", cited.clone())
            .await
            .unwrap();

        let msgs = s.get_messages(&conv.id, 10).await.unwrap();
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].role, Role::Assistant);
        assert_eq!(msgs[0].context_used, cited);
        assert_eq!(msgs[1].content, "q");

        s.delete_conversation(&conv.id).await.unwrap();
        assert!(matches!(
            s.get_conversation(&conv.id).await,
            Err(RagError::ConversationNotFound(_))
        ));
    }
}
