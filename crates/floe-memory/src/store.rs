use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use floe_core::config::ShortTermMemoryConfig;
use floe_core::error::{FloeError, Result};
use floe_core::event::EventBus;
use floe_core::traits::{StateStore, Summarizer};
use floe_core::types::{ConversationTurn, MemoryKey};

use crate::isolation::resolve_key;
use crate::session::{MemoryHealth, SessionMemory, SessionSnapshot};

/// Store key under which a session snapshot is persisted.
pub fn snapshot_key(key: &MemoryKey) -> String {
    format!("memory:{}", key.composite())
}

/// Short-term memory partitioned by [`MemoryKey`].
///
/// Sessions are created on first use. With a [`StateStore`] attached, a new
/// session is hydrated from its last snapshot and every appended turn is
/// persisted.
pub struct ShortTermMemory {
    config: Arc<ShortTermMemoryConfig>,
    summarizer: Option<Arc<dyn Summarizer>>,
    events: Option<Arc<EventBus>>,
    state_store: Option<Arc<dyn StateStore>>,
    sessions: RwLock<HashMap<MemoryKey, Arc<SessionMemory>>>,
}

impl ShortTermMemory {
    pub fn new(config: ShortTermMemoryConfig) -> Self {
        Self {
            config: Arc::new(config),
            summarizer: None,
            events: None,
            state_store: None,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = Some(summarizer);
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_state_store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.state_store = Some(store);
        self
    }

    pub fn config(&self) -> &ShortTermMemoryConfig {
        &self.config
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled()
    }

    /// Resolve the key for a call, or `None` when memory is disabled or no
    /// key can be resolved under the isolation policy.
    pub fn resolve_key(&self, explicit: Option<&MemoryKey>, tool_context: &Value) -> Option<MemoryKey> {
        if !self.enabled() {
            return None;
        }
        resolve_key(&self.config.isolation, explicit, tool_context)
    }

    /// Session for `key`, creating (and hydrating) it on first use.
    pub async fn session(&self, key: &MemoryKey) -> Result<Arc<SessionMemory>> {
        let existing = self.read_sessions().get(key).cloned();
        if let Some(session) = existing {
            return Ok(session);
        }

        let session = Arc::new(SessionMemory::new(
            key.clone(),
            Arc::clone(&self.config),
            self.summarizer.clone(),
            self.events.clone(),
        ));
        match self.load_snapshot(key).await {
            Ok(Some(snapshot)) => {
                debug!(session = %key, turns = snapshot.recent_turns.len(), "Memory session hydrated");
                session.restore(snapshot);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session = %key, error = %e, "Could not hydrate memory session, starting fresh");
            }
        }

        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        Ok(Arc::clone(sessions.entry(key.clone()).or_insert(session)))
    }

    pub async fn add_turn(&self, key: &MemoryKey, turn: ConversationTurn) -> Result<()> {
        if !self.enabled() {
            return Ok(());
        }
        let session = self.session(key).await?;
        session.add_turn(turn).await?;
        self.persist(&session).await;
        Ok(())
    }

    /// Context patch for `key`; an empty object when memory is disabled.
    pub async fn get_llm_context(&self, key: &MemoryKey) -> Result<Value> {
        if !self.enabled() {
            return Ok(Value::Object(Default::default()));
        }
        Ok(self.session(key).await?.get_llm_context().await)
    }

    pub async fn estimate_tokens(&self, key: &MemoryKey) -> Result<usize> {
        if !self.enabled() {
            return Ok(0);
        }
        Ok(self.session(key).await?.estimate_tokens())
    }

    pub fn health(&self, key: &MemoryKey) -> Option<MemoryHealth> {
        self.read_sessions().get(key).map(|s| s.health())
    }

    /// Join background summarization for `key` and persist the result.
    pub async fn flush(&self, key: &MemoryKey) {
        let session = self.read_sessions().get(key).cloned();
        if let Some(session) = session {
            session.flush().await;
            self.persist(&session).await;
        }
    }

    pub async fn flush_all(&self) {
        let sessions: Vec<Arc<SessionMemory>> = self.read_sessions().values().cloned().collect();
        for session in sessions {
            session.flush().await;
            self.persist(&session).await;
        }
    }

    /// Drop a session from memory and from the state store.
    pub async fn forget(&self, key: &MemoryKey) -> Result<()> {
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        if let Some(store) = &self.state_store {
            store.delete(&snapshot_key(key)).await?;
        }
        Ok(())
    }

    fn read_sessions(&self) -> std::sync::RwLockReadGuard<'_, HashMap<MemoryKey, Arc<SessionMemory>>> {
        self.sessions.read().unwrap_or_else(|e| e.into_inner())
    }

    async fn load_snapshot(&self, key: &MemoryKey) -> Result<Option<SessionSnapshot>> {
        let Some(store) = &self.state_store else {
            return Ok(None);
        };
        let Some(bytes) = store.load(&snapshot_key(key)).await? else {
            return Ok(None);
        };
        let snapshot: SessionSnapshot = serde_json::from_slice(&bytes)?;
        if &snapshot.key != key {
            return Err(FloeError::Store(format!(
                "snapshot for {} stored under {}",
                snapshot.key,
                key
            )));
        }
        Ok(Some(snapshot))
    }

    /// Persisting is best-effort; a store failure never fails the turn.
    async fn persist(&self, session: &SessionMemory) {
        let Some(store) = &self.state_store else {
            return;
        };
        let snapshot = session.snapshot();
        let result = match serde_json::to_vec(&snapshot) {
            Ok(bytes) => store.save(&snapshot_key(session.key()), bytes).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            warn!(session = %session.key(), error = %e, "Failed to persist memory session");
        }
    }
}
