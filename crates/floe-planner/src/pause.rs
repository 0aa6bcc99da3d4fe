use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use floe_core::error::{FloeError, Result};
use floe_core::traits::StateStore;
use floe_core::types::{Headers, MemoryKey, PauseReason, TraceId, WorkingMemory};

use crate::trajectory::Trajectory;

/// Everything needed to continue a paused run. Holds only data, so it can
/// be persisted and resumed in another process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerSnapshot {
    pub trace_id: TraceId,
    pub headers: Headers,
    pub wm: WorkingMemory,
    pub trajectory: Trajectory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_key: Option<MemoryKey>,
    /// Memory context captured when the run started.
    #[serde(default)]
    pub memory_context: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_s: Option<f64>,
    pub reason: PauseReason,
    #[serde(default)]
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Returned to the caller when a run pauses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerPause {
    /// Single-use resume token.
    pub token: String,
    pub trace_id: TraceId,
    pub reason: PauseReason,
    #[serde(default)]
    pub payload: Value,
}

fn store_key(token: &str) -> String {
    format!("pause:{}", token)
}

/// Paused-run snapshots keyed by opaque resume tokens.
///
/// Snapshots are kept in process and, when a [`StateStore`] is attached,
/// also persisted so a different process can resume them. Taking a
/// snapshot consumes its token.
#[derive(Default)]
pub struct PauseStore {
    pending: Mutex<HashMap<String, PlannerSnapshot>>,
    store: Option<Arc<dyn StateStore>>,
}

impl PauseStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state_store(store: Arc<dyn StateStore>) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            store: Some(store),
        }
    }

    pub async fn put(&self, snapshot: PlannerSnapshot) -> Result<String> {
        let token = uuid::Uuid::new_v4().simple().to_string();
        if let Some(store) = &self.store {
            let bytes = serde_json::to_vec(&snapshot)?;
            store.save(&store_key(&token), bytes).await?;
        }
        debug!(token = %token, trace_id = %snapshot.trace_id, reason = %snapshot.reason, "Run paused");
        self.pending.lock().await.insert(token.clone(), snapshot);
        Ok(token)
    }

    /// Remove and return the snapshot for `token`.
    pub async fn take(&self, token: &str) -> Result<PlannerSnapshot> {
        let local = self.pending.lock().await.remove(token);
        let Some(store) = &self.store else {
            return local.ok_or_else(|| FloeError::PauseNotFound(token.to_string()));
        };

        let key = store_key(token);
        let snapshot = match local {
            Some(snapshot) => snapshot,
            None => {
                let bytes = store
                    .load(&key)
                    .await?
                    .ok_or_else(|| FloeError::PauseNotFound(token.to_string()))?;
                serde_json::from_slice(&bytes)?
            }
        };
        if let Err(e) = store.delete(&key).await {
            warn!(token = %token, error = %e, "Failed to delete consumed pause snapshot");
        }
        Ok(snapshot)
    }

    pub async fn pending_tokens(&self) -> Vec<String> {
        self.pending.lock().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_memory::InMemoryStateStore;
    use serde_json::json;

    fn snapshot() -> PlannerSnapshot {
        PlannerSnapshot {
            trace_id: TraceId::new(),
            headers: Headers::new("acme"),
            wm: WorkingMemory::new("deploy?"),
            trajectory: Trajectory::new("deploy?", Value::Null, Value::Null),
            memory_key: None,
            memory_context: Value::Null,
            deadline_s: None,
            reason: PauseReason::ApprovalRequired,
            payload: json!({"env": "prod"}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_token_is_single_use() {
        let pauses = PauseStore::new();
        let token = pauses.put(snapshot()).await.unwrap();
        assert_eq!(pauses.pending_tokens().await, vec![token.clone()]);

        let taken = pauses.take(&token).await.unwrap();
        assert_eq!(taken.payload["env"], "prod");
        let err = pauses.take(&token).await.unwrap_err();
        assert_eq!(err.kind(), "pause_not_found");
    }

    #[tokio::test]
    async fn test_resume_from_another_store_instance() {
        let backing: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        let original = snapshot();
        let token = PauseStore::with_state_store(Arc::clone(&backing))
            .put(original.clone())
            .await
            .unwrap();

        let other = PauseStore::with_state_store(Arc::clone(&backing));
        assert_eq!(other.take(&token).await.unwrap(), original);
        assert!(other.take(&token).await.is_err());
    }
}
