use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use floe_core::config::{MemoryStrategy, OverflowPolicy, ShortTermMemoryConfig};
use floe_core::error::{FloeError, Result};
use floe_core::event::{EventBus, FlowEvent};
use floe_core::tokens::{estimate_json_tokens, estimate_tokens, truncate_to_tokens};
use floe_core::traits::Summarizer;
use floe_core::types::{ConversationTurn, MemoryKey, TraceId};

/// Summarizer health of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryHealth {
    #[default]
    Healthy,
    /// A re-attempt after degradation is in flight.
    Recovering,
    /// The summarizer failed; context falls back to full-zone turns.
    Degraded,
}

impl fmt::Display for MemoryHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Healthy => "healthy",
            Self::Recovering => "recovering",
            Self::Degraded => "degraded",
        })
    }
}

/// Serializable state of a session, used for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub key: MemoryKey,
    pub recent_turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub pending_turns: Vec<ConversationTurn>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub health: MemoryHealth,
}

#[derive(Debug, Clone)]
struct PendingTurn {
    seq: u64,
    turn: ConversationTurn,
}

#[derive(Debug, Clone, Default)]
struct SessionState {
    /// Full zone: the newest turns, kept verbatim.
    recent: VecDeque<ConversationTurn>,
    /// Turns that left the full zone and are not yet folded into the summary.
    pending: VecDeque<PendingTurn>,
    summary: Option<String>,
    health: MemoryHealth,
    next_seq: u64,
    summarizing: bool,
    last_failure: Option<Instant>,
}

impl SessionState {
    fn push(&mut self, turn: ConversationTurn, config: &ShortTermMemoryConfig) {
        self.recent.push_back(turn);
        while self.recent.len() > config.budget.full_zone_turns {
            let Some(evicted) = self.recent.pop_front() else {
                break;
            };
            if config.strategy == MemoryStrategy::RollingSummary {
                self.pending.push_back(PendingTurn {
                    seq: self.next_seq,
                    turn: evicted,
                });
                self.next_seq += 1;
            }
        }

        if self.health != MemoryHealth::Healthy {
            let limit = config.recovery_backlog_limit;
            let mut dropped = 0;
            while self.pending.len() > limit {
                self.pending.pop_front();
                dropped += 1;
            }
            if dropped > 0 {
                warn!(dropped, limit, "Memory backlog over limit, dropped oldest pending turns");
            }
        }
    }

    fn render(&self, config: &ShortTermMemoryConfig, with_summary: bool) -> Value {
        let include_digest = config.include_trajectory_digest;
        let mut ctx = Map::new();
        ctx.insert(
            "recent_turns".into(),
            Value::Array(self.recent.iter().map(|t| turn_json(t, include_digest)).collect()),
        );
        if with_summary {
            if !self.pending.is_empty() {
                ctx.insert(
                    "pending_turns".into(),
                    Value::Array(
                        self.pending
                            .iter()
                            .map(|p| turn_json(&p.turn, include_digest))
                            .collect(),
                    ),
                );
            }
            if let Some(summary) = &self.summary {
                ctx.insert("summary".into(), Value::String(summary.clone()));
            }
        }
        Value::Object(ctx)
    }

    fn payload_tokens(&self, config: &ShortTermMemoryConfig) -> usize {
        estimate_json_tokens(&self.render(config, true))
    }

    fn enforce_budget(&mut self, config: &ShortTermMemoryConfig) -> Result<()> {
        let limit = config.budget.total_max_tokens;
        let tokens = self.payload_tokens(config);
        if tokens <= limit {
            return Ok(());
        }
        match config.budget.overflow_policy {
            OverflowPolicy::Error => return Err(FloeError::MemoryBudgetExceeded { tokens, limit }),
            OverflowPolicy::TruncateSummary => {
                self.shrink_summary(config);
                self.drop_oldest(config);
            }
            OverflowPolicy::TruncateOldest => {
                self.drop_oldest(config);
                self.shrink_summary(config);
            }
        }
        debug!(before = tokens, after = self.payload_tokens(config), limit, "Memory trimmed to budget");
        Ok(())
    }

    fn shrink_summary(&mut self, config: &ShortTermMemoryConfig) {
        let limit = config.budget.total_max_tokens;
        let tokens = self.payload_tokens(config);
        if tokens <= limit {
            return;
        }
        let Some(summary) = self.summary.take() else {
            return;
        };
        let excess = tokens - limit;
        let allowed = estimate_tokens(&summary).saturating_sub(excess);
        let shrunk = truncate_to_tokens(&summary, allowed);
        if !shrunk.is_empty() {
            self.summary = Some(shrunk);
        }
    }

    /// Drop pending turns first, then full-zone turns, keeping the newest.
    fn drop_oldest(&mut self, config: &ShortTermMemoryConfig) {
        let limit = config.budget.total_max_tokens;
        while self.payload_tokens(config) > limit {
            if self.pending.pop_front().is_some() {
                continue;
            }
            if self.recent.len() > 1 {
                self.recent.pop_front();
                continue;
            }
            break;
        }
    }
}

fn turn_json(turn: &ConversationTurn, include_digest: bool) -> Value {
    let mut value = json!({
        "user": turn.user_message,
        "assistant": turn.assistant_response,
        "ts": turn.ts.to_rfc3339(),
    });
    if include_digest {
        if let Some(digest) = &turn.trajectory_digest {
            value["trajectory_digest"] = json!({
                "tools_invoked": digest.tools_invoked,
                "observations_summary": digest.observations_summary,
                "failed_steps": digest.failed_steps,
            });
        }
    }
    if !turn.artifacts_shown.is_empty() {
        value["artifacts_shown"] = json!(turn.artifacts_shown);
    }
    value
}

struct Inner {
    key: MemoryKey,
    config: Arc<ShortTermMemoryConfig>,
    summarizer: Option<Arc<dyn Summarizer>>,
    events: Option<Arc<EventBus>>,
    state: Mutex<SessionState>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn transition(&self, state: &mut SessionState, to: MemoryHealth) {
        let from = state.health;
        if from == to {
            return;
        }
        state.health = to;
        match to {
            MemoryHealth::Degraded => {
                warn!(session = %self.key, %from, %to, "Memory health changed")
            }
            _ => info!(session = %self.key, %from, %to, "Memory health changed"),
        }
        if let Some(events) = &self.events {
            events.publish(FlowEvent::MemoryHealthChanged {
                trace_id: TraceId::from_str(&self.key.composite()),
                session: self.key.composite(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }
    }

    /// Mark a summarization run as started if one is due. Degraded sessions
    /// only re-attempt once `degraded_retry_interval_s` has passed.
    fn claim_summarization(&self, state: &mut SessionState) -> bool {
        if self.summarizer.is_none()
            || self.config.strategy != MemoryStrategy::RollingSummary
            || state.summarizing
            || state.pending.is_empty()
        {
            return false;
        }
        match state.health {
            MemoryHealth::Healthy => {}
            MemoryHealth::Recovering => return false,
            MemoryHealth::Degraded => {
                let interval =
                    Duration::try_from_secs_f64(self.config.degraded_retry_interval_s).unwrap_or_default();
                let due = state.last_failure.map_or(true, |at| at.elapsed() >= interval);
                if !due {
                    return false;
                }
                self.transition(state, MemoryHealth::Recovering);
            }
        }
        state.summarizing = true;
        true
    }

    async fn summarize_pending(&self) {
        let Some(summarizer) = self.summarizer.clone() else {
            self.lock().summarizing = false;
            return;
        };
        loop {
            let (previous, batch, last_seq) = {
                let mut state = self.lock();
                let Some(last_seq) = state.pending.back().map(|p| p.seq) else {
                    state.summarizing = false;
                    return;
                };
                let batch: Vec<ConversationTurn> = state.pending.iter().map(|p| p.turn.clone()).collect();
                (state.summary.clone(), batch, last_seq)
            };
            let folded = batch.len();

            match self.summarize_with_retry(summarizer.as_ref(), previous, batch).await {
                Ok(summary) => {
                    let mut state = self.lock();
                    state.pending.retain(|p| p.seq > last_seq);
                    state.summary = Some(truncate_to_tokens(&summary, self.config.budget.summary_max_tokens));
                    state.last_failure = None;
                    debug!(session = %self.key, turns = folded, "Summary refreshed");
                    self.transition(&mut state, MemoryHealth::Healthy);
                }
                Err(e) => {
                    let mut state = self.lock();
                    state.summarizing = false;
                    state.last_failure = Some(Instant::now());
                    warn!(session = %self.key, error = %e, "Summarization failed, falling back to recent turns");
                    self.transition(&mut state, MemoryHealth::Degraded);
                    return;
                }
            }
        }
    }

    async fn summarize_with_retry(
        &self,
        summarizer: &dyn Summarizer,
        previous: Option<String>,
        batch: Vec<ConversationTurn>,
    ) -> Result<String> {
        let attempts = self.config.retry_attempts.max(1);
        let mut last_error = None;
        for attempt in 0..attempts {
            match summarizer.summarize(previous.clone(), batch.clone()).await {
                Ok(summary) => return Ok(summary),
                Err(e) => {
                    debug!(session = %self.key, attempt = attempt + 1, error = %e, "Summarization attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < attempts {
                        let delay = self.config.retry_backoff_base_s * 2f64.powi(attempt as i32);
                        tokio::time::sleep(Duration::try_from_secs_f64(delay).unwrap_or_default()).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| FloeError::Summarizer("no attempts made".into())))
    }
}

/// Memory of one isolated session.
///
/// Appends are serialized. Summarization runs as a background task owned by
/// the session; [`SessionMemory::flush`] joins it.
pub struct SessionMemory {
    inner: Arc<Inner>,
    background: Mutex<Option<JoinHandle<()>>>,
    appends: tokio::sync::Mutex<()>,
}

impl SessionMemory {
    pub fn new(
        key: MemoryKey,
        config: Arc<ShortTermMemoryConfig>,
        summarizer: Option<Arc<dyn Summarizer>>,
        events: Option<Arc<EventBus>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                key,
                config,
                summarizer,
                events,
                state: Mutex::new(SessionState::default()),
            }),
            background: Mutex::new(None),
            appends: tokio::sync::Mutex::new(()),
        }
    }

    pub fn key(&self) -> &MemoryKey {
        &self.inner.key
    }

    pub fn health(&self) -> MemoryHealth {
        self.inner.lock().health
    }

    pub fn summary(&self) -> Option<String> {
        self.inner.lock().summary.clone()
    }

    pub fn recent_turns(&self) -> Vec<ConversationTurn> {
        self.inner.lock().recent.iter().cloned().collect()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Append a completed turn.
    ///
    /// Under the `error` overflow policy a turn that would push the payload
    /// past `total_max_tokens` is rejected and the session is left unchanged.
    pub async fn add_turn(&self, turn: ConversationTurn) -> Result<()> {
        let _append = self.appends.lock().await;
        let config = &self.inner.config;
        let spawn = {
            let mut state = self.inner.lock();
            let mut next = state.clone();
            next.push(turn, config);
            next.enforce_budget(config)?;
            *state = next;
            self.inner.claim_summarization(&mut state)
        };
        if spawn {
            self.spawn_summarizer();
        }
        Ok(())
    }

    /// JSON patch for the planner prompt: `recent_turns`, plus
    /// `pending_turns` and `summary` while healthy.
    pub async fn get_llm_context(&self) -> Value {
        let (ctx, spawn) = {
            let mut state = self.inner.lock();
            let spawn = self.inner.claim_summarization(&mut state);
            let healthy = state.health == MemoryHealth::Healthy;
            (state.render(&self.inner.config, healthy), spawn)
        };
        if spawn {
            self.spawn_summarizer();
        }
        ctx
    }

    /// Token size of the context as it would currently be injected.
    pub fn estimate_tokens(&self) -> usize {
        let state = self.inner.lock();
        let healthy = state.health == MemoryHealth::Healthy;
        estimate_json_tokens(&state.render(&self.inner.config, healthy))
    }

    /// Wait for background summarization to finish.
    pub async fn flush(&self) {
        loop {
            let handle = self.background.lock().unwrap_or_else(|e| e.into_inner()).take();
            let Some(handle) = handle else {
                break;
            };
            if let Err(e) = handle.await {
                warn!(session = %self.inner.key, error = %e, "Summarization task ended abnormally");
                self.inner.lock().summarizing = false;
            }
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.lock();
        SessionSnapshot {
            key: self.inner.key.clone(),
            recent_turns: state.recent.iter().cloned().collect(),
            pending_turns: state.pending.iter().map(|p| p.turn.clone()).collect(),
            summary: state.summary.clone(),
            health: state.health,
        }
    }

    /// Replace the session state with a persisted snapshot. An in-flight
    /// recovery is restored as degraded so it is re-attempted on next use.
    pub fn restore(&self, snapshot: SessionSnapshot) {
        let mut state = self.inner.lock();
        let pending: VecDeque<PendingTurn> = snapshot
            .pending_turns
            .into_iter()
            .enumerate()
            .map(|(seq, turn)| PendingTurn { seq: seq as u64, turn })
            .collect();
        *state = SessionState {
            recent: snapshot.recent_turns.into(),
            next_seq: pending.len() as u64,
            pending,
            summary: snapshot.summary,
            health: match snapshot.health {
                MemoryHealth::Recovering => MemoryHealth::Degraded,
                other => other,
            },
            summarizing: false,
            last_failure: None,
        };
    }

    fn spawn_summarizer(&self) {
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move { inner.summarize_pending().await });
        *self.background.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }
}

impl Drop for SessionMemory {
    fn drop(&mut self) {
        if let Some(handle) = self.background.lock().unwrap_or_else(|e| e.into_inner()).take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use floe_core::types::TrajectoryDigest;
    use floe_test_utils::{memory_key, turn, FailingSummarizer, FlakySummarizer, RecordingSummarizer};

    fn session(config: ShortTermMemoryConfig, summarizer: Option<Arc<dyn Summarizer>>) -> SessionMemory {
        SessionMemory::new(memory_key("s-1"), Arc::new(config), summarizer, None)
    }

    fn users(ctx: &Value, field: &str) -> Vec<String> {
        ctx[field]
            .as_array()
            .map(|turns| {
                turns
                    .iter()
                    .map(|t| t["user"].as_str().unwrap_or_default().to_string())
                    .collect()
            })
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_truncation_keeps_last_turns() {
        let memory = session(ShortTermMemoryConfig::truncation(2), None);
        for n in 1..=3 {
            memory.add_turn(turn(n)).await.unwrap();
        }
        let ctx = memory.get_llm_context().await;
        assert_eq!(users(&ctx, "recent_turns"), vec!["question 2", "question 3"]);
        assert!(ctx.get("pending_turns").is_none());
        assert!(ctx.get("summary").is_none());
        assert_eq!(memory.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rolling_summary_folds_evicted_turns() {
        let summarizer = Arc::new(RecordingSummarizer::new());
        let memory = session(ShortTermMemoryConfig::rolling_summary(2), Some(summarizer.clone()));
        for n in 1..=4 {
            memory.add_turn(turn(n)).await.unwrap();
            memory.flush().await;
        }

        let ctx = memory.get_llm_context().await;
        assert_eq!(users(&ctx, "recent_turns"), vec!["question 3", "question 4"]);
        assert_eq!(ctx["summary"], "user asked: question 1 | user asked: question 2");
        assert!(ctx.get("pending_turns").is_none());
        assert_eq!(summarizer.batches().len(), 2);
        assert_eq!(memory.health(), MemoryHealth::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_summarizer_failure_degrades() {
        let summarizer = Arc::new(FailingSummarizer::new());
        let memory = session(ShortTermMemoryConfig::rolling_summary(1), Some(summarizer.clone()));
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();
        memory.flush().await;

        assert_eq!(summarizer.calls(), 3);
        assert_eq!(memory.health(), MemoryHealth::Degraded);
        let ctx = memory.get_llm_context().await;
        assert!(ctx.get("summary").is_none());
        assert!(ctx.get("pending_turns").is_none());
        assert_eq!(users(&ctx, "recent_turns"), vec!["question 2"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_within_attempts_stays_healthy() {
        let summarizer = Arc::new(FlakySummarizer::new(2));
        let memory = session(ShortTermMemoryConfig::rolling_summary(1), Some(summarizer.clone()));
        let started = Instant::now();
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();
        memory.flush().await;

        assert_eq!(summarizer.calls(), 3);
        assert_eq!(memory.health(), MemoryHealth::Healthy);
        assert_eq!(memory.summary().as_deref(), Some("user asked: question 1"));
        // Backoff 2s then 4s.
        assert!(started.elapsed() >= Duration::from_secs(6));
    }

    #[tokio::test(start_paused = true)]
    async fn test_degraded_reattempts_after_interval() {
        let summarizer = Arc::new(FlakySummarizer::new(3));
        let events = Arc::new(EventBus::default());
        let mut rx = events.subscribe();
        let memory = SessionMemory::new(
            memory_key("s-1"),
            Arc::new(ShortTermMemoryConfig::rolling_summary(1)),
            Some(summarizer.clone()),
            Some(events.clone()),
        );
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();
        memory.flush().await;
        assert_eq!(memory.health(), MemoryHealth::Degraded);

        // Not due yet.
        memory.add_turn(turn(3)).await.unwrap();
        memory.flush().await;
        assert_eq!(summarizer.calls(), 3);

        tokio::time::advance(Duration::from_secs(31)).await;
        let ctx = memory.get_llm_context().await;
        assert!(ctx.get("summary").is_none());
        assert_eq!(memory.health(), MemoryHealth::Recovering);
        memory.flush().await;

        assert_eq!(memory.health(), MemoryHealth::Healthy);
        assert_eq!(
            memory.summary().as_deref(),
            Some("user asked: question 1 | user asked: question 2")
        );

        let mut transitions = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let FlowEvent::MemoryHealthChanged { to, .. } = event {
                transitions.push(to);
            }
        }
        assert_eq!(transitions, vec!["degraded", "recovering", "healthy"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backlog_capped_while_degraded() {
        let summarizer = Arc::new(FailingSummarizer::new());
        let mut config = ShortTermMemoryConfig::rolling_summary(1);
        config.recovery_backlog_limit = 2;
        let memory = session(config, Some(summarizer));
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();
        memory.flush().await;
        assert_eq!(memory.health(), MemoryHealth::Degraded);

        for n in 3..=6 {
            memory.add_turn(turn(n)).await.unwrap();
        }
        assert_eq!(memory.pending_len(), 2);
        let snapshot = memory.snapshot();
        let pending: Vec<_> = snapshot.pending_turns.iter().map(|t| t.user_message.as_str()).collect();
        assert_eq!(pending, vec!["question 4", "question 5"]);
    }

    /// Limit between the size of a two-turn and a three-turn context.
    async fn two_turn_limit() -> usize {
        let probe = session(ShortTermMemoryConfig::truncation(5), None);
        probe.add_turn(turn(1)).await.unwrap();
        probe.add_turn(turn(2)).await.unwrap();
        let two = probe.estimate_tokens();
        probe.add_turn(turn(3)).await.unwrap();
        let three = probe.estimate_tokens();
        two + (three - two) / 2
    }

    #[tokio::test]
    async fn test_overflow_error_rejects_turn() {
        let mut config = ShortTermMemoryConfig::truncation(5);
        config.budget.total_max_tokens = two_turn_limit().await;
        config.budget.overflow_policy = OverflowPolicy::Error;
        let memory = session(config, None);
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();

        let err = memory.add_turn(turn(3)).await.unwrap_err();
        assert_eq!(err.kind(), "memory_budget_exceeded");
        assert_eq!(memory.recent_turns().len(), 2);
    }

    #[tokio::test]
    async fn test_overflow_truncate_oldest() {
        let mut config = ShortTermMemoryConfig::truncation(5);
        config.budget.total_max_tokens = two_turn_limit().await;
        config.budget.overflow_policy = OverflowPolicy::TruncateOldest;
        let memory = session(config, None);
        for n in 1..=3 {
            memory.add_turn(turn(n)).await.unwrap();
        }
        let ctx = memory.get_llm_context().await;
        assert_eq!(users(&ctx, "recent_turns"), vec!["question 2", "question 3"]);
    }

    #[test]
    fn test_overflow_truncate_summary_shrinks_summary_first() {
        let mut config = ShortTermMemoryConfig::rolling_summary(2);
        let mut state = SessionState::default();
        state.push(turn(1), &config);
        let without_summary = state.payload_tokens(&config);

        config.budget.total_max_tokens = without_summary + 20;
        state.summary = Some("the user keeps asking about quarterly metrics ".repeat(40));
        state.enforce_budget(&config).unwrap();

        assert_eq!(state.recent.len(), 1);
        let summary = state.summary.clone().unwrap_or_default();
        assert!(!summary.is_empty());
        assert!(estimate_tokens(&summary) <= 20);
        assert!(state.payload_tokens(&config) <= config.budget.total_max_tokens + 4);
    }

    #[test]
    fn test_digest_respects_config() {
        let digest = TrajectoryDigest {
            tools_invoked: vec!["search".into()],
            observations_summary: "2 docs".into(),
            ..Default::default()
        };
        let t = turn(1).with_digest(digest);
        assert_eq!(turn_json(&t, true)["trajectory_digest"]["tools_invoked"][0], "search");
        assert!(turn_json(&t, false).get("trajectory_digest").is_none());
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let memory = session(ShortTermMemoryConfig::truncation(2), None);
        memory.add_turn(turn(1)).await.unwrap();
        memory.add_turn(turn(2)).await.unwrap();
        let mut snapshot = memory.snapshot();
        snapshot.health = MemoryHealth::Recovering;

        let restored = session(ShortTermMemoryConfig::truncation(2), None);
        restored.restore(snapshot);
        assert_eq!(restored.recent_turns(), memory.recent_turns());
        assert_eq!(restored.health(), MemoryHealth::Degraded);
    }
}
