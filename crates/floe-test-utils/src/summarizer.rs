use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use futures::future::BoxFuture;

use floe_core::error::{FloeError, Result};
use floe_core::traits::Summarizer;
use floe_core::types::ConversationTurn;

/// Summarizer that fails on every call.
#[derive(Default)]
pub struct FailingSummarizer {
    calls: AtomicU32,
}

impl FailingSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for FailingSummarizer {
    fn summarize(
        &self,
        _previous: Option<String>,
        _turns: Vec<ConversationTurn>,
    ) -> BoxFuture<'_, Result<String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Box::pin(async { Err(FloeError::Summarizer("summarizer unavailable".into())) })
    }
}

/// Summarizer that fails `failures` times, then succeeds.
pub struct FlakySummarizer {
    failures: u32,
    calls: AtomicU32,
}

impl FlakySummarizer {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Summarizer for FlakySummarizer {
    fn summarize(
        &self,
        previous: Option<String>,
        turns: Vec<ConversationTurn>,
    ) -> BoxFuture<'_, Result<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = call < self.failures;
        Box::pin(async move {
            if fail {
                return Err(FloeError::Summarizer(format!("transient failure {}", call + 1)));
            }
            Ok(fold(previous, &turns))
        })
    }
}

/// Deterministic summarizer that records the batches it was given.
#[derive(Default)]
pub struct RecordingSummarizer {
    batches: Mutex<Vec<Vec<ConversationTurn>>>,
}

impl RecordingSummarizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn batches(&self) -> Vec<Vec<ConversationTurn>> {
        self.batches.lock().unwrap().clone()
    }
}

impl Summarizer for RecordingSummarizer {
    fn summarize(
        &self,
        previous: Option<String>,
        turns: Vec<ConversationTurn>,
    ) -> BoxFuture<'_, Result<String>> {
        let summary = fold(previous, &turns);
        self.batches.lock().unwrap().push(turns);
        Box::pin(async move { Ok(summary) })
    }
}

fn fold(previous: Option<String>, turns: &[ConversationTurn]) -> String {
    let mut parts: Vec<String> = previous.into_iter().collect();
    parts.extend(turns.iter().map(|t| format!("user asked: {}", t.user_message)));
    parts.join(" | ")
}
