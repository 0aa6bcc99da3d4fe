use std::io::Write;

use chrono::{DateTime, Duration, Utc};
use tempfile::NamedTempFile;

use floe_core::types::{ConversationTurn, Headers, Message, MemoryKey};

pub fn acme_headers() -> Headers {
    Headers::new("acme").with_user("u-1")
}

pub fn data_message(value: serde_json::Value) -> Message {
    Message::data(value, acme_headers())
}

pub fn memory_key(session: &str) -> MemoryKey {
    MemoryKey::new("acme", "u-1", session)
}

/// Turn `n` of a conversation, `n` minutes after a fixed epoch.
pub fn turn(n: usize) -> ConversationTurn {
    let epoch: DateTime<Utc> = DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default();
    let mut turn = ConversationTurn::new(format!("question {n}"), format!("answer {n}"));
    turn.ts = epoch + Duration::minutes(n as i64);
    turn
}

/// Write `contents` to a temporary TOML file that lives as long as the handle.
pub fn config_file(contents: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".toml")
        .tempfile()
        .expect("create temp config");
    file.write_all(contents.as_bytes()).expect("write temp config");
    file
}
