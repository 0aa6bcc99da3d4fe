use std::collections::HashMap;
use std::sync::Mutex;

use floe_core::error::{FloeError, Result};
use floe_core::types::StreamChunk;

/// Hands out gapless sequence numbers per stream id.
#[derive(Default)]
pub(crate) struct StreamSequencer {
    next: Mutex<HashMap<String, u64>>,
}

impl StreamSequencer {
    /// Reserve the next seq for `stream_id`. A `done` chunk retires the stream.
    pub(crate) fn next(&self, stream_id: &str, done: bool) -> u64 {
        let mut next = self.next.lock().unwrap_or_else(|e| e.into_inner());
        let seq = next.get(stream_id).copied().unwrap_or(0);
        if done {
            next.remove(stream_id);
        } else {
            next.insert(stream_id.to_string(), seq + 1);
        }
        seq
    }
}

#[derive(Default)]
struct PartialStream {
    expected: u64,
    text: String,
}

/// Consumer-side reassembly of streamed chunks.
///
/// Chunks of one stream must arrive with seq 0, 1, 2, ... A gap or a
/// duplicate is reported as `FloeError::StreamGap`.
#[derive(Default)]
pub struct ChunkAssembler {
    streams: HashMap<String, PartialStream>,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the full text once the `done` chunk arrives.
    pub fn push(&mut self, chunk: &StreamChunk) -> Result<Option<String>> {
        let stream = self.streams.entry(chunk.stream_id.clone()).or_default();
        if chunk.seq != stream.expected {
            return Err(FloeError::StreamGap {
                stream_id: chunk.stream_id.clone(),
                expected: stream.expected,
                got: chunk.seq,
            });
        }
        stream.expected += 1;
        stream.text.push_str(&chunk.text);
        if chunk.done {
            let finished = self.streams.remove(&chunk.stream_id).unwrap_or_default();
            return Ok(Some(finished.text));
        }
        Ok(None)
    }

    /// Streams that have started but not finished.
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(stream: &str, seq: u64, text: &str, done: bool) -> StreamChunk {
        StreamChunk {
            stream_id: stream.into(),
            seq,
            text: text.into(),
            done,
            meta: Default::default(),
        }
    }

    #[test]
    fn test_sequencer_is_gapless_per_stream() {
        let seq = StreamSequencer::default();
        assert_eq!(seq.next("a", false), 0);
        assert_eq!(seq.next("b", false), 0);
        assert_eq!(seq.next("a", false), 1);
        assert_eq!(seq.next("a", true), 2);
        // A finished stream id starts over.
        assert_eq!(seq.next("a", false), 0);
    }

    #[test]
    fn test_assembler_joins_text() {
        let mut asm = ChunkAssembler::new();
        assert_eq!(asm.push(&chunk("s", 0, "Hel", false)).unwrap(), None);
        assert_eq!(asm.push(&chunk("s", 1, "lo", false)).unwrap(), None);
        assert_eq!(asm.push(&chunk("s", 2, "!", true)).unwrap(), Some("Hello!".into()));
        assert_eq!(asm.open_streams(), 0);
    }

    #[test]
    fn test_assembler_detects_gap_and_duplicate() {
        let mut asm = ChunkAssembler::new();
        asm.push(&chunk("s", 0, "a", false)).unwrap();
        let err = asm.push(&chunk("s", 2, "c", false)).unwrap_err();
        assert!(matches!(err, FloeError::StreamGap { expected: 1, got: 2, .. }));
        let err = asm.push(&chunk("s", 0, "a", false)).unwrap_err();
        assert!(matches!(err, FloeError::StreamGap { expected: 1, got: 0, .. }));
    }
}
