//! Incremental decoding of OpenAI-style event streams.
//!
//! Streaming chat completions arrive as `data: {chunk}` lines terminated by
//! a `data: [DONE]` sentinel. HTTP bodies deliver those lines in arbitrary
//! byte chunks, so [`SseBuffer`] owns the reassembly: bytes go in, complete
//! frames come out, a partial trailing line stays buffered.

use serde_json::Value;

/// One decoded frame from the stream.
#[derive(Debug)]
pub enum StreamFrame {
    /// A chat-completion chunk object (`choices[].delta` and friends).
    Chunk(Value),
    /// The `[DONE]` terminator.
    Done,
}

/// Decode a single stream line. Lines without a `data:` field (event names,
/// comments, ids, blank separators) carry nothing we consume and yield
/// `None`, as does a data payload that is not valid JSON.
fn decode_line(line: &str) -> Option<StreamFrame> {
    let payload = line.strip_prefix("data:")?.trim();
    if payload == "[DONE]" {
        return Some(StreamFrame::Done);
    }
    serde_json::from_str(payload).ok().map(StreamFrame::Chunk)
}

/// Reassembles stream lines from HTTP body chunks.
#[derive(Default)]
pub struct SseBuffer {
    pending: String,
}

impl SseBuffer {
    /// Feed one body chunk; returns every frame completed by it.
    pub fn push(&mut self, chunk: &str) -> Vec<StreamFrame> {
        self.pending.push_str(chunk);
        let mut frames = Vec::new();
        while let Some(newline) = self.pending.find('\n') {
            let line: String = self.pending.drain(..=newline).collect();
            if let Some(frame) = decode_line(line.trim_end()) {
                frames.push(frame);
            }
        }
        frames
    }

    /// Flush a final unterminated line (stream ended mid-frame).
    pub fn finish(self) -> Vec<StreamFrame> {
        decode_line(self.pending.trim_end()).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_chunk_and_done_frames() {
        let mut buf = SseBuffer::default();
        let frames = buf.push("data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\ndata: [DONE]\n\n");
        assert_eq!(frames.len(), 2);
        match &frames[0] {
            StreamFrame::Chunk(data) => {
                assert_eq!(data["choices"][0]["delta"]["content"], "hi");
            }
            StreamFrame::Done => panic!("first frame should be a chunk"),
        }
        assert!(matches!(frames[1], StreamFrame::Done));
    }

    #[test]
    fn skips_non_data_fields_and_comments() {
        let mut buf = SseBuffer::default();
        let frames = buf.push(": keep-alive\nevent: message\nid: 7\n\ndata: {\"a\":1}\n");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], StreamFrame::Chunk(data) if data["a"] == 1));
    }

    #[test]
    fn holds_partial_lines_across_pushes() {
        let mut buf = SseBuffer::default();
        assert!(buf.push("data: {\"chunk\"").is_empty());
        let frames = buf.push(":1}\ndata: {\"next\":2}");
        assert_eq!(frames.len(), 1);
        assert!(matches!(&frames[0], StreamFrame::Chunk(data) if data["chunk"] == 1));

        let tail = buf.finish();
        assert_eq!(tail.len(), 1);
        assert!(matches!(&tail[0], StreamFrame::Chunk(data) if data["next"] == 2));
    }

    #[test]
    fn malformed_payloads_are_dropped() {
        let mut buf = SseBuffer::default();
        assert!(buf.push("data: {not json}\n").is_empty());
        assert!(SseBuffer::default().finish().is_empty());
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(SseBuffer::default().push("").is_empty());
    }
}
