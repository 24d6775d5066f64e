//! Decoder for the agent's newline-delimited JSON event stream.
//!
//! The agent writes one JSON record per line on stdout. Output arrives in
//! arbitrary chunks, so bytes are buffered in a [`LineBuffer`] and only
//! complete lines are decoded. Decoding is a closed, tagged set of record
//! kinds ([`AgentRecord`]); anything else is ignored.
//!
//! Malformed-line policy: a line that is not valid JSON, or is JSON of an
//! unexpected shape, is skipped and counted in
//! [`DecodedStream::skipped_lines`]. It never aborts the stream.

use serde::Deserialize;
use serde_json::Value;

/// Observer of decoded agent activity.
pub trait AgentCallbacks: Send + Sync {
    /// A tool invocation by the agent.
    fn on_tool_use(&self, tool: &str, input: &Value);
    /// A text fragment (assistant text or diagnostic stderr output).
    fn on_text(&self, text: &str);
}

/// Buffers raw bytes and yields complete lines.
///
/// Splitting happens on bytes, so a multi-byte UTF-8 sequence split across
/// chunks is decoded only once the whole line has arrived.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line completed by it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Flush whatever partial line is left once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }

    #[cfg(test)]
    fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// One record of the agent stream.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentRecord {
    Assistant {
        message: AssistantMessage,
    },
    Result {
        #[serde(default)]
        result: Option<String>,
        #[serde(default)]
        is_error: bool,
    },
    /// `system`, `user` and any future kinds.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssistantMessage {
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

/// Outcome of decoding a single line.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedLine {
    Record(AgentRecord),
    Blank,
    Malformed,
}

impl AgentRecord {
    pub fn decode(line: &str) -> DecodedLine {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return DecodedLine::Blank;
        }
        match serde_json::from_str::<AgentRecord>(trimmed) {
            Ok(record) => DecodedLine::Record(record),
            Err(_) => DecodedLine::Malformed,
        }
    }
}

/// Final state of a decoded stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedStream {
    /// Accumulated assistant text, or the authoritative `result` text.
    pub result: String,
    pub skipped_lines: usize,
}

/// Incremental decoder driving [`AgentCallbacks`].
#[derive(Debug, Default)]
pub struct StreamDecoder {
    lines: LineBuffer,
    result: String,
    skipped_lines: usize,
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a raw stdout chunk.
    pub fn feed(&mut self, chunk: &[u8], callbacks: &dyn AgentCallbacks) {
        for line in self.lines.push(chunk) {
            self.handle_line(&line, callbacks);
        }
    }

    /// Flush the trailing partial line and return the final result.
    pub fn finish(mut self, callbacks: &dyn AgentCallbacks) -> DecodedStream {
        if let Some(line) = self.lines.finish() {
            self.handle_line(&line, callbacks);
        }
        DecodedStream {
            result: self.result,
            skipped_lines: self.skipped_lines,
        }
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    fn handle_line(&mut self, line: &str, callbacks: &dyn AgentCallbacks) {
        match AgentRecord::decode(line) {
            DecodedLine::Blank => {}
            DecodedLine::Malformed => {
                self.skipped_lines += 1;
                tracing::debug!(len = line.len(), "skipping malformed agent stream line");
            }
            DecodedLine::Record(AgentRecord::Assistant { message }) => {
                for block in message.content {
                    match block {
                        ContentBlock::ToolUse { name, input } => {
                            callbacks.on_tool_use(&name, &input);
                        }
                        ContentBlock::Text { text } => {
                            if !self.result.is_empty() && !self.result.ends_with('\n') {
                                self.result.push('\n');
                            }
                            self.result.push_str(&text);
                            callbacks.on_text(&text);
                        }
                        ContentBlock::Other => {}
                    }
                }
            }
            DecodedLine::Record(AgentRecord::Result { result, is_error }) => {
                if is_error {
                    tracing::debug!("agent reported an error result");
                }
                if let Some(result) = result {
                    self.result = result;
                }
            }
            DecodedLine::Record(AgentRecord::Other) => {}
        }
    }
}
