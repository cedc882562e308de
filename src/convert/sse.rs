//! Incremental server-sent-events parser.
//!
//! Upstream bodies arrive as arbitrary byte chunks; events are only complete
//! at a blank line. The parser buffers partial lines across pushes and emits
//! each finished event as an (optional event name, joined data) pair.
//! Comment lines (`:`) are dropped per the SSE spec.

/// One complete SSE record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    /// Value of the `event:` field, when present.
    pub event: Option<String>,
    /// All `data:` lines joined with `\n`.
    pub data: String,
}

/// Stateful line scanner. Feed it raw body chunks; collect finished events.
#[derive(Debug, Default)]
pub struct SseScanner {
    pending: String,
    event: Option<String>,
    data_lines: Vec<String>,
}

impl SseScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a body chunk, returning every event completed by it.
    ///
    /// Invalid UTF-8 chunks are dropped whole; SSE is a text protocol and a
    /// binary body means the upstream is not actually streaming events.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.pending.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.pending.find('\n') {
            let mut line = self.pending[..pos].to_string();
            self.pending.drain(..=pos);
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut events);
        }

        events
    }

    /// Flush at end of body: a final event not terminated by a blank line is
    /// still delivered.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.pending.is_empty() {
            let mut line = std::mem::take(&mut self.pending);
            if line.ends_with('\r') {
                line.pop();
            }
            self.take_line(&line, &mut events);
        }
        self.close_event(&mut events);
        events
    }

    fn take_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            self.close_event(events);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(value) = line.strip_prefix("event:") {
            let value = value.trim_start();
            self.event = (!value.is_empty()).then(|| value.to_string());
            return;
        }
        if let Some(value) = line.strip_prefix("data:") {
            self.data_lines.push(value.trim_start().to_string());
        }
        // Unknown field names (id:, retry:, …) are ignored.
    }

    fn close_event(&mut self, events: &mut Vec<SseEvent>) {
        if self.event.is_none() && self.data_lines.is_empty() {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
    }
}
