//! Streaming re-framers: one small state machine per direction.
//!
//! Event ordering is load-bearing for downstream clients — a delta before
//! `message_start`, or a missing `content_block_stop`, breaks real SDKs — so
//! both directions are explicit state machines over event types rather than
//! per-line ad-hoc rewriting. Each machine consumes raw upstream body chunks
//! and yields fully framed SSE bytes ready to flush to the client.

use bytes::Bytes;
use serde_json::{json, Value};

use super::response::{finish_to_stop_reason, stop_reason_to_finish};
use super::sse::{SseEvent, SseScanner};

// ──────────────────────────────────────────────────────────────────────────────
// Anthropic upstream → OpenAI client
// ──────────────────────────────────────────────────────────────────────────────

/// Re-frames an Anthropic event stream as OpenAI chat-completion chunks.
pub struct AnthropicToOpenAiStream {
    scanner: SseScanner,
    id: String,
    model: String,
    created: i64,
    finish_emitted: bool,
    done_emitted: bool,
}

impl AnthropicToOpenAiStream {
    pub fn new() -> Self {
        Self {
            scanner: SseScanner::new(),
            id: "unknown".to_string(),
            model: "unknown".to_string(),
            created: chrono::Utc::now().timestamp(),
            finish_emitted: false,
            done_emitted: false,
        }
    }

    /// Feed one upstream body chunk; returns the client bytes it produced.
    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let events = self.scanner.push(chunk);
        self.transform_all(events)
    }

    /// Flush at upstream EOF. Guarantees the client stream is terminated with
    /// `[DONE]` even when the upstream died before `message_stop`.
    pub fn finish(&mut self) -> Bytes {
        let events = self.scanner.finish();
        let mut out = String::from_utf8(self.transform_all(events).to_vec()).unwrap_or_default();
        if !self.done_emitted {
            self.done_emitted = true;
            out.push_str("data: [DONE]\n\n");
        }
        Bytes::from(out)
    }

    fn transform_all(&mut self, events: Vec<SseEvent>) -> Bytes {
        let mut out = String::new();
        for event in events {
            self.transform(&event, &mut out);
        }
        Bytes::from(out)
    }

    fn transform(&mut self, event: &SseEvent, out: &mut String) {
        if self.done_emitted {
            return;
        }
        let Ok(data) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };
        // The data payload names its own type; the `event:` line is only a
        // fallback for upstreams that omit it.
        let kind = data
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| event.event.clone())
            .unwrap_or_default();

        match kind.as_str() {
            "message_start" => {
                if let Some(message) = data.get("message") {
                    if let Some(id) = message.get("id").and_then(Value::as_str) {
                        self.id = id.to_string();
                    }
                    if let Some(model) = message.get("model").and_then(Value::as_str) {
                        self.model = model.to_string();
                    }
                }
                self.write_chunk(out, json!({}), None);
            }
            "content_block_start" => {
                let Some(block) = data.get("content_block") else { return };
                match block.get("type").and_then(Value::as_str) {
                    Some("tool_use") => {
                        let delta = json!({
                            "tool_calls": [{
                                "index": 0,
                                "id": block.get("id").cloned().unwrap_or(Value::Null),
                                "type": "function",
                                "function": {
                                    "name": block.get("name").cloned().unwrap_or(Value::Null),
                                    "arguments": "",
                                },
                            }],
                        });
                        self.write_chunk(out, delta, None);
                    }
                    Some("text") => {
                        if let Some(text) =
                            block.get("text").and_then(Value::as_str).filter(|t| !t.is_empty())
                        {
                            self.write_chunk(out, json!({ "content": text }), None);
                        }
                    }
                    _ => {}
                }
            }
            "content_block_delta" => {
                let Some(delta) = data.get("delta") else { return };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        if let Some(text) = delta.get("text").and_then(Value::as_str) {
                            self.write_chunk(out, json!({ "content": text }), None);
                        }
                    }
                    Some("input_json_delta") => {
                        if let Some(partial) = delta.get("partial_json").and_then(Value::as_str) {
                            let delta = json!({
                                "tool_calls": [{
                                    "index": 0,
                                    "function": { "arguments": partial },
                                }],
                            });
                            self.write_chunk(out, delta, None);
                        }
                    }
                    _ => {}
                }
            }
            "message_delta" => {
                let stop_reason = data
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(Value::as_str);
                if let Some(reason) = stop_reason {
                    self.finish_emitted = true;
                    self.write_chunk(out, json!({}), Some(stop_reason_to_finish(Some(reason))));
                }
            }
            "message_stop" => {
                if !self.finish_emitted {
                    self.finish_emitted = true;
                    // Some upstreams put the stop reason on message_stop.
                    let reason = data.get("stop_reason").and_then(Value::as_str);
                    self.write_chunk(out, json!({}), Some(stop_reason_to_finish(reason)));
                }
                self.done_emitted = true;
                out.push_str("data: [DONE]\n\n");
            }
            // ping and content_block_stop have no OpenAI counterpart
            _ => {}
        }
    }

    fn write_chunk(&self, out: &mut String, delta: Value, finish_reason: Option<&str>) {
        let chunk = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason.map(Value::from).unwrap_or(Value::Null),
            }],
        });
        out.push_str("data: ");
        out.push_str(&chunk.to_string());
        out.push_str("\n\n");
    }
}

impl Default for AnthropicToOpenAiStream {
    fn default() -> Self {
        Self::new()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// OpenAI upstream → Anthropic client
// ──────────────────────────────────────────────────────────────────────────────

/// Re-frames an OpenAI chunk stream as Anthropic messages events.
///
/// The prelude (`message_start`, then an empty text `content_block_start`) is
/// synthesized from the first observed chunk, since OpenAI streams carry no
/// equivalent. Tool-call chunks open their own `tool_use` blocks; switching
/// block kinds closes the previous block first so every start is paired with
/// exactly one stop.
pub struct OpenAiToAnthropicStream {
    scanner: SseScanner,
    started: bool,
    block_open: bool,
    block_index: u64,
    block_is_tool: bool,
    finish_emitted: bool,
    stopped: bool,
}

impl OpenAiToAnthropicStream {
    pub fn new() -> Self {
        Self {
            scanner: SseScanner::new(),
            started: false,
            block_open: false,
            block_index: 0,
            block_is_tool: false,
            finish_emitted: false,
            stopped: false,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Bytes {
        let events = self.scanner.push(chunk);
        self.transform_all(events)
    }

    pub fn finish(&mut self) -> Bytes {
        let events = self.scanner.finish();
        let mut out = String::from_utf8(self.transform_all(events).to_vec()).unwrap_or_default();
        self.finalize(&mut out);
        Bytes::from(out)
    }

    fn transform_all(&mut self, events: Vec<SseEvent>) -> Bytes {
        let mut out = String::new();
        for event in events {
            self.transform(&event, &mut out);
        }
        Bytes::from(out)
    }

    fn transform(&mut self, event: &SseEvent, out: &mut String) {
        if self.stopped {
            return;
        }
        if event.data == "[DONE]" {
            self.finalize(out);
            return;
        }
        let Ok(chunk) = serde_json::from_str::<Value>(&event.data) else {
            return;
        };

        if !self.started {
            self.started = true;
            self.block_open = true;
            self.block_is_tool = false;
            let message = json!({
                "type": "message_start",
                "message": {
                    "id": chunk.get("id").cloned().unwrap_or_else(|| json!("msg_stream")),
                    "type": "message",
                    "role": "assistant",
                    "model": chunk.get("model").cloned().unwrap_or_else(|| json!("unknown")),
                    "content": [],
                    "stop_reason": Value::Null,
                    "stop_sequence": Value::Null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                },
            });
            write_event(out, "message_start", &message);
            write_event(
                out,
                "content_block_start",
                &json!({
                    "type": "content_block_start",
                    "index": self.block_index,
                    "content_block": { "type": "text", "text": "" },
                }),
            );
        }

        let Some(choice) = chunk.get("choices").and_then(Value::as_array).and_then(|c| c.first())
        else {
            return;
        };
        let delta = choice.get("delta").cloned().unwrap_or_else(|| json!({}));

        if let Some(text) = delta.get("content").and_then(Value::as_str).filter(|t| !t.is_empty()) {
            if self.block_is_tool {
                self.open_block(out, json!({ "type": "text", "text": "" }), false);
            }
            write_event(
                out,
                "content_block_delta",
                &json!({
                    "type": "content_block_delta",
                    "index": self.block_index,
                    "delta": { "type": "text_delta", "text": text },
                }),
            );
        }

        for call in delta.get("tool_calls").and_then(Value::as_array).into_iter().flatten() {
            let function = call.get("function");
            let name = function.and_then(|f| f.get("name")).and_then(Value::as_str);
            // An id or a name marks the start of a new call; bare arguments
            // continue the current one.
            if call.get("id").and_then(Value::as_str).is_some() || name.is_some() {
                self.open_block(
                    out,
                    json!({
                        "type": "tool_use",
                        "id": call.get("id").cloned().unwrap_or(Value::Null),
                        "name": name.map(Value::from).unwrap_or(Value::Null),
                        "input": {},
                    }),
                    true,
                );
            }
            if let Some(arguments) = function
                .and_then(|f| f.get("arguments"))
                .and_then(Value::as_str)
                .filter(|a| !a.is_empty())
            {
                write_event(
                    out,
                    "content_block_delta",
                    &json!({
                        "type": "content_block_delta",
                        "index": self.block_index,
                        "delta": { "type": "input_json_delta", "partial_json": arguments },
                    }),
                );
            }
        }

        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            if !self.finish_emitted {
                self.finish_emitted = true;
                write_event(
                    out,
                    "message_delta",
                    &json!({
                        "type": "message_delta",
                        "delta": {
                            "stop_reason": finish_to_stop_reason(Some(reason)),
                            "stop_sequence": Value::Null,
                        },
                    }),
                );
            }
        }
    }

    /// Close the open block (if any) and start a fresh one.
    fn open_block(&mut self, out: &mut String, content_block: Value, is_tool: bool) {
        if self.block_open {
            write_event(
                out,
                "content_block_stop",
                &json!({ "type": "content_block_stop", "index": self.block_index }),
            );
        }
        self.block_index += 1;
        self.block_open = true;
        self.block_is_tool = is_tool;
        write_event(
            out,
            "content_block_start",
            &json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        );
    }

    fn finalize(&mut self, out: &mut String) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if self.block_open {
            self.block_open = false;
            write_event(
                out,
                "content_block_stop",
                &json!({ "type": "content_block_stop", "index": self.block_index }),
            );
        }
        if self.started {
            write_event(out, "message_stop", &json!({ "type": "message_stop" }));
        }
    }
}

impl Default for OpenAiToAnthropicStream {
    fn default() -> Self {
        Self::new()
    }
}

fn write_event(out: &mut String, name: &str, data: &Value) {
    out.push_str("event: ");
    out.push_str(name);
    out.push_str("\ndata: ");
    out.push_str(&data.to_string());
    out.push_str("\n\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_frames(bytes: &Bytes) -> Vec<Value> {
        std::str::from_utf8(bytes)
            .unwrap()
            .split("\n\n")
            .filter_map(|frame| frame.strip_prefix("data: "))
            .filter(|data| *data != "[DONE]")
            .map(|data| serde_json::from_str(data).unwrap())
            .collect()
    }

    fn anthropic_frames(bytes: &Bytes) -> Vec<(String, Value)> {
        std::str::from_utf8(bytes)
            .unwrap()
            .split("\n\n")
            .filter(|frame| !frame.is_empty())
            .map(|frame| {
                let mut name = String::new();
                let mut data = Value::Null;
                for line in frame.lines() {
                    if let Some(v) = line.strip_prefix("event: ") {
                        name = v.to_string();
                    } else if let Some(v) = line.strip_prefix("data: ") {
                        data = serde_json::from_str(v).unwrap();
                    }
                }
                (name, data)
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Anthropic → OpenAI
    // -----------------------------------------------------------------------

    #[test]
    fn text_delta_and_message_stop_produce_content_finish_and_done() {
        let mut machine = AnthropicToOpenAiStream::new();
        let upstream = "event: content_block_delta\n\
                        data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hi\"}}\n\n\
                        event: message_stop\n\
                        data: {\"type\":\"message_stop\",\"stop_reason\":\"end_turn\"}\n\n";
        let output = machine.push(upstream.as_bytes());
        let text = std::str::from_utf8(&output).unwrap();

        let frames = openai_frames(&output);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["choices"][0]["delta"]["content"], "Hi");
        assert_eq!(frames[0]["choices"][0]["finish_reason"], Value::Null);
        assert_eq!(frames[1]["choices"][0]["finish_reason"], "stop");
        assert!(text.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn message_start_sets_id_and_model_and_emits_empty_delta() {
        let mut machine = AnthropicToOpenAiStream::new();
        let upstream = "event: message_start\n\
                        data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-x\"}}\n\n";
        let frames = openai_frames(&machine.push(upstream.as_bytes()));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["id"], "msg_1");
        assert_eq!(frames[0]["model"], "claude-x");
        assert_eq!(frames[0]["object"], "chat.completion.chunk");
        assert_eq!(frames[0]["choices"][0]["delta"], json!({}));
    }

    #[test]
    fn tool_use_block_start_and_json_delta_map_to_tool_call_chunks() {
        let mut machine = AnthropicToOpenAiStream::new();
        let upstream = "event: content_block_start\n\
                        data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"lookup\"}}\n\n\
                        event: content_block_delta\n\
                        data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"q\\\":\"}}\n\n";
        let frames = openai_frames(&machine.push(upstream.as_bytes()));
        assert_eq!(frames.len(), 2);

        let start = &frames[0]["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(start["id"], "toolu_1");
        assert_eq!(start["function"]["name"], "lookup");
        assert_eq!(start["function"]["arguments"], "");

        let delta = &frames[1]["choices"][0]["delta"]["tool_calls"][0];
        assert_eq!(delta["function"]["arguments"], "{\"q\":");
    }

    #[test]
    fn message_delta_stop_reason_maps_to_finish_reason() {
        let mut machine = AnthropicToOpenAiStream::new();
        let upstream = "event: message_delta\n\
                        data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"max_tokens\"}}\n\n";
        let frames = openai_frames(&machine.push(upstream.as_bytes()));
        assert_eq!(frames[0]["choices"][0]["finish_reason"], "length");
    }

    #[test]
    fn ping_events_are_suppressed() {
        let mut machine = AnthropicToOpenAiStream::new();
        let output = machine.push(b"event: ping\ndata: {\"type\":\"ping\"}\n\n");
        assert!(output.is_empty());
    }

    #[test]
    fn finish_terminates_stream_without_message_stop() {
        let mut machine = AnthropicToOpenAiStream::new();
        machine.push(
            b"event: content_block_delta\n\
              data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"x\"}}\n\n",
        );
        let tail = machine.finish();
        assert!(std::str::from_utf8(&tail).unwrap().ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn output_is_identical_when_fed_byte_by_byte() {
        let upstream = "event: message_start\n\
                        data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"model\":\"claude-x\"}}\n\n\
                        event: content_block_delta\n\
                        data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello\"}}\n\n\
                        event: message_stop\n\
                        data: {\"type\":\"message_stop\"}\n\n";

        let mut whole = AnthropicToOpenAiStream::new();
        let mut all_at_once = whole.push(upstream.as_bytes()).to_vec();
        all_at_once.extend_from_slice(&whole.finish());

        let mut split = AnthropicToOpenAiStream::new();
        let mut byte_at_a_time = Vec::new();
        for byte in upstream.as_bytes() {
            byte_at_a_time.extend_from_slice(&split.push(std::slice::from_ref(byte)));
        }
        byte_at_a_time.extend_from_slice(&split.finish());

        // `created` differs between the two machines; compare event shapes.
        let a = String::from_utf8(all_at_once).unwrap();
        let b = String::from_utf8(byte_at_a_time).unwrap();
        let strip = |s: &str| {
            s.lines()
                .map(|l| {
                    l.split(",\"created\":")
                        .next()
                        .unwrap_or(l)
                        .to_string()
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(&a), strip(&b));
        assert!(b.ends_with("data: [DONE]\n\n"));
    }

    #[test]
    fn nothing_after_done() {
        let mut machine = AnthropicToOpenAiStream::new();
        machine.push(b"data: {\"type\":\"message_stop\"}\n\n");
        let extra = machine.push(
            b"data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"late\"}}\n\n",
        );
        assert!(extra.is_empty());
    }

    // -----------------------------------------------------------------------
    // OpenAI → Anthropic
    // -----------------------------------------------------------------------

    #[test]
    fn first_chunk_synthesizes_prelude_from_its_model() {
        let mut machine = OpenAiToAnthropicStream::new();
        let upstream = "data: {\"id\":\"chatcmpl-1\",\"model\":\"gpt-4o\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Hi\"}}]}\n\n";
        let frames = anthropic_frames(&machine.push(upstream.as_bytes()));

        assert_eq!(frames[0].0, "message_start");
        assert_eq!(frames[0].1["message"]["model"], "gpt-4o");
        assert_eq!(frames[1].0, "content_block_start");
        assert_eq!(frames[1].1["content_block"]["type"], "text");
        assert_eq!(frames[2].0, "content_block_delta");
        assert_eq!(frames[2].1["delta"]["text"], "Hi");
    }

    #[test]
    fn finish_reason_emits_message_delta_with_mapped_stop_reason() {
        let mut machine = OpenAiToAnthropicStream::new();
        machine.push(b"data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        let frames = anthropic_frames(
            &machine.push(b"data: {\"choices\":[{\"delta\":{},\"finish_reason\":\"tool_calls\"}]}\n\n"),
        );
        let delta = frames.iter().find(|(n, _)| n == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn done_closes_block_then_stops_message() {
        let mut machine = OpenAiToAnthropicStream::new();
        machine.push(b"data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        let frames = anthropic_frames(&machine.push(b"data: [DONE]\n\n"));
        assert_eq!(frames[0].0, "content_block_stop");
        assert_eq!(frames[1].0, "message_stop");
    }

    #[test]
    fn tool_call_chunks_open_their_own_block() {
        let mut machine = OpenAiToAnthropicStream::new();
        let first = "data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"call_1\",\"function\":{\"name\":\"f\"}}]}}]}\n\n";
        let frames = anthropic_frames(&machine.push(first.as_bytes()));

        // Prelude text block is closed before the tool block opens.
        let names: Vec<&str> = frames.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "message_start",
                "content_block_start",
                "content_block_stop",
                "content_block_start",
            ]
        );
        let tool_start = &frames[3].1;
        assert_eq!(tool_start["content_block"]["type"], "tool_use");
        assert_eq!(tool_start["content_block"]["id"], "call_1");
        assert_eq!(tool_start["content_block"]["name"], "f");

        let args = "data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"function\":{\"arguments\":\"{\\\"a\\\":1}\"}}]}}]}\n\n";
        let frames = anthropic_frames(&machine.push(args.as_bytes()));
        assert_eq!(frames[0].0, "content_block_delta");
        assert_eq!(frames[0].1["delta"]["type"], "input_json_delta");
        assert_eq!(frames[0].1["delta"]["partial_json"], "{\"a\":1}");
    }

    #[test]
    fn every_block_start_gets_exactly_one_stop() {
        let mut machine = OpenAiToAnthropicStream::new();
        let mut all = Vec::new();
        all.extend(anthropic_frames(&machine.push(
            b"data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"t\"}}]}\n\n",
        )));
        all.extend(anthropic_frames(&machine.push(
            b"data: {\"choices\":[{\"delta\":{\"tool_calls\":[{\"index\":0,\"id\":\"c\",\"function\":{\"name\":\"f\"}}]}}]}\n\n",
        )));
        all.extend(anthropic_frames(&machine.push(b"data: [DONE]\n\n")));

        let starts = all.iter().filter(|(n, _)| n == "content_block_start").count();
        let stops = all.iter().filter(|(n, _)| n == "content_block_stop").count();
        assert_eq!(starts, stops);
        assert_eq!(all.last().unwrap().0, "message_stop");
    }

    #[test]
    fn eof_without_done_still_finalizes() {
        let mut machine = OpenAiToAnthropicStream::new();
        machine.push(b"data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        let frames = anthropic_frames(&machine.finish());
        assert!(frames.iter().any(|(n, _)| n == "message_stop"));
    }

    #[test]
    fn finalize_is_idempotent() {
        let mut machine = OpenAiToAnthropicStream::new();
        machine.push(b"data: {\"model\":\"m\",\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        machine.push(b"data: [DONE]\n\n");
        assert!(machine.finish().is_empty());
    }
}
