//! Request-body translation between the OpenAI chat-completions dialect and
//! the Anthropic messages dialect.
//!
//! Both directions operate on raw [`serde_json::Value`] trees rather than
//! typed structs: the relay must tolerate fields it has never heard of, and
//! a proxy that silently drops unknown extensions is worse than one that
//! forwards them. Only the fields whose shapes differ between dialects are
//! rewritten.

use serde_json::{json, Map, Value};

use super::schema::sanitize_schema;
use super::{ConvertError, ConvertMeta, MaxTokensSource};

/// Fallback `max_tokens` when the OpenAI request carries neither
/// `max_tokens` nor `max_completion_tokens`. Anthropic requires the field.
pub const DEFAULT_MAX_TOKENS: u64 = 4096;

/// Convert an OpenAI chat-completions request body to an Anthropic messages
/// request body.
pub fn openai_to_anthropic(body: &Value) -> Result<(Value, ConvertMeta), ConvertError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(ConvertError::MissingField("model"))?;

    let (max_tokens, max_tokens_source) = resolve_max_tokens(body);

    let raw_messages = body
        .get("messages")
        .and_then(Value::as_array)
        .ok_or(ConvertError::MissingField("messages"))?;

    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::with_capacity(raw_messages.len());
    let mut saw_tool_calls = false;

    for message in raw_messages {
        match message.get("role").and_then(Value::as_str) {
            Some("system") | Some("developer") => {
                if let Some(text) = text_content(message.get("content")) {
                    system_parts.push(text);
                }
            }
            Some("tool") => messages.push(map_tool_message(message)?),
            Some("assistant")
                if message
                    .get("tool_calls")
                    .and_then(Value::as_array)
                    .is_some_and(|calls| !calls.is_empty()) =>
            {
                saw_tool_calls = true;
                messages.push(map_assistant_tool_calls(message)?);
            }
            _ => match message.get("content") {
                // Multimodal part lists need their blocks reshaped.
                Some(Value::Array(parts)) => {
                    let mut mapped = message.clone();
                    if let Some(object) = mapped.as_object_mut() {
                        object.insert("content".to_string(), map_content_parts(parts));
                    }
                    messages.push(mapped);
                }
                _ => messages.push(message.clone()),
            },
        }
    }

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert("max_tokens".to_string(), json!(max_tokens));
    out.insert("messages".to_string(), Value::Array(messages));

    if !system_parts.is_empty() {
        out.insert("system".to_string(), Value::String(system_parts.join("\n\n")));
    }

    if let Some(sequences) = map_stop_sequences(body.get("stop")) {
        out.insert("stop_sequences".to_string(), json!(sequences));
    }

    for field in ["temperature", "top_p", "stream"] {
        if let Some(value) = body.get(field) {
            out.insert(field.to_string(), value.clone());
        }
    }

    let mut tool_count = 0;
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools.iter().map(map_tool_definition).collect();
        tool_count = mapped.len();
        if !mapped.is_empty() {
            out.insert("tools".to_string(), Value::Array(mapped));
        }
    }

    // Anthropic refuses tool_use blocks in history without a matching tool
    // definition; a placeholder keeps replayed conversations valid.
    if saw_tool_calls && !out.contains_key("tools") {
        tool_count = 1;
        out.insert(
            "tools".to_string(),
            json!([{
                "name": "unspecified_tool",
                "description": "Placeholder for tool calls referenced by earlier messages.",
                "input_schema": { "type": "object", "properties": {} },
            }]),
        );
    }

    let parallel_disabled = body.get("parallel_tool_calls") == Some(&Value::Bool(false));
    if let Some(choice) = map_tool_choice(body.get("tool_choice"), parallel_disabled) {
        out.insert("tool_choice".to_string(), choice);
    }

    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    Ok((
        Value::Object(out),
        ConvertMeta {
            max_tokens,
            max_tokens_source,
            tool_count,
            stream,
        },
    ))
}

/// Convert an Anthropic messages request body to an OpenAI chat-completions
/// request body.
pub fn anthropic_to_openai(body: &Value) -> Result<(Value, ConvertMeta), ConvertError> {
    let model = body
        .get("model")
        .and_then(Value::as_str)
        .ok_or(ConvertError::MissingField("model"))?;

    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = body.get("system") {
        if let Some(text) = system_text(system) {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for message in body.get("messages").and_then(Value::as_array).into_iter().flatten() {
        messages.extend(unmap_message(message)?);
    }

    let mut out = Map::new();
    out.insert("model".to_string(), Value::String(model.to_string()));
    out.insert("messages".to_string(), Value::Array(messages));

    for field in ["max_tokens", "temperature", "top_p", "stream"] {
        if let Some(value) = body.get(field) {
            out.insert(field.to_string(), value.clone());
        }
    }

    if let Some(sequences) = body.get("stop_sequences").and_then(Value::as_array) {
        if !sequences.is_empty() {
            out.insert("stop".to_string(), Value::Array(sequences.clone()));
        }
    }

    let mut tool_count = 0;
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.get("name").cloned().unwrap_or(Value::Null),
                        "description": tool.get("description").cloned().unwrap_or(Value::Null),
                        "parameters": tool.get("input_schema").cloned()
                            .unwrap_or_else(|| json!({ "type": "object", "properties": {} })),
                    },
                })
            })
            .collect();
        tool_count = mapped.len();
        if !mapped.is_empty() {
            out.insert("tools".to_string(), Value::Array(mapped));
        }
    }

    if let Some(choice) = body.get("tool_choice") {
        if choice.get("disable_parallel_tool_use") == Some(&Value::Bool(true)) {
            out.insert("parallel_tool_calls".to_string(), Value::Bool(false));
        }
        match choice.get("type").and_then(Value::as_str) {
            Some("auto") => {
                out.insert("tool_choice".to_string(), json!("auto"));
            }
            Some("any") => {
                out.insert("tool_choice".to_string(), json!("required"));
            }
            Some("none") => {
                out.insert("tool_choice".to_string(), json!("none"));
            }
            Some("tool") => {
                if let Some(name) = choice.get("name") {
                    out.insert(
                        "tool_choice".to_string(),
                        json!({ "type": "function", "function": { "name": name } }),
                    );
                }
            }
            _ => {}
        }
    }

    let max_tokens = body.get("max_tokens").and_then(Value::as_u64).unwrap_or(0);
    let stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);

    Ok((
        Value::Object(out),
        ConvertMeta {
            max_tokens,
            max_tokens_source: MaxTokensSource::MaxTokens,
            tool_count,
            stream,
        },
    ))
}

// ──────────────────────────────────────────────────────────────────────────────
// OpenAI → Anthropic pieces
// ──────────────────────────────────────────────────────────────────────────────

/// `max_tokens` resolution order: explicit field (integer or float literal),
/// then `max_completion_tokens`, then the default.
fn resolve_max_tokens(body: &Value) -> (u64, MaxTokensSource) {
    if let Some(value) = numeric_field(body.get("max_tokens")) {
        return (value, MaxTokensSource::MaxTokens);
    }
    if let Some(value) = numeric_field(body.get("max_completion_tokens")) {
        return (value, MaxTokensSource::MaxCompletionTokens);
    }
    (DEFAULT_MAX_TOKENS, MaxTokensSource::Default)
}

fn numeric_field(value: Option<&Value>) -> Option<u64> {
    let value = value?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
}

/// `stop` accepts a bare string or an array; whitespace-only entries are
/// dropped and an empty net result omits the field entirely.
fn map_stop_sequences(stop: Option<&Value>) -> Option<Vec<String>> {
    let collected: Vec<String> = match stop? {
        Value::String(single) => vec![single.clone()],
        Value::Array(values) => values
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => return None,
    };

    let kept: Vec<String> = collected
        .into_iter()
        .filter(|s| !s.trim().is_empty())
        .collect();
    (!kept.is_empty()).then_some(kept)
}

/// A `tool` role message becomes a user message holding one `tool_result`
/// block. The correlation id is mandatory — without it Anthropic cannot match
/// the result to its call, so this is a hard conversion failure.
fn map_tool_message(message: &Value) -> Result<Value, ConvertError> {
    let tool_call_id = message
        .get("tool_call_id")
        .and_then(Value::as_str)
        .ok_or(ConvertError::MissingToolCallId)?;
    let content = text_content(message.get("content")).unwrap_or_default();

    Ok(json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": tool_call_id,
            "content": content,
        }],
    }))
}

/// An assistant message carrying `tool_calls` becomes a block list: text
/// first (when present), then one `tool_use` block per call.
fn map_assistant_tool_calls(message: &Value) -> Result<Value, ConvertError> {
    let mut blocks: Vec<Value> = Vec::new();

    if let Some(text) = text_content(message.get("content")).filter(|t| !t.is_empty()) {
        blocks.push(json!({ "type": "text", "text": text }));
    }

    for call in message
        .get("tool_calls")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
        let function = call.get("function");
        let name = function
            .and_then(|f| f.get("name"))
            .and_then(Value::as_str)
            .unwrap_or_default();
        let arguments = function
            .and_then(|f| f.get("arguments"))
            .and_then(Value::as_str)
            .unwrap_or_default();

        let input = if arguments.trim().is_empty() {
            json!({})
        } else {
            serde_json::from_str(arguments).map_err(|e| {
                ConvertError::InvalidToolArguments(id.to_string(), e.to_string())
            })?
        };

        blocks.push(json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }));
    }

    Ok(json!({ "role": "assistant", "content": blocks }))
}

fn map_tool_definition(tool: &Value) -> Value {
    let function = tool.get("function").unwrap_or(tool);
    json!({
        "name": function.get("name").cloned().unwrap_or(Value::Null),
        "description": function.get("description").cloned().unwrap_or(Value::Null),
        "input_schema": sanitize_schema(function.get("parameters")),
    })
}

/// OpenAI tool_choice → Anthropic tool_choice, folding in
/// `parallel_tool_calls: false` as `disable_parallel_tool_use`.
fn map_tool_choice(choice: Option<&Value>, parallel_disabled: bool) -> Option<Value> {
    let mapped = match choice {
        Some(Value::String(mode)) => match mode.as_str() {
            "auto" => Some(json!({ "type": "auto" })),
            "required" => Some(json!({ "type": "any" })),
            // "none" drops the field; Anthropic's default is auto anyway.
            _ => None,
        },
        Some(Value::Object(object)) => object
            .get("function")
            .and_then(|f| f.get("name"))
            .cloned()
            .map(|name| json!({ "type": "tool", "name": name })),
        _ => None,
    };

    match (mapped, parallel_disabled) {
        (Some(mut value), true) => {
            if let Some(object) = value.as_object_mut() {
                object.insert("disable_parallel_tool_use".to_string(), Value::Bool(true));
            }
            Some(value)
        }
        (Some(value), false) => Some(value),
        (None, true) => Some(json!({ "type": "auto", "disable_parallel_tool_use": true })),
        (None, false) => None,
    }
}

/// OpenAI content parts → Anthropic content blocks.
///
/// Text parts map directly. Image parts carrying a `data:` URL become
/// base64 image sources; anything else stays a URL source. Unknown part
/// kinds are dropped rather than forwarded — Anthropic rejects the whole
/// request on an unrecognized block type.
fn map_content_parts(parts: &[Value]) -> Value {
    let mut blocks: Vec<Value> = Vec::with_capacity(parts.len());

    for part in parts {
        match part.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = part.get("text").and_then(Value::as_str) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
            }
            Some("image_url") => {
                let Some(url) = part
                    .get("image_url")
                    .and_then(|i| i.get("url"))
                    .and_then(Value::as_str)
                else {
                    continue;
                };
                let source = match parse_data_url(url) {
                    Some((media_type, data)) => json!({
                        "type": "base64",
                        "media_type": media_type,
                        "data": data,
                    }),
                    None => json!({ "type": "url", "url": url }),
                };
                blocks.push(json!({ "type": "image", "source": source }));
            }
            _ => {}
        }
    }

    Value::Array(blocks)
}

/// Split `data:<mime>;base64,<payload>` into its mime type and payload.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

/// Extract plain text from an OpenAI message content field, which may be a
/// string or an array of typed parts.
fn text_content(content: Option<&Value>) -> Option<String> {
    match content? {
        Value::String(text) => Some(text.clone()),
        Value::Array(parts) => {
            let texts: Vec<&str> = parts
                .iter()
                .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n"))
        }
        _ => None,
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Anthropic → OpenAI pieces
// ──────────────────────────────────────────────────────────────────────────────

/// The Anthropic `system` field is a string or a list of text blocks.
fn system_text(system: &Value) -> Option<String> {
    match system {
        Value::String(text) => Some(text.clone()),
        Value::Array(blocks) => {
            let texts: Vec<&str> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .collect();
            (!texts.is_empty()).then(|| texts.join("\n\n"))
        }
        _ => None,
    }
}

/// One Anthropic message may fan out into several OpenAI messages:
/// `tool_result` blocks become individual `tool` role messages, remaining
/// text and `tool_use` blocks fold back into a single message.
fn unmap_message(message: &Value) -> Result<Vec<Value>, ConvertError> {
    let role = message.get("role").and_then(Value::as_str).unwrap_or("user");

    let blocks = match message.get("content") {
        Some(Value::Array(blocks)) => blocks,
        Some(other) => return Ok(vec![json!({ "role": role, "content": other.clone() })]),
        None => return Ok(Vec::new()),
    };

    let mut out = Vec::new();
    let mut texts: Vec<&str> = Vec::new();
    let mut images: Vec<Value> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block.get("type").and_then(Value::as_str) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(Value::as_str) {
                    texts.push(text);
                }
            }
            Some("image") => {
                if let Some(part) = unmap_image_block(block) {
                    images.push(part);
                }
            }
            Some("tool_use") => {
                let arguments = block
                    .get("input")
                    .map(|input| serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()))
                    .unwrap_or_else(|| "{}".to_string());
                tool_calls.push(json!({
                    "id": block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": arguments,
                    },
                }));
            }
            Some("tool_result") => {
                let tool_use_id = block
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .ok_or(ConvertError::MissingToolCallId)?;
                out.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_use_id,
                    "content": tool_result_text(block.get("content")),
                }));
            }
            _ => {}
        }
    }

    if !texts.is_empty() || !images.is_empty() || !tool_calls.is_empty() {
        let mut msg = Map::new();
        msg.insert("role".to_string(), Value::String(role.to_string()));
        if !images.is_empty() {
            // Mixed media forces the parts representation.
            let mut parts: Vec<Value> = texts
                .iter()
                .map(|text| json!({ "type": "text", "text": text }))
                .collect();
            parts.append(&mut images);
            msg.insert("content".to_string(), Value::Array(parts));
        } else if texts.is_empty() {
            msg.insert("content".to_string(), Value::Null);
        } else {
            msg.insert("content".to_string(), Value::String(texts.join("\n")));
        }
        if !tool_calls.is_empty() {
            msg.insert("tool_calls".to_string(), Value::Array(tool_calls));
        }
        out.push(Value::Object(msg));
    }

    Ok(out)
}

/// Anthropic image block → OpenAI image_url part. Base64 sources are
/// re-wrapped as data URLs; URL sources pass straight through.
fn unmap_image_block(block: &Value) -> Option<Value> {
    let source = block.get("source")?;
    let url = match source.get("type").and_then(Value::as_str) {
        Some("base64") => {
            let media_type = source.get("media_type").and_then(Value::as_str)?;
            let data = source.get("data").and_then(Value::as_str)?;
            format!("data:{media_type};base64,{data}")
        }
        Some("url") => source.get("url").and_then(Value::as_str)?.to_string(),
        _ => return None,
    };
    Some(json!({ "type": "image_url", "image_url": { "url": url } }))
}

/// tool_result content may be a bare string or a list of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}
