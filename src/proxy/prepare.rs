//! Per-candidate body preparation.
//!
//! Same-dialect candidates get the lightest possible touch: when the inbound
//! `model` field already names the upstream model, the original bytes are
//! forwarded untouched (whitespace and field order preserved); otherwise only
//! the model field is rewritten. Cross-dialect candidates go through the full
//! converter, then the model swap.

use bytes::Bytes;
use serde_json::Value;

use crate::config::Dialect;
use crate::convert::{self, ConvertError, MaxTokensSource};
use crate::resolver::Candidate;

/// The payload for one upstream attempt, plus what was done to produce it.
pub struct PreparedBody {
    pub bytes: Bytes,
    pub meta: PrepareMeta,
}

/// Logging record for one preparation.
#[derive(Debug, Clone)]
pub struct PrepareMeta {
    pub original_bytes: usize,
    pub prepared_bytes: usize,
    pub converted: bool,
    /// Present only when the target dialect required max_tokens resolution.
    pub max_tokens_source: Option<MaxTokensSource>,
    pub tool_count: usize,
    pub stream: bool,
}

/// Build the byte payload to send to `candidate`.
pub fn prepare(
    original: &Bytes,
    parsed: &Value,
    inbound: Dialect,
    candidate: &Candidate,
) -> Result<PreparedBody, ConvertError> {
    let stream = parsed.get("stream").and_then(Value::as_bool).unwrap_or(false);

    if inbound == candidate.dialect {
        let inbound_model = parsed.get("model").and_then(Value::as_str);
        if inbound_model == Some(candidate.model.as_str()) {
            return Ok(PreparedBody {
                bytes: original.clone(),
                meta: PrepareMeta {
                    original_bytes: original.len(),
                    prepared_bytes: original.len(),
                    converted: false,
                    max_tokens_source: None,
                    tool_count: 0,
                    stream,
                },
            });
        }

        let mut body = parsed.clone();
        set_model(&mut body, &candidate.model);
        let bytes = Bytes::from(body.to_string());
        return Ok(PreparedBody {
            meta: PrepareMeta {
                original_bytes: original.len(),
                prepared_bytes: bytes.len(),
                converted: false,
                max_tokens_source: None,
                tool_count: 0,
                stream,
            },
            bytes,
        });
    }

    let (mut body, meta) = match (inbound, candidate.dialect) {
        (Dialect::OpenAI, Dialect::Anthropic) => convert::request::openai_to_anthropic(parsed)?,
        (Dialect::Anthropic, Dialect::OpenAI) => convert::request::anthropic_to_openai(parsed)?,
        // Same-dialect pairs are handled above.
        _ => unreachable!("cross-dialect conversion with equal dialects"),
    };
    set_model(&mut body, &candidate.model);

    let bytes = Bytes::from(body.to_string());
    Ok(PreparedBody {
        meta: PrepareMeta {
            original_bytes: original.len(),
            prepared_bytes: bytes.len(),
            converted: true,
            max_tokens_source: Some(meta.max_tokens_source),
            tool_count: meta.tool_count,
            stream: meta.stream || stream,
        },
        bytes,
    })
}

fn set_model(body: &mut Value, model: &str) {
    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_string(), Value::String(model.to_string()));
    }
}
