//! Response emission: copying a settled upstream response back to the
//! client, or re-framing a live stream.
//!
//! By the time anything here runs the attempt loop has committed to this
//! upstream — the first byte written closes the failover window, so emission
//! never makes routing decisions.

use std::convert::Infallible;

use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, StatusCode},
    response::Response,
};
use bytes::Bytes;
use futures_util::{future, stream, StreamExt};
use serde_json::Value;
use tracing::warn;

use crate::config::Dialect;
use crate::convert::{self, AnthropicToOpenAiStream, OpenAiToAnthropicStream};

/// Headers that never cross a proxy hop, plus framing headers the relay
/// recomputes itself.
const SKIPPED: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

/// Build the client response for a fully-read unary upstream reply,
/// converting the body when the candidate spoke a different dialect than the
/// client.
pub fn unary(
    status: StatusCode,
    upstream_headers: &HeaderMap,
    body: Bytes,
    inbound: Dialect,
    upstream: Dialect,
) -> Response {
    let body = if inbound != upstream && status.is_success() {
        convert_unary_body(&body, inbound, upstream).unwrap_or(body)
    } else {
        body
    };

    let mut response = Response::builder().status(status);
    if let Some(headers) = response.headers_mut() {
        copy_headers(upstream_headers, headers);
        if inbound != upstream {
            // The re-serialized body no longer matches upstream encoding hints.
            headers.remove("content-encoding");
            headers.insert("content-type", HeaderValue::from_static("application/json"));
        }
    }
    response.body(Body::from(body)).unwrap_or_else(|_| {
        // Only reachable with an invalid status from upstream, which reqwest
        // has already rejected.
        Response::new(Body::empty())
    })
}

fn convert_unary_body(body: &Bytes, inbound: Dialect, upstream: Dialect) -> Option<Bytes> {
    let parsed: Value = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "upstream 2xx body is not JSON; passing through unconverted");
            return None;
        }
    };
    let converted = match (upstream, inbound) {
        (Dialect::Anthropic, Dialect::OpenAI) => convert::response::anthropic_to_openai(&parsed),
        (Dialect::OpenAI, Dialect::Anthropic) => convert::response::openai_to_anthropic(&parsed),
        _ => return None,
    };
    match converted {
        Ok(value) => Some(Bytes::from(value.to_string())),
        Err(error) => {
            warn!(%error, "response conversion failed; passing through unconverted");
            None
        }
    }
}

/// Wrap a live upstream SSE body for the client, re-framing events when the
/// dialects differ.
///
/// An upstream read error mid-stream terminates the client stream — headers
/// are long gone, so there is nothing else to report.
pub fn stream(upstream_response: reqwest::Response, inbound: Dialect, upstream: Dialect) -> Response {
    let status = upstream_response.status();
    let mut response = Response::builder().status(status);

    if let Some(headers) = response.headers_mut() {
        copy_headers(upstream_response.headers(), headers);
        headers.insert("content-type", HeaderValue::from_static("text/event-stream"));
        headers.insert("cache-control", HeaderValue::from_static("no-cache"));
        headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    }

    let reframer = Reframer::for_dialects(inbound, upstream);
    let body_stream = upstream_response
        .bytes_stream()
        .map(Some)
        .chain(stream::once(future::ready(None)))
        .scan(reframer, |reframer, item| {
            let out = match item {
                Some(Ok(chunk)) => Some(Ok::<_, Infallible>(reframer.push(&chunk))),
                Some(Err(error)) => {
                    warn!(%error, "upstream stream failed mid-body; terminating client stream");
                    None
                }
                None => Some(Ok(reframer.finish())),
            };
            future::ready(out)
        })
        .filter(|item| future::ready(!matches!(item, Ok(bytes) if bytes.is_empty())));

    response
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}

/// Direction-specific stream transform. Passthrough is the no-op arm so the
/// emission path is identical for all three cases.
enum Reframer {
    Passthrough,
    AnthropicToOpenAi(Box<AnthropicToOpenAiStream>),
    OpenAiToAnthropic(Box<OpenAiToAnthropicStream>),
}

impl Reframer {
    fn for_dialects(inbound: Dialect, upstream: Dialect) -> Self {
        match (upstream, inbound) {
            (Dialect::Anthropic, Dialect::OpenAI) => {
                Self::AnthropicToOpenAi(Box::new(AnthropicToOpenAiStream::new()))
            }
            (Dialect::OpenAI, Dialect::Anthropic) => {
                Self::OpenAiToAnthropic(Box::new(OpenAiToAnthropicStream::new()))
            }
            _ => Self::Passthrough,
        }
    }

    fn push(&mut self, chunk: &Bytes) -> Bytes {
        match self {
            Self::Passthrough => chunk.clone(),
            Self::AnthropicToOpenAi(machine) => machine.push(chunk),
            Self::OpenAiToAnthropic(machine) => machine.push(chunk),
        }
    }

    fn finish(&mut self) -> Bytes {
        match self {
            Self::Passthrough => Bytes::new(),
            Self::AnthropicToOpenAi(machine) => machine.finish(),
            Self::OpenAiToAnthropic(machine) => machine.finish(),
        }
    }
}

fn copy_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if SKIPPED.contains(&name.as_str()) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}
