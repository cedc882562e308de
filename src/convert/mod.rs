//! Dialect translation between OpenAI chat completions and Anthropic
//! messages.
//!
//! One component, four unary entry points (request and response, each
//! direction) plus two streaming state machines. All conversion is pure:
//! nothing here touches the network or any shared state, which keeps the
//! whole surface unit-testable without a server.

pub mod request;
pub mod response;
pub mod schema;
pub mod sse;
pub mod stream;

pub use stream::{AnthropicToOpenAiStream, OpenAiToAnthropicStream};

/// Hard conversion failures. These fail the current attempt (the candidate is
/// skipped) rather than the whole request.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConvertError {
    #[error("tool message is missing tool_call_id")]
    MissingToolCallId,

    #[error("tool call `{0}` carries unparseable arguments: {1}")]
    InvalidToolArguments(String, String),

    #[error("request is missing required field `{0}`")]
    MissingField(&'static str),

    #[error("upstream response body is not a JSON object")]
    MalformedResponse,
}

/// Where the Anthropic `max_tokens` value came from. Recorded per conversion
/// for logging — quota bugs almost always trace back to this resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxTokensSource {
    MaxTokens,
    MaxCompletionTokens,
    Default,
}

impl MaxTokensSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MaxTokens => "max_tokens",
            Self::MaxCompletionTokens => "max_completion_tokens",
            Self::Default => "default",
        }
    }
}

/// Metadata describing the most recent request conversion.
#[derive(Debug, Clone)]
pub struct ConvertMeta {
    pub max_tokens: u64,
    pub max_tokens_source: MaxTokensSource,
    pub tool_count: usize,
    pub stream: bool,
}
