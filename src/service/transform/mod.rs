use serde_json::Value;

use crate::error::GatewayError;
use crate::schema::enum_def::ProviderType;
use crate::utils::billing::{estimate_tokens, TokenUsage};
use crate::utils::sse::SseEvent;

pub mod anthropic;
pub mod openai;

/// A validated client chat-completion request. `body` keeps the caller's
/// OpenAI-shaped JSON so unknown fields pass through to compatible upstreams.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub stream: bool,
    /// Whether the caller asked for the trailing usage chunk.
    pub include_usage: bool,
    pub body: Value,
}

impl ChatRequest {
    pub fn parse(raw: &[u8]) -> Result<Self, GatewayError> {
        let body: Value = serde_json::from_slice(raw).map_err(|e| {
            GatewayError::invalid_request(format!("We could not parse the JSON body of your request: {}", e))
        })?;
        Self::from_value(body)
    }

    pub fn from_value(body: Value) -> Result<Self, GatewayError> {
        let object = body
            .as_object()
            .ok_or_else(|| GatewayError::invalid_request("The request body must be a JSON object."))?;

        let model = match object.get("model").and_then(Value::as_str) {
            Some(model) if !model.trim().is_empty() => model.trim().to_string(),
            _ => return Err(GatewayError::missing_param("model")),
        };
        match object.get("messages").and_then(Value::as_array) {
            Some(messages) if !messages.is_empty() => {}
            _ => return Err(GatewayError::missing_param("messages")),
        }

        let stream = object.get("stream").and_then(Value::as_bool).unwrap_or(false);
        let include_usage = object
            .get("stream_options")
            .and_then(|o| o.get("include_usage"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(Self {
            model,
            stream,
            include_usage,
            body,
        })
    }

    pub fn messages(&self) -> &[Value] {
        self.body
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Prompt size guess for upstreams that report no usage.
    pub fn estimated_prompt_tokens(&self) -> i64 {
        let text: String = self
            .messages()
            .iter()
            .filter_map(|m| m.get("content"))
            .map(content_text)
            .collect::<Vec<_>>()
            .join("\n");
        estimate_tokens(&text)
    }
}

/// Plain text of an OpenAI `content` value (string or array of parts).
pub fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// A buffered completion already normalized to OpenAI shape.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatCompletion {
    pub body: Value,
    pub usage: Option<TokenUsage>,
}

/// One normalized stream element.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamFrame {
    /// An OpenAI `chat.completion.chunk` object.
    Chunk(Value),
    Done,
}

/// The closed set of upstream protocols the gateway speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderAdapter {
    OpenAi,
    Anthropic,
}

impl From<ProviderType> for ProviderAdapter {
    fn from(provider: ProviderType) -> Self {
        match provider {
            ProviderType::Openai => ProviderAdapter::OpenAi,
            ProviderType::Anthropic => ProviderAdapter::Anthropic,
        }
    }
}

impl ProviderAdapter {
    pub fn endpoint(&self, base_url: Option<&str>) -> String {
        match self {
            ProviderAdapter::OpenAi => openai::endpoint(base_url),
            ProviderAdapter::Anthropic => anthropic::endpoint(base_url),
        }
    }

    /// Request headers carrying the upstream credential.
    pub fn auth_headers(&self, credential: &str) -> Vec<(&'static str, String)> {
        match self {
            ProviderAdapter::OpenAi => vec![("authorization", format!("Bearer {}", credential))],
            ProviderAdapter::Anthropic => vec![
                ("x-api-key", credential.to_string()),
                ("anthropic-version", anthropic::API_VERSION.to_string()),
            ],
        }
    }

    pub fn build_request(&self, request: &ChatRequest, upstream_model: &str) -> Value {
        match self {
            ProviderAdapter::OpenAi => openai::build_request(request, upstream_model),
            ProviderAdapter::Anthropic => anthropic::build_request(request, upstream_model),
        }
    }

    pub fn parse_completion(&self, body: &[u8]) -> Result<ChatCompletion, String> {
        match self {
            ProviderAdapter::OpenAi => openai::parse_completion(body),
            ProviderAdapter::Anthropic => anthropic::parse_completion(body),
        }
    }

    pub fn stream_decoder(&self) -> StreamDecoder {
        match self {
            ProviderAdapter::OpenAi => StreamDecoder::OpenAi,
            ProviderAdapter::Anthropic => StreamDecoder::Anthropic(anthropic::AnthropicStreamState::default()),
        }
    }
}

/// Per-stream state turning upstream SSE events into OpenAI chunks.
#[derive(Debug)]
pub enum StreamDecoder {
    OpenAi,
    Anthropic(anthropic::AnthropicStreamState),
}

impl StreamDecoder {
    /// An `Err` is an upstream error reported inside the stream.
    pub fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamFrame>, String> {
        match self {
            StreamDecoder::OpenAi => openai::decode_event(event),
            StreamDecoder::Anthropic(state) => state.decode(event),
        }
    }
}

/// Replaces provider identity in a completion or chunk with the gateway's.
pub fn rewrite_identity(value: &mut Value, response_id: &str, model: &str) {
    if let Some(object) = value.as_object_mut() {
        object.insert("id".to_string(), Value::String(response_id.to_string()));
        object.insert("model".to_string(), Value::String(model.to_string()));
        object.remove("provider");
        object.remove("system_fingerprint");
    }
}

/// Whether a chunk only carries the trailing usage report.
pub fn is_usage_only_chunk(chunk: &Value) -> bool {
    let no_choices = chunk
        .get("choices")
        .and_then(Value::as_array)
        .is_none_or(|c| c.is_empty());
    no_choices && chunk.get("usage").is_some_and(Value::is_object)
}

/// Text produced by a chunk's deltas, used to estimate completion tokens.
pub fn chunk_delta_text(chunk: &Value) -> String {
    let mut text = String::new();
    if let Some(choices) = chunk.get("choices").and_then(Value::as_array) {
        for choice in choices {
            let Some(delta) = choice.get("delta") else { continue };
            for field in ["content", "reasoning_content"] {
                if let Some(s) = delta.get(field).and_then(Value::as_str) {
                    text.push_str(s);
                }
            }
            if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
                for call in calls {
                    if let Some(args) = call.pointer("/function/arguments").and_then(Value::as_str) {
                        text.push_str(args);
                    }
                }
            }
        }
    }
    text
}
