use std::collections::HashMap;

use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};

use super::openai::error_message;
use super::{content_text, ChatCompletion, ChatRequest, StreamFrame};
use crate::utils::billing::TokenUsage;
use crate::utils::sse::SseEvent;

pub(super) const API_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const DEFAULT_MAX_TOKENS: u64 = 4096;

pub(super) fn endpoint(base_url: Option<&str>) -> String {
    let base = base_url
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/');
    if base.ends_with("/messages") {
        base.to_string()
    } else {
        format!("{}/messages", base)
    }
}

// --- OpenAI request to Messages API ---

pub(super) fn build_request(request: &ChatRequest, upstream_model: &str) -> Value {
    let body = &request.body;
    let mut system_parts: Vec<String> = Vec::new();
    let mut messages: Vec<Value> = Vec::new();

    for message in request.messages() {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = message.get("content").unwrap_or(&Value::Null);
        match role {
            "system" | "developer" => {
                let text = content_text(content);
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "assistant" => {
                let mut blocks = Vec::new();
                let text = content_text(content);
                if !text.is_empty() {
                    blocks.push(json!({"type": "text", "text": text}));
                }
                if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
                    blocks.extend(calls.iter().map(tool_use_block));
                }
                push_message(&mut messages, "assistant", blocks);
            }
            "tool" => {
                let block = json!({
                    "type": "tool_result",
                    "tool_use_id": message.get("tool_call_id").and_then(Value::as_str).unwrap_or_default(),
                    "content": content_text(content),
                });
                push_message(&mut messages, "user", vec![block]);
            }
            _ => push_message(&mut messages, "user", user_blocks(content)),
        }
    }

    let max_tokens = body
        .get("max_tokens")
        .or_else(|| body.get("max_completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    let mut payload = json!({
        "model": upstream_model,
        "messages": messages,
        "max_tokens": max_tokens,
        "stream": request.stream,
    });
    let Some(object) = payload.as_object_mut() else {
        return payload;
    };

    if !system_parts.is_empty() {
        object.insert("system".to_string(), json!(system_parts.join("\n\n")));
    }
    for field in ["temperature", "top_p"] {
        if let Some(value) = body.get(field).filter(|v| v.is_number()) {
            object.insert(field.to_string(), value.clone());
        }
    }
    match body.get("stop") {
        Some(Value::String(stop)) => {
            object.insert("stop_sequences".to_string(), json!([stop]));
        }
        Some(Value::Array(stops)) if !stops.is_empty() => {
            object.insert("stop_sequences".to_string(), json!(stops));
        }
        _ => {}
    }
    if let Some(tools) = body.get("tools").and_then(Value::as_array) {
        let tools: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(json!("")),
                    "input_schema": function
                        .get("parameters")
                        .cloned()
                        .unwrap_or_else(|| json!({"type": "object", "properties": {}})),
                })
            })
            .collect();
        if !tools.is_empty() {
            object.insert("tools".to_string(), json!(tools));
        }
    }
    if let Some(choice) = body.get("tool_choice").and_then(tool_choice) {
        object.insert("tool_choice".to_string(), choice);
    }
    if let Some(user) = body.get("user").and_then(Value::as_str) {
        object.insert("metadata".to_string(), json!({"user_id": user}));
    }
    payload
}

// The Messages API wants alternating roles, so consecutive turns of the
// same role are merged into one message.
fn push_message(messages: &mut Vec<Value>, role: &str, blocks: Vec<Value>) {
    if blocks.is_empty() {
        return;
    }
    if let Some(last) = messages.last_mut() {
        if last.get("role").and_then(Value::as_str) == Some(role) {
            if let Some(content) = last.get_mut("content").and_then(Value::as_array_mut) {
                content.extend(blocks);
                return;
            }
        }
    }
    messages.push(json!({"role": role, "content": blocks}));
}

fn user_blocks(content: &Value) -> Vec<Value> {
    match content {
        Value::String(text) => vec![json!({"type": "text", "text": text})],
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| match part.get("type").and_then(Value::as_str) {
                Some("text") => part
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| json!({"type": "text", "text": text})),
                Some("image_url") => part
                    .pointer("/image_url/url")
                    .and_then(Value::as_str)
                    .map(image_block),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn image_block(url: &str) -> Value {
    // data:<media type>;base64,<payload>
    if let Some(rest) = url.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return json!({
                "type": "image",
                "source": {"type": "base64", "media_type": media_type, "data": data},
            });
        }
    }
    json!({"type": "image", "source": {"type": "url", "url": url}})
}

fn tool_use_block(call: &Value) -> Value {
    let arguments = call
        .pointer("/function/arguments")
        .and_then(Value::as_str)
        .unwrap_or("{}");
    let input: Value = serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
    json!({
        "type": "tool_use",
        "id": call.get("id").and_then(Value::as_str).unwrap_or_default(),
        "name": call.pointer("/function/name").and_then(Value::as_str).unwrap_or_default(),
        "input": input,
    })
}

fn tool_choice(choice: &Value) -> Option<Value> {
    match choice {
        Value::String(mode) => match mode.as_str() {
            "auto" => Some(json!({"type": "auto"})),
            "required" => Some(json!({"type": "any"})),
            _ => None,
        },
        Value::Object(_) => choice
            .pointer("/function/name")
            .and_then(Value::as_str)
            .map(|name| json!({"type": "tool", "name": name})),
        _ => None,
    }
}

// --- Messages API response to OpenAI ---

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    content: Vec<AnthropicContentBlock>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicContentBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: i64,
    #[serde(default)]
    output_tokens: i64,
    #[serde(default)]
    cache_creation_input_tokens: Option<i64>,
    #[serde(default)]
    cache_read_input_tokens: Option<i64>,
}

impl AnthropicUsage {
    fn prompt_tokens(&self) -> i64 {
        self.input_tokens
            + self.cache_creation_input_tokens.unwrap_or(0)
            + self.cache_read_input_tokens.unwrap_or(0)
    }
}

fn finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "tool_use" => "tool_calls",
        "max_tokens" => "length",
        "refusal" => "content_filter",
        _ => "stop",
    }
}

fn usage_json(usage: &TokenUsage) -> Value {
    json!({
        "prompt_tokens": usage.prompt_tokens,
        "completion_tokens": usage.completion_tokens,
        "total_tokens": usage.total(),
    })
}

pub(super) fn parse_completion(body: &[u8]) -> Result<ChatCompletion, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON from upstream: {}", e))?;
    if value.get("type").and_then(Value::as_str) == Some("error") {
        return Err(value.get("error").map(error_message).unwrap_or_else(|| value.to_string()));
    }
    let response: AnthropicResponse =
        serde_json::from_value(value).map_err(|e| format!("unexpected upstream response: {}", e))?;

    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();
    for block in response.content {
        match block {
            AnthropicContentBlock::Text { text: t } => text.push_str(&t),
            AnthropicContentBlock::Thinking { thinking } => reasoning.push_str(&thinking),
            AnthropicContentBlock::ToolUse { id, name, input } => tool_calls.push(json!({
                "id": id,
                "type": "function",
                "function": {"name": name, "arguments": input.to_string()},
            })),
            AnthropicContentBlock::Other => {}
        }
    }

    let mut message = json!({"role": "assistant", "content": text});
    if !reasoning.is_empty() {
        message["reasoning_content"] = json!(reasoning);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }

    let usage = TokenUsage::new(response.usage.prompt_tokens(), response.usage.output_tokens);
    let body = json!({
        "id": response.id,
        "object": "chat.completion",
        "created": Utc::now().timestamp(),
        "model": response.model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": response.stop_reason.as_deref().map(finish_reason),
        }],
        "usage": usage_json(&usage),
    });
    Ok(ChatCompletion {
        body,
        usage: Some(usage),
    })
}

// --- Messages API stream to OpenAI chunks ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicEvent {
    MessageStart {
        message: StreamMessage,
    },
    ContentBlockStart {
        index: u32,
        content_block: Value,
    },
    ContentBlockDelta {
        index: u32,
        delta: Value,
    },
    MessageDelta {
        #[serde(default)]
        delta: Value,
        #[serde(default)]
        usage: Option<AnthropicUsage>,
    },
    MessageStop,
    Error {
        error: Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StreamMessage {
    #[serde(default)]
    id: String,
    #[serde(default)]
    model: String,
    #[serde(default)]
    usage: AnthropicUsage,
}

#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    id: String,
    model: String,
    created: i64,
    prompt_tokens: i64,
    completion_tokens: i64,
    // content block index -> OpenAI tool call index
    tool_calls: HashMap<u32, usize>,
}

impl AnthropicStreamState {
    pub(super) fn decode(&mut self, event: &SseEvent) -> Result<Vec<StreamFrame>, String> {
        if event.data.trim().is_empty() {
            return Ok(Vec::new());
        }
        let parsed: AnthropicEvent = serde_json::from_str(&event.data)
            .map_err(|e| format!("invalid stream event from upstream: {}", e))?;

        let frames = match parsed {
            AnthropicEvent::MessageStart { message } => {
                self.id = message.id;
                self.model = message.model;
                self.created = Utc::now().timestamp();
                self.prompt_tokens = message.usage.prompt_tokens();
                self.completion_tokens = message.usage.output_tokens;
                vec![self.chunk(json!({"role": "assistant", "content": ""}), None)]
            }
            AnthropicEvent::ContentBlockStart { index, content_block } => {
                if content_block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return Ok(Vec::new());
                }
                let tool_index = self.tool_calls.len();
                self.tool_calls.insert(index, tool_index);
                let delta = json!({"tool_calls": [{
                    "index": tool_index,
                    "id": content_block.get("id").cloned().unwrap_or(Value::Null),
                    "type": "function",
                    "function": {
                        "name": content_block.get("name").cloned().unwrap_or(Value::Null),
                        "arguments": "",
                    },
                }]});
                vec![self.chunk(delta, None)]
            }
            AnthropicEvent::ContentBlockDelta { index, delta } => {
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(Value::as_str).unwrap_or_default();
                        vec![self.chunk(json!({"content": text}), None)]
                    }
                    Some("thinking_delta") => {
                        let text = delta.get("thinking").and_then(Value::as_str).unwrap_or_default();
                        vec![self.chunk(json!({"reasoning_content": text}), None)]
                    }
                    Some("input_json_delta") => match self.tool_calls.get(&index) {
                        Some(tool_index) => {
                            let partial = delta.get("partial_json").and_then(Value::as_str).unwrap_or_default();
                            let delta = json!({"tool_calls": [{
                                "index": tool_index,
                                "function": {"arguments": partial},
                            }]});
                            vec![self.chunk(delta, None)]
                        }
                        None => Vec::new(),
                    },
                    _ => Vec::new(),
                }
            }
            AnthropicEvent::MessageDelta { delta, usage } => {
                if let Some(usage) = usage {
                    self.completion_tokens = usage.output_tokens;
                    if usage.input_tokens > 0 {
                        self.prompt_tokens = usage.prompt_tokens();
                    }
                }
                match delta.get("stop_reason").and_then(Value::as_str) {
                    Some(reason) => vec![self.chunk(json!({}), Some(finish_reason(reason)))],
                    None => Vec::new(),
                }
            }
            AnthropicEvent::MessageStop => {
                let usage = TokenUsage::new(self.prompt_tokens, self.completion_tokens);
                let mut chunk = self.chunk_value(Value::Null, None);
                chunk["choices"] = json!([]);
                chunk["usage"] = usage_json(&usage);
                vec![StreamFrame::Chunk(chunk), StreamFrame::Done]
            }
            AnthropicEvent::Error { error } => return Err(error_message(&error)),
            AnthropicEvent::Other => Vec::new(),
        };
        Ok(frames)
    }

    fn chunk_value(&self, delta: Value, finish_reason: Option<&str>) -> Value {
        json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{"index": 0, "delta": delta, "finish_reason": finish_reason}],
        })
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> StreamFrame {
        StreamFrame::Chunk(self.chunk_value(delta, finish_reason))
    }
}
