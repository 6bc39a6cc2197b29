use serde_json::{json, Value};

use super::{ChatCompletion, ChatRequest, StreamFrame};
use crate::utils::billing::TokenUsage;
use crate::utils::sse::SseEvent;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// `base_url` is the API root (e.g. `https://host/v1`); a full
/// `/chat/completions` URL is accepted as-is.
pub(super) fn endpoint(base_url: Option<&str>) -> String {
    let base = base_url
        .map(str::trim)
        .filter(|b| !b.is_empty())
        .unwrap_or(DEFAULT_BASE_URL)
        .trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else {
        format!("{}/chat/completions", base)
    }
}

/// Forwards the caller's body with the upstream model name. Streams always
/// ask for the usage chunk so settlement sees real token counts.
pub(super) fn build_request(request: &ChatRequest, upstream_model: &str) -> Value {
    let mut body = request.body.clone();
    if let Some(object) = body.as_object_mut() {
        object.insert("model".to_string(), json!(upstream_model));
        if request.stream {
            let options = object
                .entry("stream_options")
                .or_insert_with(|| json!({}));
            if !options.is_object() {
                *options = json!({});
            }
            if let Some(options) = options.as_object_mut() {
                options.insert("include_usage".to_string(), json!(true));
            }
        }
    }
    body
}

pub(super) fn parse_completion(body: &[u8]) -> Result<ChatCompletion, String> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| format!("invalid JSON from upstream: {}", e))?;
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(error_message(error));
    }
    if !value.get("choices").is_some_and(Value::is_array) {
        return Err("upstream response has no choices".to_string());
    }
    let usage = value.get("usage").and_then(TokenUsage::from_openai_usage);
    Ok(ChatCompletion { body: value, usage })
}

pub(super) fn decode_event(event: &SseEvent) -> Result<Vec<StreamFrame>, String> {
    if event.is_done() {
        return Ok(vec![StreamFrame::Done]);
    }
    if event.data.trim().is_empty() {
        return Ok(Vec::new());
    }
    let value: Value = serde_json::from_str(&event.data)
        .map_err(|e| format!("invalid stream chunk from upstream: {}", e))?;
    if let Some(error) = value.get("error").filter(|e| !e.is_null()) {
        return Err(error_message(error));
    }
    Ok(vec![StreamFrame::Chunk(value)])
}

pub(crate) fn error_message(error: &Value) -> String {
    error
        .get("message")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        assert_eq!(endpoint(None), "https://api.openai.com/v1/chat/completions");
        assert_eq!(
            endpoint(Some("https://relay.example.com/api/v1/")),
            "https://relay.example.com/api/v1/chat/completions"
        );
        assert_eq!(
            endpoint(Some("http://127.0.0.1:9/v1/chat/completions")),
            "http://127.0.0.1:9/v1/chat/completions"
        );
    }

    #[test]
    fn test_build_request_sets_model_and_usage() {
        let request = ChatRequest::from_value(json!({
            "model": "gpt-4o-mini",
            "stream": true,
            "temperature": 0.2,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap();

        let body = build_request(&request, "openai/gpt-4o-mini");
        assert_eq!(body["model"], "openai/gpt-4o-mini");
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["temperature"], 0.2);
        assert!(!request.include_usage);
    }

    #[test]
    fn test_parse_completion() {
        let completion = parse_completion(
            br#"{"id":"x","choices":[{"index":0,"message":{"role":"assistant","content":"hi"}}],
                "usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(completion.usage, Some(TokenUsage::new(9, 3)));

        let err = parse_completion(br#"{"error":{"message":"overloaded"}}"#).unwrap_err();
        assert_eq!(err, "overloaded");
        assert!(parse_completion(b"<html>").is_err());
    }

    #[test]
    fn test_decode_event() {
        let frames = decode_event(&SseEvent::data(r#"{"choices":[{"delta":{"content":"a"}}]}"#)).unwrap();
        assert!(matches!(&frames[..], [StreamFrame::Chunk(_)]));
        assert_eq!(decode_event(&SseEvent::data("[DONE]")).unwrap(), vec![StreamFrame::Done]);
        assert!(decode_event(&SseEvent::data(r#"{"error":{"message":"boom"}}"#)).is_err());
    }
}
