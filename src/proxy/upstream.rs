use std::io::Read;

use async_trait::async_trait;
use axum::body::Bytes;
use cyder_tools::log::{debug, error};
use flate2::read::GzDecoder;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::{Proxy, StatusCode};
use serde_json::Value;
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::database::channel::RoutableChannel;
use crate::error::BaseError;
use crate::service::transform::{ChatCompletion, ChatRequest, ProviderAdapter, StreamDecoder, StreamFrame};
use crate::utils::crypto::SecretCipher;
use crate::utils::sse::SseParser;

pub type FrameStream = BoxStream<'static, Result<StreamFrame, UpstreamError>>;

/// A successful upstream answer, already normalized to OpenAI shape.
pub enum UpstreamReply {
    Complete(ChatCompletion),
    Stream(FrameStream),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Network,
    Timeout,
    Status,
    InvalidResponse,
    /// The channel's stored credential could not be decrypted.
    Credential,
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    pub status: Option<StatusCode>,
    pub message: String,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            kind: UpstreamErrorKind::Status,
            status: Some(status),
            message: message.into(),
        }
    }

    /// The upstream refused the request body itself (400, 413, 422), so
    /// every other channel would refuse it too.
    pub fn rejects_content(&self) -> bool {
        self.kind == UpstreamErrorKind::Status
            && self.status.is_some_and(|s| {
                matches!(
                    s,
                    StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE | StatusCode::UNPROCESSABLE_ENTITY
                )
            })
    }

    /// Whether the failover loop may try the next channel. Anything but a
    /// content rejection is a fault of the channel (revoked credential,
    /// unpaid account, wrong model mapping, outage).
    pub fn is_retryable(&self) -> bool {
        !self.rejects_content()
    }

    fn from_reqwest(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            UpstreamErrorKind::Timeout
        } else {
            UpstreamErrorKind::Network
        };
        Self::new(kind, format!("upstream request failed: {}", e))
    }
}

/// Sends one request to one channel.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, channel: &RoutableChannel, request: &ChatRequest) -> Result<UpstreamReply, UpstreamError>;
}

pub struct HttpDispatcher {
    client: reqwest::Client,
    cipher: SecretCipher,
}

impl HttpDispatcher {
    pub fn new(config: &UpstreamConfig, proxy: Option<&str>, cipher: SecretCipher) -> Result<Self, BaseError> {
        let mut client_builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.request_timeout());
        if let Some(proxy_url) = proxy {
            let proxy = Proxy::https(proxy_url).map_err(|e| {
                error!("Invalid proxy URL '{}': {}", proxy_url, e);
                BaseError::ParamInvalid(Some("Invalid proxy configuration".to_string()))
            })?;
            client_builder = client_builder.proxy(proxy);
        }
        let client = client_builder.build().map_err(|e| {
            error!("Failed to build reqwest client: {}", e);
            BaseError::InternalServerError(Some("Failed to build HTTP client".to_string()))
        })?;
        Ok(Self { client, cipher })
    }
}

#[async_trait]
impl Dispatcher for HttpDispatcher {
    async fn dispatch(&self, channel: &RoutableChannel, request: &ChatRequest) -> Result<UpstreamReply, UpstreamError> {
        let adapter = ProviderAdapter::from(channel.channel.provider_type);
        let url = adapter.endpoint(channel.channel.base_url.as_deref());
        let payload = adapter.build_request(request, &channel.upstream_model);

        let mut builder = self.client.post(&url).json(&payload);
        {
            let credential = self.cipher.open(&channel.channel.encrypted_credential).map_err(|e| {
                UpstreamError::new(
                    UpstreamErrorKind::Credential,
                    format!("channel {} credential unusable: {}", channel.channel.id, e),
                )
            })?;
            for (name, value) in adapter.auth_headers(&credential) {
                builder = builder.header(name, value);
            }
        }

        debug!("dispatching to channel {} ({})", channel.channel.id, url);
        let response = builder.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = response.status();

        if !status.is_success() {
            let body = read_body(response).await?;
            return Err(UpstreamError::status(status, error_text(&body)));
        }

        if request.stream {
            let is_sse = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.contains("text/event-stream"));
            if !is_sse {
                return Err(UpstreamError::new(
                    UpstreamErrorKind::InvalidResponse,
                    "upstream answered a stream request without an event stream",
                ));
            }
            return Ok(UpstreamReply::Stream(frame_stream(response, adapter.stream_decoder())));
        }

        let body = read_body(response).await?;
        adapter
            .parse_completion(&body)
            .map(UpstreamReply::Complete)
            .map_err(|message| UpstreamError::new(UpstreamErrorKind::InvalidResponse, message))
    }
}

async fn read_body(response: reqwest::Response) -> Result<Bytes, UpstreamError> {
    let is_gzip = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("gzip"));
    let body = response.bytes().await.map_err(UpstreamError::from_reqwest)?;
    if !is_gzip || body.is_empty() {
        return Ok(body);
    }
    let mut decoded = Vec::new();
    match GzDecoder::new(&body[..]).read_to_end(&mut decoded) {
        Ok(_) => Ok(Bytes::from(decoded)),
        Err(e) => {
            error!("Gzip decoding of upstream body failed: {}", e);
            Ok(body)
        }
    }
}

// Message worth surfacing from an upstream error body.
fn error_text(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let message = value
            .pointer("/error/message")
            .or_else(|| value.get("message"))
            .and_then(Value::as_str);
        if let Some(message) = message {
            return message.to_string();
        }
    }
    let text = String::from_utf8_lossy(body);
    text.chars().take(300).collect()
}

fn frame_stream(response: reqwest::Response, mut decoder: StreamDecoder) -> FrameStream {
    let stream = async_stream::stream! {
        let mut body = response.bytes_stream();
        let mut parser = SseParser::new();
        let mut finished = false;

        'read: while let Some(chunk) = body.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    yield Err(UpstreamError::from_reqwest(e));
                    finished = true;
                    break 'read;
                }
            };
            for event in parser.process(&bytes) {
                match decoder.decode(&event) {
                    Ok(frames) => {
                        for frame in frames {
                            let done = frame == StreamFrame::Done;
                            yield Ok(frame);
                            if done {
                                finished = true;
                                break 'read;
                            }
                        }
                    }
                    Err(message) => {
                        yield Err(UpstreamError::new(UpstreamErrorKind::InvalidResponse, message));
                        finished = true;
                        break 'read;
                    }
                }
            }
        }

        if !finished {
            if let Some(event) = parser.finish() {
                match decoder.decode(&event) {
                    Ok(frames) => {
                        for frame in frames {
                            let done = frame == StreamFrame::Done;
                            yield Ok(frame);
                            if done {
                                finished = true;
                            }
                        }
                    }
                    Err(message) => {
                        yield Err(UpstreamError::new(UpstreamErrorKind::InvalidResponse, message));
                        finished = true;
                    }
                }
            }
        }
        // Some upstreams close without a terminator.
        if !finished {
            yield Ok(StreamFrame::Done);
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::channel::Channel;
    use crate::schema::enum_def::ProviderType;
    use axum::http::HeaderMap;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::{Json, Router};
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use serde_json::json;
    use std::io::Write;
    use std::net::SocketAddr;

    const SECRET: &str = "unit-test-secret";

    async fn completion(headers: HeaderMap) -> impl IntoResponse {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Json(json!({
            "id": "up-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": auth}}],
            "usage": {"prompt_tokens": 5, "completion_tokens": 2}
        }))
    }

    async fn overloaded() -> impl IntoResponse {
        (StatusCode::BAD_GATEWAY, Json(json!({"error": {"message": "overloaded"}})))
    }

    async fn rejected() -> impl IntoResponse {
        (StatusCode::BAD_REQUEST, Json(json!({"error": {"message": "bad messages"}})))
    }

    async fn gzipped() -> impl IntoResponse {
        let body = json!({"choices": [{"index": 0, "message": {"content": "zipped"}}]}).to_string();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(body.as_bytes()).unwrap();
        let bytes = encoder.finish().unwrap();
        ([("content-type", "application/json"), ("content-encoding", "gzip")], bytes)
    }

    async fn streamed() -> impl IntoResponse {
        let body = concat!(
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"He\"}}]}\n\n",
            "data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"llo\"}}]}\n\n",
            "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":2}}\n\n",
            "data: [DONE]\n\n"
        );
        ([("content-type", "text/event-stream")], body)
    }

    async fn spawn_mock() -> SocketAddr {
        let app = Router::new()
            .route("/ok/chat/completions", post(completion))
            .route("/busy/chat/completions", post(overloaded))
            .route("/bad/chat/completions", post(rejected))
            .route("/gzip/chat/completions", post(gzipped))
            .route("/stream/chat/completions", post(streamed));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    fn channel(addr: SocketAddr, path: &str) -> RoutableChannel {
        let cipher = SecretCipher::new(SECRET);
        RoutableChannel {
            channel: Channel {
                id: 1,
                name: "mock".to_string(),
                provider_type: ProviderType::Openai,
                encrypted_credential: cipher.seal("sk-upstream").unwrap(),
                base_url: Some(format!("http://{}/{}", addr, path)),
                priority: 0,
                weight: 1,
                is_active: true,
                ..Default::default()
            },
            upstream_model: "gpt-4o-mini".to_string(),
        }
    }

    fn dispatcher() -> HttpDispatcher {
        HttpDispatcher::new(&UpstreamConfig::default(), None, SecretCipher::new(SECRET)).unwrap()
    }

    fn request(stream: bool) -> ChatRequest {
        ChatRequest::from_value(json!({
            "model": "gpt-4o-mini",
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_dispatch_complete_with_decrypted_credential() {
        let addr = spawn_mock().await;
        let reply = dispatcher().dispatch(&channel(addr, "ok"), &request(false)).await.unwrap();

        let UpstreamReply::Complete(completion) = reply else { panic!("expected a buffered reply") };
        assert_eq!(completion.body["choices"][0]["message"]["content"], "Bearer sk-upstream");
        assert_eq!(completion.usage.unwrap().total(), 7);
    }

    #[tokio::test]
    async fn test_error_classification() {
        let addr = spawn_mock().await;
        let d = dispatcher();

        let busy = d.dispatch(&channel(addr, "busy"), &request(false)).await.err().unwrap();
        assert!(busy.is_retryable());
        assert_eq!(busy.status, Some(StatusCode::BAD_GATEWAY));

        let bad = d.dispatch(&channel(addr, "bad"), &request(false)).await.err().unwrap();
        assert!(!bad.is_retryable());
        assert_eq!(bad.message, "bad messages");

        let mut broken = channel(addr, "ok");
        broken.channel.encrypted_credential = "not-sealed".to_string();
        let err = d.dispatch(&broken, &request(false)).await.err().unwrap();
        assert_eq!(err.kind, UpstreamErrorKind::Credential);
        assert!(!err.message.contains("sk-upstream"));
    }

    #[tokio::test]
    async fn test_gzip_body_is_decoded() {
        let addr = spawn_mock().await;
        let reply = dispatcher().dispatch(&channel(addr, "gzip"), &request(false)).await.unwrap();

        let UpstreamReply::Complete(completion) = reply else { panic!("expected a buffered reply") };
        assert_eq!(completion.body["choices"][0]["message"]["content"], "zipped");
    }

    #[tokio::test]
    async fn test_stream_frames() {
        let addr = spawn_mock().await;
        let reply = dispatcher().dispatch(&channel(addr, "stream"), &request(true)).await.unwrap();

        let UpstreamReply::Stream(stream) = reply else { panic!("expected a stream") };
        let frames: Vec<_> = stream.map(|f| f.unwrap()).collect().await;
        assert_eq!(frames.len(), 4);
        assert_eq!(frames.last(), Some(&StreamFrame::Done));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(UpstreamError::status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_retryable());
        assert!(UpstreamError::status(StatusCode::INTERNAL_SERVER_ERROR, "boom").is_retryable());
        assert!(UpstreamError::new(UpstreamErrorKind::Timeout, "timed out").is_retryable());

        for channel_fault in [
            StatusCode::UNAUTHORIZED,
            StatusCode::PAYMENT_REQUIRED,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
        ] {
            assert!(UpstreamError::status(channel_fault, "channel fault").is_retryable());
        }
        for content in [
            StatusCode::BAD_REQUEST,
            StatusCode::PAYLOAD_TOO_LARGE,
            StatusCode::UNPROCESSABLE_ENTITY,
        ] {
            let err = UpstreamError::status(content, "bad body");
            assert!(err.rejects_content());
            assert!(!err.is_retryable());
        }
    }
}
