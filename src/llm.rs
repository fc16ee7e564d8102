use std::time::Duration;

use reqwest::header::{CACHE_CONTROL, EXPIRES, PRAGMA};
use reqwest::{Client, ClientBuilder};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::config::{AiSettings, BackendKind};
use crate::error::ChatError;
use crate::prompt::{PromptMessage, flatten_for_ollama, rewrite_ollama_endpoint};
use crate::stream::{StreamEnd, decode_body, extract_delta};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Request/response dialect spoken by the configured backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
    /// `/v1/chat/completions` with a `messages` array (DeepSeek, OpenAI, LM Studio, vLLM).
    OpenAi,
    /// Ollama's native `/api/generate` with a flattened `prompt`.
    Ollama,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum RequestBody {
    OpenAi(ChatCompletionRequest),
    Ollama(GenerateRequest),
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatCompletionRequest {
    model: String,
    messages: Vec<PromptMessage>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Clone, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Debug, Clone, Serialize)]
struct GenerateOptions {
    temperature: f32,
    num_predict: u32,
}

/// Fully resolved outbound call: URL, body and header decisions.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub url: String,
    pub format: WireFormat,
    pub stream: bool,
    pub body: RequestBody,
    api_key: Option<String>,
    no_cache: bool,
}

impl LlmRequest {
    pub fn build(settings: &AiSettings, messages: Vec<PromptMessage>) -> Self {
        let format = settings.wire_format();
        let stream = settings.streaming_enabled;
        let (url, body) = match format {
            WireFormat::OpenAi => (
                settings.endpoint.clone(),
                RequestBody::OpenAi(ChatCompletionRequest {
                    model: settings.model.clone(),
                    messages,
                    temperature: settings.temperature,
                    max_tokens: settings.max_tokens,
                    stream,
                    stream_options: stream.then_some(StreamOptions {
                        include_usage: false,
                    }),
                }),
            ),
            WireFormat::Ollama => (
                rewrite_ollama_endpoint(&settings.endpoint),
                RequestBody::Ollama(GenerateRequest {
                    model: settings.model.clone(),
                    prompt: flatten_for_ollama(&messages),
                    stream,
                    options: GenerateOptions {
                        temperature: settings.temperature,
                        num_predict: settings.max_tokens,
                    },
                }),
            ),
        };
        LlmRequest {
            url,
            format,
            stream,
            body,
            api_key: settings.api_key().map(str::to_string),
            no_cache: settings.backend == BackendKind::Online,
        }
    }

    #[cfg(test)]
    pub fn has_auth(&self) -> bool {
        self.api_key.is_some()
    }
}

pub struct LlmClient {
    http: Client,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(settings: &AiSettings) -> Result<Self, ChatError> {
        let timeout = settings.timeout();
        Ok(LlmClient {
            http: ClientBuilder::new()
                .connect_timeout(CONNECT_TIMEOUT)
                .read_timeout(timeout)
                .build()?,
            timeout,
        })
    }

    /// Sends `request` and reports text deltas through `on_delta` as they arrive.
    ///
    /// Returns `Err(ChatError::Cancelled)` once `token` fires, whether the call was
    /// still connecting or already streaming.
    pub async fn execute(
        &self,
        request: &LlmRequest,
        token: &CancellationToken,
        on_delta: &mut (dyn FnMut(&str) + Send),
    ) -> Result<(), ChatError> {
        let mut builder = self.http.post(&request.url).json(&request.body);
        if let Some(key) = request.api_key.as_deref() {
            builder = builder.bearer_auth(key);
        }
        if request.no_cache {
            builder = builder
                .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
                .header(PRAGMA, "no-cache")
                .header(EXPIRES, "0");
        }
        if !request.stream {
            builder = builder.timeout(self.timeout);
        }
        tracing::info!(url = %request.url, format = ?request.format, stream = request.stream, "sending chat request");

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            response = builder.send() => response?,
        };
        let status = response.status();
        if !status.is_success() {
            let body = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(ChatError::Cancelled),
                body = response.text() => body.unwrap_or_default(),
            };
            tracing::warn!(status = status.as_u16(), "chat request rejected");
            return Err(ChatError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }

        if request.stream {
            return match decode_body(response.bytes_stream(), request.format, token, on_delta)
                .await?
            {
                StreamEnd::Completed => Ok(()),
                StreamEnd::Cancelled => Err(ChatError::Cancelled),
            };
        }

        let text = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(ChatError::Cancelled),
            text = response.text() => text?,
        };
        let payload: Value = serde_json::from_str(&text).map_err(|err| {
            ChatError::InvalidResponse(format!("{err}（响应原文: {}）", preview(&text)))
        })?;
        match extract_delta(&payload, request.format) {
            Some(content) => on_delta(&content),
            None => tracing::debug!("non-streaming response carried no text"),
        }
        Ok(())
    }
}

fn preview(text: &str) -> String {
    let mut out: String = text.chars().take(200).collect();
    if text.chars().count() > 200 {
        out.push_str("...");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalServiceType;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn messages() -> Vec<PromptMessage> {
        vec![
            PromptMessage {
                role: "system".to_string(),
                content: "SYS".to_string(),
            },
            PromptMessage {
                role: "user".to_string(),
                content: "hi".to_string(),
            },
        ]
    }

    #[test]
    fn openai_body_carries_stream_options_only_when_streaming() {
        let settings = AiSettings {
            api_key: "sk-test".to_string(),
            ..AiSettings::default()
        };
        let request = LlmRequest::build(&settings, messages());
        let body = serde_json::to_value(&request.body).unwrap();
        assert_eq!(body["stream"], json!(true));
        assert_eq!(body["stream_options"], json!({"include_usage": false}));
        assert_eq!(body["messages"][1]["content"], json!("hi"));
        assert_eq!(body["max_tokens"], json!(2000));
        assert!(request.has_auth());
        assert!(request.no_cache);

        let settings = AiSettings {
            streaming_enabled: false,
            ..AiSettings::default()
        };
        let request = LlmRequest::build(&settings, messages());
        let body = serde_json::to_value(&request.body).unwrap();
        assert!(body.get("stream_options").is_none());
        assert!(!request.has_auth());
    }

    #[test]
    fn ollama_body_uses_generate_shape() {
        let settings = AiSettings {
            backend: BackendKind::Local,
            local_service: LocalServiceType::Ollama,
            endpoint: "http://localhost:11434/v1/chat/completions".to_string(),
            model: "qwen2.5".to_string(),
            max_tokens: 512,
            ..AiSettings::default()
        };
        let request = LlmRequest::build(&settings, messages());
        assert_eq!(request.url, "http://localhost:11434/api/generate");
        assert_eq!(request.format, WireFormat::Ollama);
        assert!(!request.no_cache);
        let body = serde_json::to_value(&request.body).unwrap();
        assert_eq!(body["prompt"], json!("SYS\n\nUser: hi"));
        assert_eq!(body["options"]["num_predict"], json!(512));
        assert!(body.get("messages").is_none());
    }

    #[tokio::test]
    async fn online_requests_send_auth_and_no_cache_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .and(header("cache-control", "no-cache, no-store, must-revalidate"))
            .and(header("pragma", "no-cache"))
            .and(body_partial_json(json!({"model": "deepseek-chat", "stream": false})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"role": "assistant", "content": "fine"}}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let settings = AiSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            api_key: "sk-test".to_string(),
            streaming_enabled: false,
            ..AiSettings::default()
        };
        let client = LlmClient::new(&settings).unwrap();
        let request = LlmRequest::build(&settings, messages());
        let mut out = String::new();
        client
            .execute(&request, &CancellationToken::new(), &mut |delta: &str| {
                out.push_str(delta)
            })
            .await
            .unwrap();
        assert_eq!(out, "fine");
    }

    #[tokio::test]
    async fn non_json_body_is_an_invalid_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>gateway</html>"))
            .mount(&server)
            .await;
        let settings = AiSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            streaming_enabled: false,
            ..AiSettings::default()
        };
        let client = LlmClient::new(&settings).unwrap();
        let request = LlmRequest::build(&settings, messages());
        let err = client
            .execute(&request, &CancellationToken::new(), &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(matches!(err, ChatError::InvalidResponse(ref detail) if detail.contains("gateway")));
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("data: [DONE]\n")
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;
        let settings = AiSettings {
            endpoint: format!("{}/v1/chat/completions", server.uri()),
            ..AiSettings::default()
        };
        let client = LlmClient::new(&settings).unwrap();
        let request = LlmRequest::build(&settings, messages());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let err = client
            .execute(&request, &token, &mut |_: &str| {})
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
