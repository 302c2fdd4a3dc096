pub mod clean;
mod http_errors;
pub mod sse;

use std::pin::Pin;
use std::time::Duration;

use futures::Stream;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::{ChatRequest, ChatResponse, ChatStreamChunk, Message};
use http_errors::chat_request_error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("{message}")]
    Request {
        message: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("Error: {status}, {body}")]
    Status { status: StatusCode, body: String },
    #[error("failed to parse chat response")]
    Decode(#[source] reqwest::Error),
    #[error("chat response contained no choices")]
    EmptyResponse,
    #[error("chat stream interrupted: {0}")]
    Stream(String),
    #[error("failed to initialize HTTP client")]
    Client(#[source] reqwest::Error),
}

pub type ChatStream = Pin<Box<dyn Stream<Item = Result<ChatStreamChunk, TransportError>> + Send>>;

/// Result of [`ChatTransport::send`].
pub enum ChatReply {
    Complete(ChatResponse),
    Stream(ChatStream),
}

/// HTTP client for the llamafile `/v1/chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct ChatTransport {
    client: Client,
    api_url: String,
    api_key: Option<String>,
    model: String,
    timeout_secs: u64,
}

impl ChatTransport {
    pub fn new(cfg: &Config, api_key: Option<&str>) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(TransportError::Client)?;
        Ok(Self::with_client(client, &cfg.base_url(), api_key, cfg))
    }

    fn with_client(client: Client, base_url: &str, api_key: Option<&str>, cfg: &Config) -> Self {
        Self {
            client,
            api_url: chat_url(base_url),
            api_key: api_key
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(str::to_string),
            model: cfg.model.clone(),
            timeout_secs: cfg.model_timeout_secs,
        }
    }

    pub async fn send(
        &self,
        messages: &[Message],
        streaming: bool,
    ) -> Result<ChatReply, TransportError> {
        if streaming {
            self.stream(messages).await.map(ChatReply::Stream)
        } else {
            self.complete(messages).await.map(ChatReply::Complete)
        }
    }

    pub async fn complete(&self, messages: &[Message]) -> Result<ChatResponse, TransportError> {
        let response = self.post(messages, false).await?;
        let parsed: ChatResponse = response.json().await.map_err(TransportError::Decode)?;
        if parsed.choices.is_empty() {
            return Err(TransportError::EmptyResponse);
        }
        debug!(
            model = %self.model,
            response_len = parsed.first_content().map_or(0, str::len),
            "received chat completion"
        );
        Ok(parsed)
    }

    pub async fn stream(&self, messages: &[Message]) -> Result<ChatStream, TransportError> {
        let response = self.post(messages, true).await?;
        Ok(sse::decode_stream(response.bytes_stream()))
    }

    async fn post(&self, messages: &[Message], stream: bool) -> Result<Response, TransportError> {
        let body = ChatRequest {
            model: &self.model,
            messages,
            stream,
        };
        debug!(
            api_url = %self.api_url,
            model = %self.model,
            message_count = messages.len(),
            stream,
            "sending chat completion request"
        );

        let mut request = self.client.post(&self.api_url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        // Streams get no total deadline.
        if !stream {
            request = request.timeout(Duration::from_secs(self.timeout_secs));
        }

        let response = request.send().await.map_err(|err| {
            warn!(api_url = %self.api_url, error = %err, "chat request failed");
            chat_request_error(err, &self.api_url, self.timeout_secs)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read response body>".to_string());
            warn!(
                api_url = %self.api_url,
                status = %status,
                response_body_len = body.len(),
                "llamafile returned non-success status"
            );
            return Err(TransportError::Status { status, body });
        }

        Ok(response)
    }
}

fn chat_url(base_url: &str) -> String {
    format!("{}/v1/chat/completions", base_url.trim_end_matches('/'))
}
