//! HTTP client for backend control endpoints
//!
//! Backends speak an OpenAI-compatible API: a readiness probe on a
//! configurable path and `POST /v1/chat/completions` for generation.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_proto::{GenerateRequest, GenerateResponse, ProbeResponse, TokenUsage};
use tracing::debug;

use crate::descriptor::BackendDescriptor;
use crate::dispatch::GenerationBackend;
use crate::health::BackendProbe;

/// Chat completion body as returned by the backends
#[derive(Debug, Deserialize)]
struct CompletionBody {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
    #[serde(default)]
    prefix_handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

/// Shared HTTP client for every backend
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    probe_path: String,
}

impl BackendClient {
    /// Create a client; `request_timeout` bounds generation calls
    pub fn new(probe_path: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            probe_path: probe_path.into(),
        })
    }

    /// Readiness probe. A 2xx without a body counts as ready.
    pub async fn probe(&self, backend: &BackendDescriptor) -> Result<ProbeResponse> {
        let url = format!("{}{}", backend.endpoint, self.probe_path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| SwitchyardError::Connection(format!("{}: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(SwitchyardError::Connection(format!("{} returned {}", url, status)));
        }

        let body = response.bytes().await?;
        if body.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(ProbeResponse {
                ready: true,
                load: None,
            });
        }
        // Plain-text bodies such as "OK" still mean ready
        Ok(serde_json::from_slice(&body).unwrap_or(ProbeResponse {
            ready: true,
            load: None,
        }))
    }

    /// Run one generation on `backend`
    pub async fn generate(&self, backend: &BackendDescriptor, request: &GenerateRequest) -> Result<GenerateResponse> {
        let url = format!("{}/v1/chat/completions", backend.endpoint);
        debug!("Forwarding {} messages to {}", request.messages.len(), backend.id);

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| SwitchyardError::backend_fault(&backend.id, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SwitchyardError::backend_fault(
                &backend.id,
                format!("HTTP {}: {}", status, detail.trim()),
            ));
        }

        let body: CompletionBody = response
            .json()
            .await
            .map_err(|e| SwitchyardError::backend_fault(&backend.id, format!("bad completion body: {}", e)))?;

        let text = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| SwitchyardError::backend_fault(&backend.id, "completion has no choices"))?;

        Ok(GenerateResponse {
            text,
            usage: body.usage.unwrap_or_default(),
            prefix_handle: body.prefix_handle,
        })
    }
}

#[async_trait]
impl BackendProbe for BackendClient {
    async fn probe(&self, backend: &BackendDescriptor) -> Result<ProbeResponse> {
        BackendClient::probe(self, backend).await
    }
}

#[async_trait]
impl GenerationBackend for BackendClient {
    async fn generate(&self, backend: &BackendDescriptor, request: &GenerateRequest) -> Result<GenerateResponse> {
        BackendClient::generate(self, backend, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_completion_body_parsing() {
        let body: CompletionBody = serde_json::from_str(
            r#"{
                "id": "chatcmpl-1",
                "choices": [{"index": 0, "message": {"role": "assistant", "content": "hi"}}],
                "usage": {"prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15}
            }"#,
        )
        .unwrap();

        assert_eq!(body.choices[0].message.content.as_deref(), Some("hi"));
        assert_eq!(body.usage.unwrap().total(), 15);
        assert!(body.prefix_handle.is_none());
    }

    #[tokio::test]
    async fn test_probe_unreachable_backend_fails() {
        let client = BackendClient::new("/health", Duration::from_secs(1)).unwrap();
        let backend = BackendDescriptor {
            id: "nowhere".to_string(),
            endpoint: "http://127.0.0.1:9".to_string(),
            device_group: "g0".to_string(),
            devices: vec![0],
            max_context_tokens: 8192,
            specializations: Vec::new(),
            throughput_class: Default::default(),
            aliases: Vec::new(),
            launch: None,
            startup_timeout: None,
        };

        let err = client.probe(&backend).await.unwrap_err();
        assert!(matches!(err, SwitchyardError::Connection(_)));
    }
}
