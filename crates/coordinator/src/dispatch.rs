//! Request dispatch
//!
//! Drives one request end to end: route, forward to the chosen backend,
//! settle the outcome. A backend fault is retried on a different backend
//! only when configured to, and never on a backend that already failed the
//! request. Faults do not touch backend health; only probes do.

use std::sync::Arc;

use async_trait::async_trait;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use switchyard_proto::{GenerateRequest, GenerateResponse, InferenceRequest, InferenceResponse};
use tracing::{info, warn};

use crate::descriptor::BackendDescriptor;
use crate::router::Router;

/// Generation endpoint of a backend
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    async fn generate(&self, backend: &BackendDescriptor, request: &GenerateRequest) -> Result<GenerateResponse>;
}

struct ActiveRequest;

impl ActiveRequest {
    fn start() -> Self {
        METRICS.routing.active_requests.inc();
        ActiveRequest
    }
}

impl Drop for ActiveRequest {
    fn drop(&mut self) {
        METRICS.routing.active_requests.dec();
    }
}

/// Executes requests against the fleet
pub struct Dispatcher {
    router: Arc<Router>,
    backend: Arc<dyn GenerationBackend>,
}

impl Dispatcher {
    pub fn new(router: Arc<Router>, backend: Arc<dyn GenerationBackend>) -> Self {
        Self { router, backend }
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    /// Serve one request
    pub async fn execute(&self, request: InferenceRequest) -> Result<InferenceResponse> {
        let _active = ActiveRequest::start();
        let _timer = METRICS.routing.request_duration.start_timer();

        let config = self.router.config();
        let timeout = config.request_timeout();
        let max_attempts = if config.retry_on_backend_fault {
            config.max_backend_attempts.max(1) as usize
        } else {
            1
        };

        let mut decision = self.router.route(&request).await?;
        let mut failed: Vec<String> = Vec::new();

        loop {
            let backend = decision.backend.clone();
            let generate = GenerateRequest {
                model: backend.id.clone(),
                messages: request.messages.clone(),
                max_tokens: request.max_tokens,
                prefix_handle: decision.prefix_handle.clone(),
            };

            let outcome = match tokio::time::timeout(timeout, self.backend.generate(&backend, &generate)).await {
                Ok(Ok(response)) => Ok(response),
                Ok(Err(e @ SwitchyardError::BackendFault { .. })) => Err(e),
                Ok(Err(e)) => Err(SwitchyardError::backend_fault(&backend.id, e.to_string())),
                Err(_) => Err(SwitchyardError::backend_fault(
                    &backend.id,
                    format!("no response within {:?}", timeout),
                )),
            };

            match outcome {
                Ok(response) => {
                    let reply = InferenceResponse {
                        request_id: decision.request_id.clone(),
                        backend: backend.id.clone(),
                        text: response.text,
                        usage: response.usage,
                        prefix_cache_hit: decision.cache_hit,
                    };
                    self.router.complete(decision, response.usage, response.prefix_handle);
                    return Ok(reply);
                }
                Err(e) => {
                    METRICS
                        .routing
                        .backend_faults
                        .with_label_values(&[backend.id.as_str()])
                        .inc();
                    warn!("Request {} failed on {}: {}", decision.request_id, backend.id, e);

                    failed.push(backend.id.clone());
                    let ticket = self.router.abandon(decision);
                    if failed.len() >= max_attempts {
                        return Err(e);
                    }

                    METRICS.routing.retries.inc();
                    info!("Retrying request from {} away from {}", request.caller, failed.join(", "));
                    decision = self.router.route_excluding(&request, ticket, &failed).await?;
                }
            }
        }
    }
}
