//! HTTP front door
//!
//! - `POST /v1/chat/completions`: route and execute an [`InferenceRequest`]
//! - `GET /health`: [`FleetHealth`] as JSON, 503 when nothing can serve
//! - `GET /metrics`: Prometheus text exposition
//!
//! The caller identity used for quotas comes from `Authorization: Bearer`
//! or `X-API-Key` when present, otherwise from the request body.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use hyper::service::{make_service_fn, service_fn};
use hyper::{header, Body, HeaderMap, Method, Request, Response, Server, StatusCode};
use serde::Serialize;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use switchyard_proto::InferenceRequest;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::dispatch::Dispatcher;
use crate::health::HealthTracker;

/// Shared state behind every connection
#[derive(Clone)]
pub struct OpsState {
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthTracker>,
    pub metrics_enabled: bool,
}

pub struct OpsServer {
    state: OpsState,
    bind_addr: SocketAddr,
}

impl OpsServer {
    pub fn new(state: OpsState, bind_addr: SocketAddr) -> Self {
        Self { state, bind_addr }
    }

    /// Serve until `shutdown` flips to true
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let state = self.state;
        let make_svc = make_service_fn(move |_conn| {
            let state = state.clone();
            async move {
                Ok::<_, Infallible>(service_fn(move |req| {
                    let state = state.clone();
                    async move { Ok::<_, Infallible>(handle_request(req, state).await) }
                }))
            }
        });

        let server = Server::try_bind(&self.bind_addr)
            .map_err(|e| SwitchyardError::config(format!("cannot bind {}: {}", self.bind_addr, e)))?
            .serve(make_svc)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                info!("Operations server draining connections");
            });

        info!("Listening on http://{}", self.bind_addr);
        server
            .await
            .map_err(|e| SwitchyardError::internal(format!("server error: {}", e)))
    }
}

pub(crate) async fn handle_request(req: Request<Body>, state: OpsState) -> Response<Body> {
    debug!("{} {}", req.method(), req.uri().path());
    match (req.method(), req.uri().path()) {
        (&Method::POST, "/v1/chat/completions") => handle_completion(req, &state).await,
        (&Method::GET, "/health") => handle_health(&state).await,
        (&Method::GET, "/metrics") if state.metrics_enabled => Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(Body::from(METRICS.gather()))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Body::from("Not Found"))
            .unwrap_or_else(|_| Response::new(Body::empty())),
    }
}

async fn handle_completion(req: Request<Body>, state: &OpsState) -> Response<Body> {
    let identity = caller_identity(req.headers());
    let body = match hyper::body::to_bytes(req.into_body()).await {
        Ok(body) => body,
        Err(e) => return error_response(&SwitchyardError::invalid_request(format!("unreadable body: {}", e))),
    };

    let mut request: InferenceRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => return error_response(&SwitchyardError::invalid_request(format!("malformed request: {}", e))),
    };
    if let Some(identity) = identity {
        request.caller = identity;
    }
    match state.dispatcher.execute(request).await {
        Ok(response) => json_response(StatusCode::OK, &response),
        Err(e) => {
            warn!("Request rejected: {}", e);
            error_response(&e)
        }
    }
}

async fn handle_health(state: &OpsState) -> Response<Body> {
    let fleet = state.health.fleet_health().await;
    let status = if fleet.is_serving() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    json_response(status, &fleet)
}

fn caller_identity(headers: &HeaderMap) -> Option<String> {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    let api_key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim);

    bearer
        .or(api_key)
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

fn error_response(err: &SwitchyardError) -> Response<Body> {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let rejection = err.rejection();
    let mut response = json_response(status, &rejection);
    if let Some(ms) = rejection.retry_after_ms {
        // Whole seconds, rounded up
        let secs = ms.div_ceil(1000).max(1);
        if let Ok(value) = secs.to_string().parse() {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Body> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from(json))
            .unwrap_or_else(|_| Response::new(Body::empty())),
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::empty())
                .unwrap_or_else(|_| Response::new(Body::empty()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionController;
    use crate::descriptor::tests::{backend, group};
    use crate::descriptor::{BackendDescriptor, DescriptorStore};
    use crate::dispatch::GenerationBackend;
    use crate::health::tests::ScriptedProbe;
    use crate::prefix_cache::PrefixCache;
    use crate::router::Router;
    use async_trait::async_trait;
    use switchyard_common::config::{AdmissionConfig, HealthConfig, PrefixCacheConfig, RoutingConfig};
    use switchyard_proto::{FleetHealth, GenerateRequest, GenerateResponse, InferenceResponse, Rejection, RejectionKind, TokenUsage};

    struct Echo;

    #[async_trait]
    impl GenerationBackend for Echo {
        async fn generate(&self, _backend: &BackendDescriptor, request: &GenerateRequest) -> Result<GenerateResponse> {
            Ok(GenerateResponse {
                text: format!("echo: {}", request.messages.len()),
                usage: TokenUsage {
                    prompt_tokens: 5,
                    completion_tokens: 1,
                },
                prefix_handle: None,
            })
        }
    }

    async fn state(ready: bool, requests_per_minute: u32) -> OpsState {
        let store = Arc::new(
            DescriptorStore::from_config(&[group("g0", &[0])], &[backend("a", "g0", 8192, &[])]).unwrap(),
        );
        let health = Arc::new(HealthTracker::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            HealthConfig::default(),
        ));
        if ready {
            health.mark_ready("a").await;
        }
        let admission = Arc::new(AdmissionController::new(AdmissionConfig {
            requests_per_minute,
            ..Default::default()
        }));
        let router = Arc::new(Router::new(
            store,
            health.clone(),
            admission,
            Arc::new(PrefixCache::new(PrefixCacheConfig::default())),
            RoutingConfig::default(),
        ));
        OpsState {
            dispatcher: Arc::new(Dispatcher::new(router, Arc::new(Echo))),
            health,
            metrics_enabled: true,
        }
    }

    fn completion(body: &str, api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri("/v1/chat/completions")
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = api_key {
            builder = builder.header("x-api-key", key);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: Response<Body>) -> T {
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const BODY: &str = r#"{"caller": "body-caller", "messages": [{"role": "user", "content": "hi"}]}"#;

    #[tokio::test]
    async fn test_completion_round_trip() {
        let state = state(true, 60).await;
        let response = handle_request(completion(BODY, None), state).await;
        assert_eq!(response.status(), StatusCode::OK);

        let reply: InferenceResponse = read_json(response).await;
        assert_eq!(reply.backend, "a");
        assert_eq!(reply.text, "echo: 1");
    }

    #[tokio::test]
    async fn test_header_identity_overrides_body() {
        let state = state(true, 1).await;
        let router = state.dispatcher.router().clone();

        let response = handle_request(completion(BODY, Some("key-123")), state.clone()).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(router.admission().usage("key-123").is_some());
        assert!(router.admission().usage("body-caller").is_none());

        // Same key is now over its one-per-minute quota
        let response = handle_request(completion(BODY, Some("key-123")), state).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));
        let rejection: Rejection = read_json(response).await;
        assert_eq!(rejection.kind, RejectionKind::RateLimited);
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let state = state(true, 60).await;
        let response = handle_request(completion("{not json", None), state).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_health_reports_unavailable_without_ready_backends() {
        let state = state(false, 60).await;
        let request = Request::get("/health").body(Body::empty()).unwrap();
        let response = handle_request(request, state).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let fleet: FleetHealth = read_json(response).await;
        assert_eq!(fleet.starting, 1);
    }

    #[tokio::test]
    async fn test_metrics_and_unknown_paths() {
        let state = state(true, 60).await;
        let metrics = Request::get("/metrics").body(Body::empty()).unwrap();
        assert_eq!(handle_request(metrics, state.clone()).await.status(), StatusCode::OK);

        let unknown = Request::get("/nope").body(Body::empty()).unwrap();
        assert_eq!(handle_request(unknown, state).await.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_caller_identity_prefers_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", "key".parse().unwrap());
        assert_eq!(caller_identity(&headers).as_deref(), Some("key"));

        headers.insert(header::AUTHORIZATION, "Bearer tok".parse().unwrap());
        assert_eq!(caller_identity(&headers).as_deref(), Some("tok"));

        headers.insert(header::AUTHORIZATION, "Basic abc".parse().unwrap());
        assert_eq!(caller_identity(&headers).as_deref(), Some("key"));
    }
}
