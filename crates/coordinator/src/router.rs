//! Request routing
//!
//! The router turns an inbound request into a [`RoutingDecision`]: admit the
//! caller, shortlist backends through the policy chain, consult the prefix
//! cache, then pick the best candidate. It reads health snapshots and never
//! changes backend status itself.

use std::cmp::Reverse;
use std::sync::Arc;

use switchyard_common::config::RoutingConfig;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use switchyard_proto::{InferenceRequest, TokenUsage};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::admission::{AdmissionController, AdmissionTicket};
use crate::descriptor::{BackendDescriptor, DescriptorStore};
use crate::health::{HealthTracker, InFlightGuard};
use crate::policy::{classify_task, estimate_tokens, FilterChain, RouteContext};
use crate::prefix_cache::{CacheLookup, PrefixCache, PrefixChain, PrefixReservation};

/// Outcome of routing one request; dropped when the request finishes
#[derive(Debug)]
pub struct RoutingDecision {
    pub request_id: String,
    pub backend: Arc<BackendDescriptor>,

    /// Whether a cached prefix on the chosen backend applies
    pub cache_hit: bool,

    /// Handle to pass to the backend when `cache_hit` is set
    pub prefix_handle: Option<String>,

    pub ticket: AdmissionTicket,
    pub estimated_tokens: u64,

    reservation: Option<PrefixReservation>,
    _in_flight: InFlightGuard,
}

/// Router over the whole fleet
pub struct Router {
    store: Arc<DescriptorStore>,
    health: Arc<HealthTracker>,
    admission: Arc<AdmissionController>,
    cache: Arc<PrefixCache>,
    policy: FilterChain,
    config: RoutingConfig,
}

impl Router {
    /// Create a router with the standard policy chain
    pub fn new(
        store: Arc<DescriptorStore>,
        health: Arc<HealthTracker>,
        admission: Arc<AdmissionController>,
        cache: Arc<PrefixCache>,
        config: RoutingConfig,
    ) -> Self {
        let policy = FilterChain::standard(&config);
        debug!("Routing policy: {}", policy.names().join(" -> "));
        Self {
            store,
            health,
            admission,
            cache,
            policy,
            config,
        }
    }

    pub fn config(&self) -> &RoutingConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<DescriptorStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn cache(&self) -> &Arc<PrefixCache> {
        &self.cache
    }

    fn validate<'a>(&'a self, request: &InferenceRequest) -> Result<Option<&'a Arc<BackendDescriptor>>> {
        if request.caller.trim().is_empty() {
            return Err(SwitchyardError::invalid_request("missing caller identity"));
        }
        if request.messages.is_empty() {
            return Err(SwitchyardError::invalid_request("request has no messages"));
        }
        match request.backend.as_deref() {
            None => Ok(None),
            Some(name) => self
                .store
                .resolve(name)
                .map(Some)
                .ok_or_else(|| SwitchyardError::invalid_request(format!("unknown backend {}", name))),
        }
    }

    /// Admit and route a new request
    pub async fn route(&self, request: &InferenceRequest) -> Result<RoutingDecision> {
        let result = self.admit_and_select(request).await;
        if let Err(e) = &result {
            METRICS
                .routing
                .rejections
                .with_label_values(&[e.rejection().kind.to_string().as_str()])
                .inc();
        }
        result
    }

    async fn admit_and_select(&self, request: &InferenceRequest) -> Result<RoutingDecision> {
        self.validate(request)?;
        let estimated_tokens = estimate_tokens(request, self.config.chars_per_token);
        let ticket = self.admission.admit(&request.caller, estimated_tokens)?;

        match self.select(request, estimated_tokens, &[]).await {
            Ok(selection) => Ok(selection.into_decision(ticket, estimated_tokens)),
            Err(e) => {
                // Never reached a backend; give the slot back
                self.admission.cancel(&ticket);
                Err(e)
            }
        }
    }

    /// Route an already admitted request away from backends that failed it
    pub async fn route_excluding(
        &self,
        request: &InferenceRequest,
        ticket: AdmissionTicket,
        excluded: &[String],
    ) -> Result<RoutingDecision> {
        let estimated_tokens = ticket.estimated_tokens;
        let selection = self.select(request, estimated_tokens, excluded).await?;
        Ok(selection.into_decision(ticket, estimated_tokens))
    }

    async fn select(
        &self,
        request: &InferenceRequest,
        estimated_tokens: u64,
        excluded: &[String],
    ) -> Result<Selection> {
        let explicit = self.validate(request)?;
        let health = self.health.snapshot().await;
        let ctx = RouteContext {
            request,
            estimated_tokens,
            explicit: explicit.map(|b| b.as_ref()),
            task_tag: classify_task(request.last_content(), &self.config.task_rules),
            health: &health,
            store: &self.store,
            excluded,
        };
        let candidates = self.policy.shortlist(&ctx)?;

        let prefix = PrefixChain::for_request(request, self.cache.config().scope, self.config.chars_per_token);
        let (cached, reservation) = match self.cache.resolve(&prefix).await {
            CacheLookup::Hit(entry) if candidates.iter().any(|b| b.id == entry.backend_id) => (Some(entry), None),
            // Cached on a backend that cannot take this request; recompute it elsewhere
            CacheLookup::Hit(entry) => (None, self.cache.supersede(&entry)),
            CacheLookup::Miss { reservation, partial } => (partial, Some(reservation)),
            CacheLookup::Bypass => (None, None),
        };
        let cached_on = cached.as_ref().map(|e| e.backend_id.as_str());

        // Loads are read fresh; the prefix lookup may have waited
        let backend = candidates
            .iter()
            .min_by_key(|b| {
                let reported = health.get(&b.id).map(|s| s.reported_load).unwrap_or(0);
                (
                    cached_on != Some(b.id.as_str()),
                    self.health.in_flight(&b.id).max(reported),
                    Reverse(b.throughput_class),
                    b.id.clone(),
                )
            })
            .cloned()
            .ok_or_else(|| SwitchyardError::no_capacity("no candidate backend"))?;

        let cache_hit = cached_on == Some(backend.id.as_str());
        let in_flight = self
            .health
            .begin_request(&backend.id)
            .ok_or_else(|| SwitchyardError::internal(format!("no load counter for {}", backend.id)))?;

        METRICS
            .routing
            .decisions
            .with_label_values(&[backend.id.as_str()])
            .inc();
        info!(
            "Routed request from {} (~{} tokens) to {}{}",
            request.caller,
            estimated_tokens,
            backend.id,
            if cache_hit { " with cached prefix" } else { "" }
        );

        Ok(Selection {
            backend,
            cache_hit,
            prefix_handle: cached.filter(|_| cache_hit).map(|e| e.handle.clone()),
            reservation,
            in_flight,
        })
    }

    /// Settle a finished request: reconcile usage and publish the computed prefix
    pub fn complete(&self, decision: RoutingDecision, usage: TokenUsage, prefix_handle: Option<String>) {
        self.admission.reconcile(&decision.ticket, usage.total());

        let RoutingDecision {
            backend, reservation, ..
        } = decision;
        match (reservation, prefix_handle) {
            (Some(reservation), Some(handle)) => {
                debug!("Caching prefix {} from {}", reservation.key(), backend.id);
                reservation.complete(handle, backend.id.clone());
            }
            (Some(reservation), None) => {
                debug!("{} returned no prefix handle for {}", backend.id, reservation.key());
                reservation.finish_uncached();
            }
            (None, _) => {}
        }
    }

    /// Give up on a decision after a backend fault, keeping the admission
    /// ticket for a retry elsewhere
    pub fn abandon(&self, decision: RoutingDecision) -> AdmissionTicket {
        warn!("Request {} abandoned on {}", decision.request_id, decision.backend.id);
        decision.ticket
    }
}

struct Selection {
    backend: Arc<BackendDescriptor>,
    cache_hit: bool,
    prefix_handle: Option<String>,
    reservation: Option<PrefixReservation>,
    in_flight: InFlightGuard,
}

impl Selection {
    fn into_decision(self, ticket: AdmissionTicket, estimated_tokens: u64) -> RoutingDecision {
        RoutingDecision {
            request_id: Uuid::new_v4().to_string(),
            backend: self.backend,
            cache_hit: self.cache_hit,
            prefix_handle: self.prefix_handle,
            ticket,
            estimated_tokens,
            reservation: self.reservation,
            _in_flight: self.in_flight,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{backend, group};
    use crate::health::tests::ScriptedProbe;
    use switchyard_common::config::{AdmissionConfig, HealthConfig, PrefixCacheConfig, ThroughputClass};
    use switchyard_proto::{BackendStatus, ChatMessage};

    struct Fleet {
        router: Router,
        health: Arc<HealthTracker>,
        admission: Arc<AdmissionController>,
        cache: Arc<PrefixCache>,
    }

    async fn fleet() -> Fleet {
        let mut a = backend("a", "g0", 200_000, &[]);
        a.throughput_class = ThroughputClass::Low;
        let b = backend("b", "g1", 200_000, &[]);
        let store = Arc::new(
            DescriptorStore::from_config(&[group("g0", &[0]), group("g1", &[1])], &[a, b]).unwrap(),
        );
        let health = Arc::new(HealthTracker::new(
            store.clone(),
            Arc::new(ScriptedProbe::default()),
            HealthConfig::default(),
        ));
        health.mark_ready("a").await;
        health.mark_ready("b").await;
        let admission = Arc::new(AdmissionController::new(AdmissionConfig::default()));
        let cache = Arc::new(PrefixCache::new(PrefixCacheConfig::default()));
        let router = Router::new(
            store,
            health.clone(),
            admission.clone(),
            cache.clone(),
            RoutingConfig::default(),
        );
        Fleet {
            router,
            health,
            admission,
            cache,
        }
    }

    fn conversation(caller: &str) -> InferenceRequest {
        InferenceRequest::new(
            caller,
            vec![ChatMessage::system("You are a careful assistant."), ChatMessage::user("hello")],
        )
    }

    #[tokio::test]
    async fn test_throughput_breaks_ties() {
        let fleet = fleet().await;
        let decision = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(decision.backend.id, "b");
        assert!(!decision.cache_hit);
    }

    #[tokio::test]
    async fn test_load_beats_throughput() {
        let fleet = fleet().await;
        let _busy = fleet.health.begin_request("b").unwrap();

        let decision = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(decision.backend.id, "a");
    }

    #[tokio::test]
    async fn test_cached_prefix_beats_load() {
        let fleet = fleet().await;
        let first = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(first.backend.id, "b");
        fleet
            .router
            .complete(first, TokenUsage { prompt_tokens: 10, completion_tokens: 5 }, Some("kv-b".to_string()));

        let _busy = fleet.health.begin_request("b").unwrap();
        let second = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(second.backend.id, "b");
        assert!(second.cache_hit);
        assert_eq!(second.prefix_handle.as_deref(), Some("kv-b"));
        assert_eq!(fleet.cache.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_cache_hit_ignored_when_backend_unavailable() {
        let fleet = fleet().await;
        let first = fleet.router.route(&conversation("alice")).await.unwrap();
        fleet.router.complete(first, TokenUsage::default(), Some("kv-b".to_string()));

        fleet.health.mark_down("b", "test").await;
        let second = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(second.backend.id, "a");
        assert!(!second.cache_hit);
        assert!(second.prefix_handle.is_none());

        // The prefix is recomputed on a and cached there from now on
        fleet.router.complete(second, TokenUsage::default(), Some("kv-a".to_string()));
        let third = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(third.backend.id, "a");
        assert!(third.cache_hit);
        assert_eq!(third.prefix_handle.as_deref(), Some("kv-a"));
    }

    #[tokio::test]
    async fn test_missing_handle_frees_prefix() {
        let fleet = fleet().await;
        let first = fleet.router.route(&conversation("alice")).await.unwrap();
        fleet.router.complete(first, TokenUsage::default(), None);
        assert_eq!(fleet.cache.stats().entries, 0);

        let second = fleet.router.route(&conversation("alice")).await.unwrap();
        assert!(!second.cache_hit);
        assert_eq!(fleet.cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_in_flight_released_with_decision() {
        let fleet = fleet().await;
        let decision = fleet.router.route(&conversation("alice")).await.unwrap();
        assert_eq!(fleet.health.in_flight("b"), 1);
        drop(decision);
        assert_eq!(fleet.health.in_flight("b"), 0);
    }

    #[tokio::test]
    async fn test_failed_routing_returns_admission_slot() {
        let fleet = fleet().await;
        fleet.health.mark_down("a", "test").await;
        fleet.health.mark_down("b", "test").await;

        let err = fleet.router.route(&conversation("alice")).await.unwrap_err();
        assert!(err.to_string().contains("all backends down"));
        assert!(fleet.admission.usage("alice").unwrap().requests == 0);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let fleet = fleet().await;
        let empty = InferenceRequest::new("alice", Vec::new());
        assert!(matches!(
            fleet.router.route(&empty).await.unwrap_err(),
            SwitchyardError::InvalidRequest(_)
        ));

        let unknown = conversation("alice").with_backend("qwen");
        assert!(matches!(
            fleet.router.route(&unknown).await.unwrap_err(),
            SwitchyardError::InvalidRequest(_)
        ));

        let anonymous = conversation(" ");
        assert!(fleet.router.route(&anonymous).await.is_err());
        assert_eq!(fleet.health.status("a").await, Some(BackendStatus::Ready));
    }

    #[tokio::test]
    async fn test_route_excluding_picks_another_backend() {
        let fleet = fleet().await;
        let request = conversation("alice");
        let first = fleet.router.route(&request).await.unwrap();
        let failed = first.backend.id.clone();
        let ticket = fleet.router.abandon(first);

        let retry = fleet
            .router
            .route_excluding(&request, ticket, &[failed.clone()])
            .await
            .unwrap();
        assert_ne!(retry.backend.id, failed);
        assert_eq!(fleet.admission.usage("alice").unwrap().requests, 1);
    }
}
