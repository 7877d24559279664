//! Routing policy
//!
//! Candidate selection is an ordered chain of predicates. Each filter
//! narrows the candidate set:
//!
//! ```text
//! 1. explicit backend      hard   never here if it empties the set
//! 2. context fits          hard
//! 3. specialization tag    hard
//! 4. ready                 hard   try again later if it empties the set
//! 5. not already failed    hard
//! 6. task affinity         soft   skipped if it would empty the set
//! 7. prefer speed          soft
//! ```
//!
//! A hard filter that leaves nothing ends routing with that filter's
//! diagnostic. Soft filters only express preferences.

use std::collections::HashMap;
use std::sync::Arc;

use switchyard_common::config::{RoutingConfig, TaskRule};
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_proto::{BackendStatus, InferenceRequest};

use crate::descriptor::{BackendDescriptor, DescriptorStore};
use crate::health::BackendSnapshot;

/// Estimate a request's token footprint: prompt characters over
/// `chars_per_token`, rounded up, plus the completion budget.
pub fn estimate_tokens(request: &InferenceRequest, chars_per_token: u32) -> u64 {
    let chars: u64 = request
        .messages
        .iter()
        .map(|m| m.content.chars().count() as u64)
        .sum();
    chars.div_ceil(chars_per_token.max(1) as u64) + request.max_tokens.unwrap_or(0) as u64
}

/// Tag of the first rule with a keyword in `text`
pub fn classify_task<'a>(text: &str, rules: &'a [TaskRule]) -> Option<&'a str> {
    let text = text.to_lowercase();
    rules
        .iter()
        .find(|rule| rule.keywords.iter().any(|k| text.contains(&k.to_lowercase())))
        .map(|rule| rule.tag.as_str())
}

/// Everything a filter may look at
pub struct RouteContext<'a> {
    pub request: &'a InferenceRequest,
    pub estimated_tokens: u64,
    pub explicit: Option<&'a BackendDescriptor>,
    pub task_tag: Option<&'a str>,
    pub health: &'a HashMap<String, BackendSnapshot>,
    pub store: &'a DescriptorStore,
    /// Backends that already failed this request
    pub excluded: &'a [String],
}

impl RouteContext<'_> {
    fn status(&self, backend_id: &str) -> BackendStatus {
        self.health
            .get(backend_id)
            .map(|s| s.status)
            .unwrap_or(BackendStatus::Down)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Must hold; an empty result rejects the request
    Hard,
    /// Preference; ignored when nothing would remain
    Soft,
}

/// One predicate of the chain
pub trait CandidateFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> FilterKind;

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool;

    /// Rejection when this filter removed every one of `remaining`
    fn explain(&self, ctx: &RouteContext<'_>, _remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        SwitchyardError::no_capacity(format!("no backend passes the {} filter", self.name()))
    }
}

struct ExplicitBackend;

impl CandidateFilter for ExplicitBackend {
    fn name(&self) -> &'static str {
        "explicit-backend"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Hard
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        ctx.explicit.map_or(true, |wanted| wanted.id == backend.id)
    }

    fn explain(&self, ctx: &RouteContext<'_>, _remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        let name = ctx.request.backend.as_deref().unwrap_or_default();
        SwitchyardError::invalid_request(format!("unknown backend {}", name))
    }
}

struct ContextFits;

impl CandidateFilter for ContextFits {
    fn name(&self) -> &'static str {
        "context-length"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Hard
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        backend.fits(ctx.estimated_tokens)
    }

    fn explain(&self, ctx: &RouteContext<'_>, remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        match ctx.explicit {
            Some(backend) => SwitchyardError::unservable(format!(
                "request needs ~{} tokens but {} supports at most {}",
                ctx.estimated_tokens, backend.id, backend.max_context_tokens
            )),
            None => {
                let largest = remaining.iter().map(|b| b.max_context_tokens).max().unwrap_or(0);
                SwitchyardError::unservable(format!(
                    "request needs ~{} tokens, exceeding every backend's maximum context ({})",
                    ctx.estimated_tokens, largest
                ))
            }
        }
    }
}

struct Specialization;

impl CandidateFilter for Specialization {
    fn name(&self) -> &'static str {
        "specialization"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Hard
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        ctx.request
            .specialization
            .as_deref()
            .map_or(true, |tag| backend.has_tag(tag))
    }

    fn explain(&self, ctx: &RouteContext<'_>, _remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        let tag = ctx.request.specialization.as_deref().unwrap_or_default();
        if ctx.store.with_tag(tag).is_empty() {
            SwitchyardError::unservable(format!("no backend is tagged {}", tag))
        } else {
            SwitchyardError::unservable(format!(
                "no {} backend can hold ~{} tokens",
                tag, ctx.estimated_tokens
            ))
        }
    }
}

struct Ready;

impl CandidateFilter for Ready {
    fn name(&self) -> &'static str {
        "ready"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Hard
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        ctx.status(&backend.id) == BackendStatus::Ready
    }

    fn explain(&self, ctx: &RouteContext<'_>, remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        let all_down = ctx
            .store
            .all()
            .iter()
            .all(|b| ctx.status(&b.id) == BackendStatus::Down);
        if all_down {
            return SwitchyardError::no_capacity("all backends down");
        }

        let smallest = ctx.store.all().iter().map(|b| b.max_context_tokens).min().unwrap_or(0);
        let requirement = if let Some(backend) = ctx.explicit {
            format!("requires backend {}", backend.id)
        } else if let Some(tag) = ctx.request.specialization.as_deref() {
            format!("requires {} backend", tag)
        } else if ctx.estimated_tokens > smallest {
            format!("requires long-context backend (~{} tokens)", ctx.estimated_tokens)
        } else {
            "requires any backend".to_string()
        };

        let states: Vec<String> = remaining
            .iter()
            .map(|b| format!("{}={}", b.id, ctx.status(&b.id)))
            .collect();
        SwitchyardError::no_capacity(format!("{}, none ready [{}]", requirement, states.join(", ")))
    }
}

struct NotFailed;

impl CandidateFilter for NotFailed {
    fn name(&self) -> &'static str {
        "not-failed"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Hard
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        !ctx.excluded.iter().any(|id| *id == backend.id)
    }

    fn explain(&self, ctx: &RouteContext<'_>, _remaining: &[Arc<BackendDescriptor>]) -> SwitchyardError {
        SwitchyardError::no_capacity(format!(
            "no other ready backend after {} failed",
            ctx.excluded.join(", ")
        ))
    }
}

struct TaskAffinity;

impl CandidateFilter for TaskAffinity {
    fn name(&self) -> &'static str {
        "task-affinity"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Soft
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        ctx.task_tag.map_or(true, |tag| backend.has_tag(tag))
    }
}

struct PreferSpeed {
    fast_tag: String,
}

impl CandidateFilter for PreferSpeed {
    fn name(&self) -> &'static str {
        "prefer-speed"
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Soft
    }

    fn admits(&self, backend: &BackendDescriptor, ctx: &RouteContext<'_>) -> bool {
        !ctx.request.prefer_speed || backend.has_tag(&self.fast_tag)
    }
}

/// Ordered candidate filters
pub struct FilterChain {
    filters: Vec<Box<dyn CandidateFilter>>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn CandidateFilter>>) -> Self {
        Self { filters }
    }

    /// The default chain
    pub fn standard(config: &RoutingConfig) -> Self {
        Self::new(vec![
            Box::new(ExplicitBackend),
            Box::new(ContextFits),
            Box::new(Specialization),
            Box::new(Ready),
            Box::new(NotFailed),
            Box::new(TaskAffinity),
            Box::new(PreferSpeed {
                fast_tag: config.fast_tag.clone(),
            }),
        ])
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Run the chain over every configured backend
    pub fn shortlist(&self, ctx: &RouteContext<'_>) -> Result<Vec<Arc<BackendDescriptor>>> {
        let mut candidates: Vec<Arc<BackendDescriptor>> = ctx.store.all().to_vec();

        for filter in &self.filters {
            let kept: Vec<_> = candidates
                .iter()
                .filter(|b| filter.admits(b, ctx))
                .cloned()
                .collect();

            if kept.is_empty() {
                match filter.kind() {
                    FilterKind::Hard => return Err(filter.explain(ctx, &candidates)),
                    FilterKind::Soft => continue,
                }
            }
            candidates = kept;
        }

        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::tests::{backend, group};
    use switchyard_common::config::ThroughputClass;
    use switchyard_proto::ChatMessage;

    fn store() -> DescriptorStore {
        let mut small = backend("small", "g0", 8_192, &["fast"]);
        small.throughput_class = ThroughputClass::High;
        let mid = backend("mid", "g0", 204_800, &["creative"]);
        let large = backend("large", "g1", 1_048_576, &["long-context", "coding"]);
        DescriptorStore::from_config(&[group("g0", &[0]), group("g1", &[1])], &[small, mid, large]).unwrap()
    }

    fn health(statuses: &[(&str, BackendStatus)]) -> HashMap<String, BackendSnapshot> {
        statuses
            .iter()
            .map(|(id, status)| {
                let snapshot = BackendSnapshot {
                    id: id.to_string(),
                    status: *status,
                    last_probe: None,
                    consecutive_failures: 0,
                    consecutive_successes: 0,
                    in_flight: 0,
                    reported_load: 0,
                };
                (id.to_string(), snapshot)
            })
            .collect()
    }

    fn all_ready() -> HashMap<String, BackendSnapshot> {
        health(&[
            ("small", BackendStatus::Ready),
            ("mid", BackendStatus::Ready),
            ("large", BackendStatus::Ready),
        ])
    }

    fn shortlist(
        request: &InferenceRequest,
        tokens: u64,
        health: &HashMap<String, BackendSnapshot>,
    ) -> Result<Vec<String>> {
        let store = store();
        let config = RoutingConfig::default();
        let explicit = request.backend.as_deref().and_then(|b| store.resolve(b)).map(|b| b.as_ref());
        let ctx = RouteContext {
            request,
            estimated_tokens: tokens,
            explicit,
            task_tag: classify_task(request.last_content(), &config.task_rules),
            health,
            store: &store,
            excluded: &[],
        };
        FilterChain::standard(&config)
            .shortlist(&ctx)
            .map(|c| c.iter().map(|b| b.id.clone()).collect())
    }

    fn request(text: &str) -> InferenceRequest {
        InferenceRequest::new("alice", vec![ChatMessage::user(text)])
    }

    #[test]
    fn test_estimate_tokens() {
        let request = request("abcdefghi").with_max_tokens(100);
        assert_eq!(estimate_tokens(&request, 4), 3 + 100);
    }

    #[test]
    fn test_classify_task() {
        let rules = RoutingConfig::default().task_rules;
        assert_eq!(classify_task("Please DEBUG this function", &rules), Some("coding"));
        assert_eq!(classify_task("write a poem", &rules), Some("creative"));
        assert_eq!(classify_task("what is the weather", &rules), None);
    }

    #[test]
    fn test_context_length_filters_hard() {
        let ids = shortlist(&request("hello"), 500_000, &all_ready()).unwrap();
        assert_eq!(ids, vec!["large"]);

        let err = shortlist(&request("hello"), 2_000_000, &all_ready()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_not_ready_is_retryable_with_diagnostic() {
        let statuses = health(&[
            ("small", BackendStatus::Ready),
            ("mid", BackendStatus::Ready),
            ("large", BackendStatus::Down),
        ]);
        let err = shortlist(&request("hello"), 500_000, &statuses).unwrap_err();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("long-context"));
        assert!(err.to_string().contains("none ready"));

        let down = health(&[
            ("small", BackendStatus::Down),
            ("mid", BackendStatus::Down),
            ("large", BackendStatus::Down),
        ]);
        let err = shortlist(&request("hello"), 10, &down).unwrap_err();
        assert!(err.to_string().contains("all backends down"));
    }

    #[test]
    fn test_degraded_backend_is_not_a_candidate() {
        let statuses = health(&[
            ("small", BackendStatus::Degraded),
            ("mid", BackendStatus::Ready),
            ("large", BackendStatus::Ready),
        ]);
        let ids = shortlist(&request("hello"), 10, &statuses).unwrap();
        assert_eq!(ids, vec!["mid", "large"]);
    }

    #[test]
    fn test_specialization_and_explicit_preference() {
        let ids = shortlist(&request("hi").with_specialization("creative"), 10, &all_ready()).unwrap();
        assert_eq!(ids, vec!["mid"]);

        let err = shortlist(&request("hi").with_specialization("vision"), 10, &all_ready()).unwrap_err();
        assert!(err.to_string().contains("no backend is tagged vision"));

        let ids = shortlist(&request("hi").with_backend("small"), 10, &all_ready()).unwrap();
        assert_eq!(ids, vec!["small"]);

        let err = shortlist(&request("hi").with_backend("small"), 10_000, &all_ready()).unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_soft_filters_only_narrow() {
        // Task keywords pick the coding backend when it fits
        let ids = shortlist(&request("implement this algorithm"), 10, &all_ready()).unwrap();
        assert_eq!(ids, vec!["large"]);

        // Prefer-speed is ignored when no fast backend fits
        let ids = shortlist(&request("hello").with_prefer_speed(true), 100_000, &all_ready()).unwrap();
        assert_eq!(ids, vec!["mid", "large"]);

        let ids = shortlist(&request("hello").with_prefer_speed(true), 10, &all_ready()).unwrap();
        assert_eq!(ids, vec!["small"]);
    }
}
