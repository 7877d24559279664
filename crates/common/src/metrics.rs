//! Metrics collection for Switchyard
//!
//! This module provides Prometheus metrics for observability.
//! Metric handles are cheap clones; hot paths only touch atomics.

use lazy_static::lazy_static;
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;

/// Metrics registry for Switchyard
#[derive(Debug, Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub routing: RoutingMetrics,
    pub admission: AdmissionMetrics,
    pub cache: CacheMetrics,
    pub fleet: FleetMetrics,
}

/// Router and dispatcher metrics
#[derive(Debug, Clone)]
pub struct RoutingMetrics {
    /// Routing decisions, labelled by chosen backend
    pub decisions: IntCounterVec,

    /// Rejections, labelled by kind (no_capacity, rate_limited, invalid_request)
    pub rejections: IntCounterVec,

    /// Backend faults observed by the dispatcher
    pub backend_faults: IntCounterVec,

    /// Requests retried on a second backend
    pub retries: IntCounter,

    /// End-to-end request duration
    pub request_duration: Histogram,

    /// Requests currently being served
    pub active_requests: IntGauge,
}

/// Admission controller metrics
#[derive(Debug, Clone)]
pub struct AdmissionMetrics {
    pub admitted: IntCounter,
    pub denied: IntCounter,

    /// Tokens refunded after over-estimates
    pub tokens_refunded: IntCounter,

    /// Tokens charged after under-estimates
    pub tokens_overage: IntCounter,

    /// Caller identities currently tracked
    pub tracked_callers: IntGauge,
}

/// Prefix cache metrics
#[derive(Debug, Clone)]
pub struct CacheMetrics {
    pub hits: IntCounter,
    pub misses: IntCounter,

    /// Lookups that waited on another request's computation
    pub joined: IntCounter,
    pub evictions: IntCounter,
    pub expirations: IntCounter,
    pub tokens_saved: IntCounter,
    pub entries: IntGauge,
    pub cost_tokens: IntGauge,
}

/// Fleet health and lifecycle metrics
#[derive(Debug, Clone)]
pub struct FleetMetrics {
    /// Backends per status (starting, ready, degraded, down)
    pub backends_by_status: IntGaugeVec,

    /// Failed probes, labelled by backend
    pub probe_failures: IntCounterVec,

    /// Fleet-level alerts raised
    pub alerts: IntCounter,

    /// Startup outcomes, labelled by outcome (ready, timed_out, launch_failed)
    pub startups: IntCounterVec,

    /// Processes force-terminated during shutdown
    pub forced_terminations: IntCounter,
}

lazy_static! {
    /// Global metrics registry instance
    pub static ref METRICS: MetricsRegistry = MetricsRegistry::new();
}

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("valid counter definition")
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    IntCounterVec::new(Opts::new(name, help), labels).expect("valid counter definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("valid gauge definition")
}

impl MetricsRegistry {
    /// Create a new metrics registry
    pub fn new() -> Self {
        let registry = Arc::new(Registry::new());

        // Routing metrics
        let routing = RoutingMetrics {
            decisions: counter_vec(
                "switchyard_routing_decisions_total",
                "Total number of routing decisions",
                &["backend"],
            ),
            rejections: counter_vec(
                "switchyard_rejections_total",
                "Total number of rejected requests",
                &["kind"],
            ),
            backend_faults: counter_vec(
                "switchyard_backend_faults_total",
                "Total number of backend faults during requests",
                &["backend"],
            ),
            retries: counter(
                "switchyard_backend_retries_total",
                "Total number of requests retried on another backend",
            ),
            request_duration: Histogram::with_opts(
                HistogramOpts::new(
                    "switchyard_request_duration_seconds",
                    "End-to-end request duration in seconds",
                )
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]),
            )
            .expect("valid histogram definition"),
            active_requests: gauge(
                "switchyard_active_requests",
                "Current number of requests being served",
            ),
        };

        // Admission metrics
        let admission = AdmissionMetrics {
            admitted: counter("switchyard_admission_admitted_total", "Total admitted requests"),
            denied: counter("switchyard_admission_denied_total", "Total denied requests"),
            tokens_refunded: counter(
                "switchyard_admission_tokens_refunded_total",
                "Tokens refunded after completion",
            ),
            tokens_overage: counter(
                "switchyard_admission_tokens_overage_total",
                "Tokens charged beyond the admission estimate",
            ),
            tracked_callers: gauge(
                "switchyard_admission_tracked_callers",
                "Caller identities with live quota windows",
            ),
        };

        // Cache metrics
        let cache = CacheMetrics {
            hits: counter("switchyard_prefix_cache_hits_total", "Prefix cache hits"),
            misses: counter("switchyard_prefix_cache_misses_total", "Prefix cache misses"),
            joined: counter(
                "switchyard_prefix_cache_joined_total",
                "Lookups served by waiting on an in-flight computation",
            ),
            evictions: counter(
                "switchyard_prefix_cache_evictions_total",
                "Entries evicted to stay within capacity",
            ),
            expirations: counter(
                "switchyard_prefix_cache_expirations_total",
                "Entries removed after their TTL",
            ),
            tokens_saved: counter(
                "switchyard_prefix_cache_tokens_saved_total",
                "Prefix tokens not recomputed thanks to cache hits",
            ),
            entries: gauge("switchyard_prefix_cache_entries", "Live prefix cache entries"),
            cost_tokens: gauge(
                "switchyard_prefix_cache_cost_tokens",
                "Total cost of live prefix cache entries",
            ),
        };

        // Fleet metrics
        let fleet = FleetMetrics {
            backends_by_status: IntGaugeVec::new(
                Opts::new("switchyard_backends", "Backends per lifecycle status"),
                &["status"],
            )
            .expect("valid gauge definition"),
            probe_failures: counter_vec(
                "switchyard_probe_failures_total",
                "Failed liveness probes",
                &["backend"],
            ),
            alerts: counter("switchyard_fleet_alerts_total", "Fleet-level alerts raised"),
            startups: counter_vec(
                "switchyard_backend_startups_total",
                "Backend startup attempts by outcome",
                &["outcome"],
            ),
            forced_terminations: counter(
                "switchyard_forced_terminations_total",
                "Backend processes force-terminated at shutdown",
            ),
        };

        // Register all metrics
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(routing.decisions.clone()),
            Box::new(routing.rejections.clone()),
            Box::new(routing.backend_faults.clone()),
            Box::new(routing.retries.clone()),
            Box::new(routing.request_duration.clone()),
            Box::new(routing.active_requests.clone()),
            Box::new(admission.admitted.clone()),
            Box::new(admission.denied.clone()),
            Box::new(admission.tokens_refunded.clone()),
            Box::new(admission.tokens_overage.clone()),
            Box::new(admission.tracked_callers.clone()),
            Box::new(cache.hits.clone()),
            Box::new(cache.misses.clone()),
            Box::new(cache.joined.clone()),
            Box::new(cache.evictions.clone()),
            Box::new(cache.expirations.clone()),
            Box::new(cache.tokens_saved.clone()),
            Box::new(cache.entries.clone()),
            Box::new(cache.cost_tokens.clone()),
            Box::new(fleet.backends_by_status.clone()),
            Box::new(fleet.probe_failures.clone()),
            Box::new(fleet.alerts.clone()),
            Box::new(fleet.startups.clone()),
            Box::new(fleet.forced_terminations.clone()),
        ];
        for collector in collectors {
            registry
                .register(collector)
                .expect("metric names are unique");
        }

        MetricsRegistry {
            registry,
            routing,
            admission,
            cache,
            fleet,
        }
    }

    /// Gather all metrics as text
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registry() {
        let metrics = MetricsRegistry::new();

        // Record some metrics
        metrics.routing.decisions.with_label_values(&["glm"]).inc();
        metrics.routing.rejections.with_label_values(&["rate_limited"]).inc();
        metrics.fleet.backends_by_status.with_label_values(&["ready"]).set(2);
        metrics.cache.hits.inc();

        // Gather metrics
        let output = metrics.gather();
        assert!(output.contains("switchyard_routing_decisions_total"));
        assert!(output.contains("rate_limited"));
        assert!(output.contains("switchyard_backends"));
        assert!(output.contains("switchyard_prefix_cache_hits_total"));
    }

    #[test]
    fn test_request_timer_observes_on_drop() {
        let metrics = MetricsRegistry::new();
        {
            let _timer = metrics.routing.request_duration.start_timer();
        }
        assert_eq!(metrics.routing.request_duration.get_sample_count(), 1);
    }
}
