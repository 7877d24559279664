//! Backend health tracking
//!
//! Each backend moves through a small state machine driven only by probe
//! results and explicit supervisor commands:
//!
//! ```text
//!  Starting --success--> Ready <--N successes-- Degraded
//!                          |                       ^
//!                          +--degraded_after fails-+
//!
//!  any --down_after fails / supervisor--> Down --N successes--> Ready
//! ```
//!
//! Probing runs on its own interval task. The router only ever reads the
//! latest recorded state and never triggers a probe on the request path.
//! In-flight counts are plain atomics so request accounting never contends
//! with the probe loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use switchyard_common::config::HealthConfig;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use switchyard_proto::{BackendHealthReport, BackendStatus, FleetHealth, ProbeResponse};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::descriptor::{BackendDescriptor, DescriptorStore};

/// Liveness/readiness probe against a backend's control endpoint
#[async_trait]
pub trait BackendProbe: Send + Sync {
    async fn probe(&self, backend: &BackendDescriptor) -> Result<ProbeResponse>;
}

/// Fleet-level signal raised on significant transitions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FleetAlert {
    BackendDown { backend_id: String, reason: String },
    BackendRecovered { backend_id: String },
}

/// Mutable per-backend state, owned by the tracker
#[derive(Debug, Clone)]
struct BackendState {
    status: BackendStatus,
    last_probe: Option<Instant>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    /// Load reported by the backend's last probe
    reported_load: u32,
}

impl BackendState {
    fn new() -> Self {
        Self {
            status: BackendStatus::Starting,
            last_probe: None,
            consecutive_failures: 0,
            consecutive_successes: 0,
            reported_load: 0,
        }
    }
}

/// Read-only copy of one backend's state
#[derive(Debug, Clone)]
pub struct BackendSnapshot {
    pub id: String,
    pub status: BackendStatus,
    pub last_probe: Option<Instant>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub in_flight: u32,
    pub reported_load: u32,
}

/// Decrements the backend's in-flight count when dropped
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Health tracker for the whole fleet
pub struct HealthTracker {
    store: Arc<DescriptorStore>,
    probe: Arc<dyn BackendProbe>,
    config: HealthConfig,

    states: RwLock<HashMap<String, BackendState>>,

    /// Fixed at construction, so guards never take the state lock
    in_flight: HashMap<String, Arc<AtomicU32>>,

    alerts: broadcast::Sender<FleetAlert>,
}

impl HealthTracker {
    /// Create a tracker with every backend in `Starting`
    pub fn new(store: Arc<DescriptorStore>, probe: Arc<dyn BackendProbe>, config: HealthConfig) -> Self {
        let states = store
            .all()
            .iter()
            .map(|d| (d.id.clone(), BackendState::new()))
            .collect();
        let in_flight = store
            .all()
            .iter()
            .map(|d| (d.id.clone(), Arc::new(AtomicU32::new(0))))
            .collect();
        let (alerts, _) = broadcast::channel(64);

        METRICS
            .fleet
            .backends_by_status
            .with_label_values(&["starting"])
            .set(store.len() as i64);

        Self {
            store,
            probe,
            config,
            states: RwLock::new(states),
            in_flight,
            alerts,
        }
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<FleetAlert> {
        self.alerts.subscribe()
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Record one probe outcome and apply the resulting transition.
    ///
    /// Returns the new status when the probe changed it. Errors, including
    /// timeouts, count as failures and never leave this function.
    pub async fn record_probe(&self, backend_id: &str, outcome: Result<ProbeResponse>) -> Option<BackendStatus> {
        let (healthy, load) = match &outcome {
            Ok(response) if response.ready => (true, response.load),
            Ok(_) => {
                debug!("Backend {} answered but is not ready", backend_id);
                (false, None)
            }
            Err(e) => {
                debug!("Probe failed for {}: {}", backend_id, e);
                METRICS
                    .fleet
                    .probe_failures
                    .with_label_values(&[backend_id])
                    .inc();
                (false, None)
            }
        };

        let mut states = self.states.write().await;
        let state = states.get_mut(backend_id)?;
        state.last_probe = Some(Instant::now());

        let previous = state.status;
        if healthy {
            state.consecutive_failures = 0;
            state.consecutive_successes += 1;
            state.reported_load = load.unwrap_or(0);

            match previous {
                BackendStatus::Starting => state.status = BackendStatus::Ready,
                BackendStatus::Degraded | BackendStatus::Down
                    if state.consecutive_successes >= self.config.recovery_successes =>
                {
                    state.status = BackendStatus::Ready
                }
                _ => {}
            }
        } else {
            state.consecutive_successes = 0;
            state.consecutive_failures += 1;

            match previous {
                BackendStatus::Ready if state.consecutive_failures >= self.config.degraded_after_failures => {
                    state.status = BackendStatus::Degraded
                }
                BackendStatus::Degraded | BackendStatus::Starting
                    if state.consecutive_failures >= self.config.down_after_failures =>
                {
                    state.status = BackendStatus::Down
                }
                _ => {}
            }
        }

        if state.status == previous {
            return None;
        }

        let failures = state.consecutive_failures;
        let current = state.status;
        Self::update_status_gauges(&states);
        drop(states);

        match current {
            BackendStatus::Down => {
                let reason = format!("{} consecutive probe failures", failures);
                error!("Backend {} is down: {}", backend_id, reason);
                self.raise(FleetAlert::BackendDown {
                    backend_id: backend_id.to_string(),
                    reason,
                });
            }
            BackendStatus::Degraded => {
                warn!("Backend {} degraded after {} failed probes", backend_id, failures)
            }
            BackendStatus::Ready if previous != BackendStatus::Starting => {
                info!("Backend {} recovered ({} -> ready)", backend_id, previous);
                self.raise(FleetAlert::BackendRecovered {
                    backend_id: backend_id.to_string(),
                });
            }
            _ => info!("Backend {}: {} -> {}", backend_id, previous, current),
        }

        Some(current)
    }

    /// Probe every backend concurrently, each bounded by the probe timeout
    pub async fn probe_all(&self) {
        let timeout = self.config.probe_timeout();
        let probes = self.store.all().iter().map(|descriptor| {
            let probe = self.probe.clone();
            async move {
                let outcome = match tokio::time::timeout(timeout, probe.probe(descriptor)).await {
                    Ok(result) => result,
                    Err(_) => Err(SwitchyardError::ProbeTimeout(format!(
                        "{} did not answer within {:?}",
                        descriptor.id, timeout
                    ))),
                };
                (descriptor.id.clone(), outcome)
            }
        });

        for (id, outcome) in futures::future::join_all(probes).await {
            self.record_probe(&id, outcome).await;
        }
    }

    /// Start the periodic probe task
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.probe_interval());
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => self.probe_all().await,
                    _ = shutdown.changed() => {
                        debug!("Health probe loop stopping");
                        break;
                    }
                }
            }
        })
    }

    /// Supervisor command: backend is being launched
    pub async fn mark_starting(&self, backend_id: &str) {
        self.command(backend_id, BackendStatus::Starting, None).await;
    }

    /// Supervisor command: backend passed its startup readiness wait
    pub async fn mark_ready(&self, backend_id: &str) {
        self.command(backend_id, BackendStatus::Ready, None).await;
    }

    /// Supervisor command: backend is gone
    pub async fn mark_down(&self, backend_id: &str, reason: &str) {
        self.command(backend_id, BackendStatus::Down, Some(reason)).await;
    }

    async fn command(&self, backend_id: &str, status: BackendStatus, reason: Option<&str>) {
        let mut states = self.states.write().await;
        let Some(state) = states.get_mut(backend_id) else {
            warn!("Ignoring {} command for unknown backend {}", status, backend_id);
            return;
        };

        let previous = state.status;
        state.status = status;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
        Self::update_status_gauges(&states);
        drop(states);

        if previous == status {
            return;
        }
        info!("Backend {}: {} -> {} (supervisor)", backend_id, previous, status);
        if status == BackendStatus::Down {
            self.raise(FleetAlert::BackendDown {
                backend_id: backend_id.to_string(),
                reason: reason.unwrap_or("stopped by supervisor").to_string(),
            });
        }
    }

    fn raise(&self, alert: FleetAlert) {
        METRICS.fleet.alerts.inc();
        // No subscribers is fine
        let _ = self.alerts.send(alert);
    }

    fn update_status_gauges(states: &HashMap<String, BackendState>) {
        for status in [
            BackendStatus::Starting,
            BackendStatus::Ready,
            BackendStatus::Degraded,
            BackendStatus::Down,
        ] {
            let count = states.values().filter(|s| s.status == status).count();
            METRICS
                .fleet
                .backends_by_status
                .with_label_values(&[status.to_string().as_str()])
                .set(count as i64);
        }
    }

    /// Count a request against a backend's in-flight load
    pub fn begin_request(&self, backend_id: &str) -> Option<InFlightGuard> {
        let counter = self.in_flight.get(backend_id)?.clone();
        counter.fetch_add(1, Ordering::AcqRel);
        Some(InFlightGuard { counter })
    }

    pub fn in_flight(&self, backend_id: &str) -> u32 {
        self.in_flight
            .get(backend_id)
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub async fn status(&self, backend_id: &str) -> Option<BackendStatus> {
        self.states.read().await.get(backend_id).map(|s| s.status)
    }

    /// Consistent snapshot of every backend's state
    pub async fn snapshot(&self) -> HashMap<String, BackendSnapshot> {
        let states = self.states.read().await;
        states
            .iter()
            .map(|(id, state)| {
                let snapshot = BackendSnapshot {
                    id: id.clone(),
                    status: state.status,
                    last_probe: state.last_probe,
                    consecutive_failures: state.consecutive_failures,
                    consecutive_successes: state.consecutive_successes,
                    in_flight: self.in_flight(id),
                    reported_load: state.reported_load,
                };
                (id.clone(), snapshot)
            })
            .collect()
    }

    /// Aggregate view for external monitoring, in descriptor order
    pub async fn fleet_health(&self) -> FleetHealth {
        let snapshot = self.snapshot().await;
        let reports = self
            .store
            .all()
            .iter()
            .filter_map(|d| snapshot.get(&d.id))
            .map(|s| BackendHealthReport {
                id: s.id.clone(),
                status: s.status,
                consecutive_failures: s.consecutive_failures,
                in_flight: s.in_flight,
                last_probe_age_ms: s.last_probe.map(|at| at.elapsed().as_millis() as u64),
            })
            .collect();
        FleetHealth::from_reports(reports)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::descriptor::tests::{backend, group};
    use parking_lot::Mutex;
    use std::time::Duration;

    /// Probe whose answer per backend is set by the test
    #[derive(Default)]
    pub(crate) struct ScriptedProbe {
        healthy: Mutex<HashMap<String, bool>>,
        delay: Mutex<Option<Duration>>,
    }

    impl ScriptedProbe {
        pub(crate) fn set(&self, backend_id: &str, healthy: bool) {
            self.healthy.lock().insert(backend_id.to_string(), healthy);
        }
    }

    #[async_trait]
    impl BackendProbe for ScriptedProbe {
        async fn probe(&self, backend: &BackendDescriptor) -> Result<ProbeResponse> {
            let delay = *self.delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.healthy.lock().get(&backend.id).copied().unwrap_or(false) {
                Ok(ProbeResponse { ready: true, load: None })
            } else {
                Err(SwitchyardError::Connection("connection refused".to_string()))
            }
        }
    }

    fn tracker(ids: &[&str]) -> (Arc<HealthTracker>, Arc<ScriptedProbe>) {
        let backends: Vec<_> = ids.iter().map(|id| backend(id, "g0", 8192, &[])).collect();
        let store = Arc::new(DescriptorStore::from_config(&[group("g0", &[0])], &backends).unwrap());
        let probe = Arc::new(ScriptedProbe::default());
        let tracker = Arc::new(HealthTracker::new(store, probe.clone(), HealthConfig::default()));
        (tracker, probe)
    }

    #[tokio::test]
    async fn test_starting_becomes_ready_on_first_success() {
        let (tracker, probe) = tracker(&["a"]);
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Starting));

        probe.set("a", true);
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Ready));
    }

    #[tokio::test]
    async fn test_degraded_requires_two_successes() {
        let (tracker, probe) = tracker(&["a"]);
        tracker.mark_ready("a").await;

        for _ in 0..2 {
            tracker.probe_all().await;
        }
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Ready));
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Degraded));

        probe.set("a", true);
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Degraded));
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Ready));
    }

    #[tokio::test]
    async fn test_interrupted_recovery_starts_over() {
        let (tracker, probe) = tracker(&["a"]);
        tracker.mark_ready("a").await;
        for _ in 0..3 {
            tracker.probe_all().await;
        }

        probe.set("a", true);
        tracker.probe_all().await;
        probe.set("a", false);
        tracker.probe_all().await;
        probe.set("a", true);
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Degraded));
    }

    #[tokio::test]
    async fn test_sustained_failure_goes_down_with_alert() {
        let (tracker, _probe) = tracker(&["a"]);
        let mut alerts = tracker.subscribe_alerts();
        tracker.mark_ready("a").await;

        for _ in 0..59 {
            tracker.probe_all().await;
        }
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Degraded));
        tracker.probe_all().await;
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Down));

        match alerts.try_recv().unwrap() {
            FleetAlert::BackendDown { backend_id, .. } => assert_eq!(backend_id, "a"),
            other => panic!("unexpected alert {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout_counts_as_failure() {
        let (tracker, probe) = tracker(&["a"]);
        tracker.mark_ready("a").await;
        probe.set("a", true);
        *probe.delay.lock() = Some(Duration::from_secs(10));

        for _ in 0..3 {
            tracker.probe_all().await;
        }
        assert_eq!(tracker.status("a").await, Some(BackendStatus::Degraded));
    }

    #[tokio::test]
    async fn test_in_flight_guard_tracks_load() {
        let (tracker, _probe) = tracker(&["a"]);
        let first = tracker.begin_request("a").unwrap();
        let second = tracker.begin_request("a").unwrap();
        assert_eq!(tracker.in_flight("a"), 2);

        drop(first);
        drop(second);
        assert_eq!(tracker.in_flight("a"), 0);
        assert!(tracker.begin_request("missing").is_none());
    }

    #[tokio::test]
    async fn test_fleet_health_report() {
        let (tracker, _probe) = tracker(&["a", "b"]);
        tracker.mark_ready("a").await;
        tracker.mark_down("b", "launch failed").await;

        let fleet = tracker.fleet_health().await;
        assert_eq!(fleet.ready, 1);
        assert_eq!(fleet.down, 1);
        assert_eq!(fleet.backends[0].id, "a");
    }
}
