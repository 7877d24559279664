//! Per-caller admission control
//!
//! Every caller identity owns a sliding window of admitted requests, each
//! entry carrying its timestamp and provisional token count. A request is
//! admitted only if both window sums (requests and tokens) stay within the
//! configured ceilings once it is added.
//!
//! Token counts are estimates at admission time and reconciled on
//! completion:
//! - over-estimates are refunded by shrinking the entry
//! - under-estimates are carried as an overage charged against the caller's
//!   *next* admitted request only. A denial leaves it in place, so the
//!   retry-after accounts for it, and it is forgiven once the window empties.
//!
//! Admission never blocks: checks are in-memory and each caller's window is
//! behind its own short-lived lock, so concurrent requests from one caller
//! cannot both slip past a ceiling.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use switchyard_common::config::AdmissionConfig;
use switchyard_common::error::{Result, SwitchyardError};
use switchyard_common::METRICS;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;

/// Proof of admission, handed back for reconciliation or cancellation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionTicket {
    pub id: u64,
    pub caller: String,
    pub estimated_tokens: u64,
    pub admitted_at: Instant,
}

#[derive(Debug, Clone)]
struct WindowEntry {
    at: Instant,
    tokens: u64,
    ticket: u64,
}

/// Rolling window for one caller
#[derive(Debug)]
struct CallerQuota {
    /// Bounded by the request ceiling, oldest first
    entries: VecDeque<WindowEntry>,

    /// Unreconciled usage charged against the next admission
    overage: u64,
}

impl CallerQuota {
    fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            overage: 0,
        }
    }

    /// Drop entries that have left the window
    fn purge(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.at) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    fn tokens(&self) -> u64 {
        self.entries.iter().map(|e| e.tokens).sum()
    }

    /// Time until enough old entries expire for a request of `tokens` to fit.
    /// Overage counts until the window is empty, when it is forgiven.
    fn retry_after(&self, now: Instant, window: Duration, max_requests: usize, max_tokens: u64, tokens: u64) -> Duration {
        let mut count = self.entries.len();
        let mut sum = self.tokens() + self.overage;
        let mut wait = Duration::ZERO;

        for entry in &self.entries {
            if count < max_requests && sum + tokens <= max_tokens {
                break;
            }
            count -= 1;
            sum -= entry.tokens;
            wait = (entry.at + window).saturating_duration_since(now);
            if count == 0 {
                sum = 0;
            }
        }
        wait
    }
}

/// Usage view for one caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaUsage {
    pub requests: u32,
    pub tokens: u64,
    pub overage: u64,
    pub requests_remaining: u32,
    pub tokens_remaining: u64,
}

/// Admission controller for all callers
pub struct AdmissionController {
    config: AdmissionConfig,
    quotas: DashMap<String, Arc<Mutex<CallerQuota>>>,
    next_ticket: AtomicU64,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            config,
            quotas: DashMap::new(),
            next_ticket: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    fn quota(&self, caller: &str) -> Arc<Mutex<CallerQuota>> {
        let capacity = self.config.requests_per_minute as usize;
        let quota = self
            .quotas
            .entry(caller.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(CallerQuota::new(capacity))))
            .value()
            .clone();
        METRICS.admission.tracked_callers.set(self.quotas.len() as i64);
        quota
    }

    /// Admit a request of `estimated_tokens` for `caller`, or explain when to retry
    pub fn admit(&self, caller: &str, estimated_tokens: u64) -> Result<AdmissionTicket> {
        let max_requests = self.config.requests_per_minute as usize;
        let max_tokens = self.config.tokens_per_minute;
        let window = self.config.window();

        if estimated_tokens > max_tokens {
            METRICS.admission.denied.inc();
            return Err(SwitchyardError::invalid_request(format!(
                "request needs ~{} tokens, above the {} tokens/window ceiling",
                estimated_tokens, max_tokens
            )));
        }

        let quota = self.quota(caller);
        let mut quota = quota.lock();
        let now = Instant::now();
        quota.purge(now, window);
        if quota.entries.is_empty() {
            quota.overage = 0;
        }

        let overage = quota.overage;
        let used_tokens = quota.tokens() + overage;
        let requests_fit = quota.entries.len() < max_requests;
        let tokens_fit = used_tokens + estimated_tokens <= max_tokens;

        if !(requests_fit && tokens_fit) {
            let retry_after = quota.retry_after(now, window, max_requests, max_tokens, estimated_tokens);
            METRICS.admission.denied.inc();
            debug!(
                "Denied {}: {} requests, {} tokens (+{} overage) in window, retry in {:?}",
                caller,
                quota.entries.len(),
                used_tokens - overage,
                overage,
                retry_after
            );
            let limit = if requests_fit {
                format!("{} tokens per {}s exceeded", max_tokens, window.as_secs())
            } else {
                format!("{} requests per {}s exceeded", max_requests, window.as_secs())
            };
            return Err(SwitchyardError::quota(limit, retry_after));
        }

        // Carried overage is settled by this admission
        quota.overage = 0;
        let ticket = AdmissionTicket {
            id: self.next_ticket.fetch_add(1, Ordering::Relaxed),
            caller: caller.to_string(),
            estimated_tokens,
            admitted_at: now,
        };
        quota.entries.push_back(WindowEntry {
            at: now,
            tokens: estimated_tokens,
            ticket: ticket.id,
        });
        METRICS.admission.admitted.inc();

        Ok(ticket)
    }

    /// Settle a completed request against its actual token usage
    pub fn reconcile(&self, ticket: &AdmissionTicket, actual_tokens: u64) {
        let Some(quota) = self.quotas.get(&ticket.caller).map(|q| q.value().clone()) else {
            return;
        };
        let mut quota = quota.lock();

        if actual_tokens < ticket.estimated_tokens {
            if let Some(entry) = quota.entries.iter_mut().find(|e| e.ticket == ticket.id) {
                let refund = entry.tokens.saturating_sub(actual_tokens);
                entry.tokens = actual_tokens;
                METRICS.admission.tokens_refunded.inc_by(refund);
            }
        } else if actual_tokens > ticket.estimated_tokens {
            let extra = actual_tokens - ticket.estimated_tokens;
            quota.overage += extra;
            METRICS.admission.tokens_overage.inc_by(extra);
            debug!("Caller {} used {} tokens beyond its estimate", ticket.caller, extra);
        }
    }

    /// Return a ticket whose request never reached a backend
    pub fn cancel(&self, ticket: &AdmissionTicket) {
        let Some(quota) = self.quotas.get(&ticket.caller).map(|q| q.value().clone()) else {
            return;
        };
        let mut quota = quota.lock();
        if let Some(pos) = quota.entries.iter().position(|e| e.ticket == ticket.id) {
            quota.entries.remove(pos);
        }
    }

    /// Current window usage for a caller
    pub fn usage(&self, caller: &str) -> Option<QuotaUsage> {
        let quota = self.quotas.get(caller).map(|q| q.value().clone())?;
        let mut quota = quota.lock();
        quota.purge(Instant::now(), self.config.window());

        let requests = quota.entries.len() as u32;
        let tokens = quota.tokens();
        Some(QuotaUsage {
            requests,
            tokens,
            overage: quota.overage,
            requests_remaining: self.config.requests_per_minute.saturating_sub(requests),
            tokens_remaining: self
                .config
                .tokens_per_minute
                .saturating_sub(tokens + quota.overage),
        })
    }

    /// Forget callers with nothing left in their window
    pub fn purge_idle(&self) -> usize {
        let window = self.config.window();
        let now = Instant::now();
        let before = self.quotas.len();

        // A caller mid-admission holds a second reference; leave it alone
        self.quotas.retain(|_, quota| {
            if Arc::strong_count(quota) > 1 {
                return true;
            }
            let mut quota = quota.lock();
            quota.purge(now, window);
            !quota.entries.is_empty()
        });

        METRICS.admission.tracked_callers.set(self.quotas.len() as i64);
        before - self.quotas.len()
    }

    /// Periodically drop idle callers
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.window());
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let removed = self.purge_idle();
                        if removed > 0 {
                            debug!("Dropped {} idle caller windows", removed);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(rpm: u32, tpm: u64) -> AdmissionController {
        AdmissionController::new(AdmissionConfig {
            requests_per_minute: rpm,
            tokens_per_minute: tpm,
            window_secs: 60,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_ceiling_and_retry_after() {
        let admission = controller(60, 1_000_000);

        admission.admit("alice", 10).unwrap();
        for _ in 1..60 {
            tokio::time::advance(Duration::from_millis(500)).await;
            admission.admit("alice", 10).unwrap();
        }

        let err = admission.admit("alice", 10).unwrap_err();
        match err {
            SwitchyardError::Quota { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_millis(60_000 - 59 * 500))
            }
            other => panic!("expected quota error, got {:?}", other),
        }

        // Other callers are unaffected
        assert!(admission.admit("bob", 10).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let admission = controller(2, 1_000_000);
        admission.admit("alice", 1).unwrap();
        tokio::time::advance(Duration::from_secs(30)).await;
        admission.admit("alice", 1).unwrap();
        assert!(admission.admit("alice", 1).is_err());

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(admission.admit("alice", 1).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_ceiling() {
        let admission = controller(100, 1000);
        admission.admit("alice", 600).unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        admission.admit("alice", 300).unwrap();

        match admission.admit("alice", 200).unwrap_err() {
            SwitchyardError::Quota { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(50))
            }
            other => panic!("expected quota error, got {:?}", other),
        }
        assert!(admission.admit("alice", 100).is_ok());
    }

    #[tokio::test]
    async fn test_oversized_request_is_invalid() {
        let admission = controller(60, 1000);
        let err = admission.admit("alice", 1001).unwrap_err();
        assert!(matches!(err, SwitchyardError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_refund_frees_budget() {
        let admission = controller(60, 1000);
        let ticket = admission.admit("alice", 900).unwrap();
        assert!(admission.admit("alice", 500).is_err());

        admission.reconcile(&ticket, 100);
        assert_eq!(admission.usage("alice").unwrap().tokens, 100);
        assert!(admission.admit("alice", 500).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overage_affects_only_next_admitted_request() {
        let admission = controller(60, 1000);
        let ticket = admission.admit("alice", 400).unwrap();
        admission.reconcile(&ticket, 900);
        assert_eq!(admission.usage("alice").unwrap().overage, 500);

        // 400 in window + 500 overage + 200 > 1000, until the 400 expires
        for _ in 0..2 {
            match admission.admit("alice", 200).unwrap_err() {
                SwitchyardError::Quota { retry_after, .. } => assert_eq!(retry_after, Duration::from_secs(60)),
                other => panic!("expected quota error, got {:?}", other),
            }
        }

        // 400 + 500 + 100 fits exactly and settles the overage
        assert!(admission.admit("alice", 100).is_ok());
        assert_eq!(admission.usage("alice").unwrap().overage, 0);
        assert!(admission.admit("alice", 200).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overage_only_denial_has_nonzero_retry_after() {
        let admission = controller(60, 1000);
        let first = admission.admit("alice", 100).unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        admission.admit("alice", 100).unwrap();
        admission.reconcile(&first, 900);

        // Window holds 200, overage 800: denied by the overage alone
        let retry_after = match admission.admit("alice", 100).unwrap_err() {
            SwitchyardError::Quota { retry_after, .. } => retry_after,
            other => panic!("expected quota error, got {:?}", other),
        };
        assert_eq!(retry_after, Duration::from_secs(40));

        tokio::time::advance(retry_after).await;
        assert!(admission.admit("alice", 100).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_overage_forgiven_when_window_empties() {
        let admission = controller(60, 1000);
        let ticket = admission.admit("alice", 100).unwrap();
        admission.reconcile(&ticket, 1000);
        match admission.admit("alice", 500).unwrap_err() {
            SwitchyardError::Quota { retry_after, .. } => assert_eq!(retry_after, Duration::from_secs(60)),
            other => panic!("expected quota error, got {:?}", other),
        }

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(admission.admit("alice", 1000).is_ok());
    }

    #[tokio::test]
    async fn test_cancel_returns_slot() {
        let admission = controller(1, 1000);
        let ticket = admission.admit("alice", 10).unwrap();
        assert!(admission.admit("alice", 10).is_err());

        admission.cancel(&ticket);
        assert!(admission.admit("alice", 10).is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_admission_never_exceeds_ceiling() {
        let admission = Arc::new(controller(25, 1_000_000));
        let mut handles = Vec::new();
        for _ in 0..100 {
            let admission = admission.clone();
            handles.push(tokio::spawn(async move { admission.admit("alice", 1).is_ok() }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 25);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_idle_callers() {
        let admission = controller(10, 1000);
        admission.admit("alice", 1).unwrap();
        assert_eq!(admission.purge_idle(), 0);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(admission.purge_idle(), 1);
        assert!(admission.usage("alice").is_none());
    }
}
