//! Domain Scheduler (§4.2): sliding-window RPM + per-domain concurrency
//! semaphore, expressed as a scoped-acquisition guard so release always
//! runs on every exit path, including panics.

use dashmap::DashMap;
use jobcrawler_core::config::DomainSchedulerConfig;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Per-host static tuning; unknown hosts fall back to the scheduler's
/// configured defaults (§3 RateLimitConfig).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone)]
pub struct HostProfile {
    pub max_requests_per_minute: u32,
    pub min_delay_ms: u64,
    pub jitter_ms: u64,
    pub max_concurrent_per_domain: usize,
    pub risk_level: RiskLevel,
}

impl HostProfile {
    pub fn from_defaults(cfg: &DomainSchedulerConfig) -> Self {
        Self {
            max_requests_per_minute: cfg.default_max_requests_per_minute,
            min_delay_ms: cfg.default_min_delay_ms,
            jitter_ms: cfg.default_jitter_ms,
            max_concurrent_per_domain: cfg.default_max_concurrent_per_domain,
            risk_level: RiskLevel::Medium,
        }
    }
}

struct DomainState {
    rpm_window: Mutex<VecDeque<i64>>,
    active: AtomicI64,
    last_touch_ms: AtomicI64,
    total_requests: AtomicU64,
    total_blocked: AtomicU64,
}

impl DomainState {
    fn new() -> Self {
        Self {
            rpm_window: Mutex::new(VecDeque::new()),
            active: AtomicI64::new(0),
            last_touch_ms: AtomicI64::new(now_ms()),
            total_requests: AtomicU64::new(0),
            total_blocked: AtomicU64::new(0),
        }
    }
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Debug, Clone, Copy)]
pub struct DomainStats {
    pub requests_per_minute: usize,
    pub active: i64,
    pub total_requests: u64,
    pub total_blocked: u64,
}

/// RAII guard returned by `recordRequest`. `release` runs exactly once
/// even if both the normal exit path and a failure handler call it
/// (§4.2 concurrency discipline).
pub struct DomainPermit {
    state: Arc<DomainState>,
    released: AtomicBool,
}

impl DomainPermit {
    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            // active MUST NOT go below zero even under races; fetch_update
            // clamps rather than wrapping.
            let _ = self.state.active.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |v| Some((v - 1).max(0)),
            );
        }
    }
}

impl Drop for DomainPermit {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct DomainScheduler {
    states: DashMap<String, Arc<DomainState>>,
    profiles: DashMap<String, HostProfile>,
    config: DomainSchedulerConfig,
}

impl DomainScheduler {
    pub fn new(config: DomainSchedulerConfig) -> Self {
        Self {
            states: DashMap::new(),
            profiles: DashMap::new(),
            config,
        }
    }

    pub fn register_profile(&self, domain: impl Into<String>, profile: HostProfile) {
        self.profiles.insert(domain.into(), profile);
    }

    fn profile_for(&self, domain: &str) -> HostProfile {
        self.profiles
            .get(domain)
            .map(|p| p.clone())
            .unwrap_or_else(|| HostProfile::from_defaults(&self.config))
    }

    fn state_for(&self, domain: &str) -> Arc<DomainState> {
        self.states
            .entry(domain.to_string())
            .or_insert_with(|| Arc::new(DomainState::new()))
            .clone()
    }

    fn prune_window(window: &mut VecDeque<i64>, now: i64) {
        while let Some(&front) = window.front() {
            if now - front > 60_000 {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    /// Cheap predicate; increments the per-domain "blocked" counter when
    /// it returns false.
    pub fn can_proceed(&self, domain: &str) -> bool {
        let profile = self.profile_for(domain);
        let state = self.state_for(domain);
        let now = now_ms();

        let window_len = {
            let mut window = state.rpm_window.lock().unwrap();
            Self::prune_window(&mut window, now);
            window.len()
        };
        let active = state.active.load(Ordering::SeqCst);

        let ok = (window_len as u32) < profile.max_requests_per_minute
            && active < profile.max_concurrent_per_domain as i64;
        if !ok {
            state.total_blocked.fetch_add(1, Ordering::Relaxed);
        }
        ok
    }

    /// Poll `can_proceed` until true, bounded by the configured gate
    /// timeout; on timeout the caller proceeds anyway (logged as a
    /// warning), per §4.2.
    pub async fn wait_until_proceed(&self, domain: &str) {
        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.gate_timeout_secs);
        while !self.can_proceed(domain) {
            if tokio::time::Instant::now() >= deadline {
                warn!(domain, "gate timeout exceeded, proceeding anyway");
                return;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Call exactly before initiating the request; returns a guard whose
    /// `Drop`/`release` performs the matching `releaseRequest`.
    pub fn record_request(&self, domain: &str) -> DomainPermit {
        let state = self.state_for(domain);
        let now = now_ms();
        {
            let mut window = state.rpm_window.lock().unwrap();
            Self::prune_window(&mut window, now);
            window.push_back(now);
        }
        state.active.fetch_add(1, Ordering::SeqCst);
        state.total_requests.fetch_add(1, Ordering::Relaxed);
        state.last_touch_ms.store(now, Ordering::Relaxed);

        DomainPermit {
            state,
            released: AtomicBool::new(false),
        }
    }

    /// Delay to sleep before navigation (§4.2 "Delay computation").
    pub fn compute_delay_ms(&self, domain: &str, free_proxy_pool: bool) -> u64 {
        use chrono::Timelike;
        let profile = self.profile_for(domain);
        let hour = chrono::Local::now().hour();
        let in_business_hours =
            hour >= self.config.off_hours_end && hour < self.config.off_hours_start;
        let multiplier = if in_business_hours {
            self.config.business_hours_multiplier
        } else {
            1.0
        };

        let jitter = if profile.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=profile.jitter_ms)
        } else {
            0
        };
        let mut delay = ((profile.min_delay_ms + jitter) as f64 * multiplier) as u64;
        if free_proxy_pool {
            delay *= 2;
        }
        delay
    }

    pub fn stats(&self, domain: &str) -> DomainStats {
        let state = self.state_for(domain);
        let now = now_ms();
        let rpm = {
            let mut window = state.rpm_window.lock().unwrap();
            Self::prune_window(&mut window, now);
            window.len()
        };
        DomainStats {
            requests_per_minute: rpm,
            active: state.active.load(Ordering::SeqCst),
            total_requests: state.total_requests.load(Ordering::Relaxed),
            total_blocked: state.total_blocked.load(Ordering::Relaxed),
        }
    }

    pub fn reset_counters(&self) {
        for entry in self.states.iter() {
            entry.total_requests.store(0, Ordering::Relaxed);
            entry.total_blocked.store(0, Ordering::Relaxed);
        }
    }

    /// Drop domains idle for longer than the configured prune window.
    pub fn cleanup(&self) {
        let now = now_ms();
        let idle_ms = (self.config.idle_prune_minutes * 60_000) as i64;
        self.states.retain(|_, state| {
            state.active.load(Ordering::SeqCst) > 0
                || now - state.last_touch_ms.load(Ordering::Relaxed) <= idle_ms
        });
    }
}

/// Long-lived cooperative cleanup task, started from the entry point with
/// its own cancellation handle (§9).
pub async fn run_cleanup_task(
    scheduler: Arc<DomainScheduler>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => scheduler.cleanup(),
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DomainSchedulerConfig {
        DomainSchedulerConfig {
            enabled: true,
            default_max_requests_per_minute: 2,
            default_min_delay_ms: 0,
            default_jitter_ms: 0,
            default_max_concurrent_per_domain: 1,
            business_hours_multiplier: 1.0,
            off_hours_start: 22,
            off_hours_end: 6,
            gate_timeout_secs: 1,
            idle_prune_minutes: 10,
        }
    }

    #[test]
    fn release_is_idempotent_and_never_negative() {
        let scheduler = DomainScheduler::new(cfg());
        let permit = scheduler.record_request("example.com");
        permit.release();
        permit.release();
        permit.release();
        assert_eq!(scheduler.stats("example.com").active, 0);
    }

    #[test]
    fn concurrency_gate_blocks_at_limit() {
        let scheduler = DomainScheduler::new(cfg());
        assert!(scheduler.can_proceed("example.com"));
        let _permit = scheduler.record_request("example.com");
        assert!(!scheduler.can_proceed("example.com"));
    }

    #[test]
    fn rpm_gate_blocks_after_max_requests() {
        let scheduler = DomainScheduler::new(cfg());
        let p1 = scheduler.record_request("example.com");
        p1.release();
        let p2 = scheduler.record_request("example.com");
        p2.release();
        assert!(!scheduler.can_proceed("example.com"));
    }

    #[tokio::test]
    async fn wait_until_proceed_times_out_and_proceeds_anyway() {
        let scheduler = DomainScheduler::new(cfg());
        let _permit = scheduler.record_request("example.com");
        let start = tokio::time::Instant::now();
        scheduler.wait_until_proceed("example.com").await;
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[test]
    fn drop_without_explicit_release_still_releases() {
        let scheduler = DomainScheduler::new(cfg());
        {
            let _permit = scheduler.record_request("example.com");
            assert_eq!(scheduler.stats("example.com").active, 1);
        }
        assert_eq!(scheduler.stats("example.com").active, 0);
    }
}
