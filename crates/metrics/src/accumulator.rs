//! Metrics Accumulator (§4.5): synchronous record functions, zero I/O on
//! the hot path, periodic flush to a JSON snapshot file.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sysinfo::{Pid, System};

struct RpmWindow {
    timestamps_ms: std::collections::VecDeque<i64>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

pub struct MetricsAccumulator {
    started: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    extracted: AtomicU64,
    deduplicated: AtomicU64,
    stored: AtomicU64,
    persistence_failed: AtomicU64,
    rate_limit_hits: AtomicU64,
    proxy_failures: AtomicU64,
    rpm_window: Mutex<RpmWindow>,
    response_times_ms: Mutex<std::collections::VecDeque<u64>>,
    response_time_cap: usize,
    peak_memory_mb_bits: AtomicU64,
    last_job_extracted_at_ms: AtomicU64,
    start_time: Instant,
    process_start_epoch_ms: i64,
}

impl MetricsAccumulator {
    pub fn new(response_time_cap: usize) -> Self {
        Self {
            started: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            extracted: AtomicU64::new(0),
            deduplicated: AtomicU64::new(0),
            stored: AtomicU64::new(0),
            persistence_failed: AtomicU64::new(0),
            rate_limit_hits: AtomicU64::new(0),
            proxy_failures: AtomicU64::new(0),
            rpm_window: Mutex::new(RpmWindow {
                timestamps_ms: std::collections::VecDeque::new(),
            }),
            response_times_ms: Mutex::new(std::collections::VecDeque::new()),
            response_time_cap,
            peak_memory_mb_bits: AtomicU64::new(0f64.to_bits()),
            last_job_extracted_at_ms: AtomicU64::new(0),
            start_time: Instant::now(),
            process_start_epoch_ms: now_ms(),
        }
    }

    pub fn record_request_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
        let mut window = self.rpm_window.lock().unwrap();
        window.timestamps_ms.push_back(now_ms());
    }

    pub fn record_request_succeeded(&self, response_time_ms: u64) {
        self.succeeded.fetch_add(1, Ordering::Relaxed);
        let mut samples = self.response_times_ms.lock().unwrap();
        samples.push_back(response_time_ms);
        while samples.len() > self.response_time_cap {
            samples.pop_front();
        }
    }

    pub fn record_request_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_extracted(&self) {
        self.extracted.fetch_add(1, Ordering::Relaxed);
        self.last_job_extracted_at_ms
            .store(now_ms() as u64, Ordering::Relaxed);
    }

    pub fn record_job_deduplicated(&self) {
        self.deduplicated.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_stored(&self) {
        self.stored.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_persistence_failed(&self) {
        self.persistence_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limit_hit(&self) {
        self.rate_limit_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_proxy_failure(&self) {
        self.proxy_failures.fetch_add(1, Ordering::Relaxed);
    }

    fn prune_rpm_window(&self) -> usize {
        let mut window = self.rpm_window.lock().unwrap();
        let cutoff = now_ms() - 60_000;
        while let Some(&front) = window.timestamps_ms.front() {
            if front < cutoff {
                window.timestamps_ms.pop_front();
            } else {
                break;
            }
        }
        window.timestamps_ms.len()
    }

    fn current_memory_mb(&self) -> f64 {
        let mut sys = System::new();
        let pid = Pid::from_u32(std::process::id());
        sys.refresh_process(pid);
        let mb = sys
            .process(pid)
            .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        let mut prev = f64::from_bits(self.peak_memory_mb_bits.load(Ordering::Relaxed));
        while mb > prev {
            match self.peak_memory_mb_bits.compare_exchange(
                prev.to_bits(),
                mb.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = f64::from_bits(actual),
            }
        }
        mb
    }

    /// Pure snapshot of all counters plus the derived values in §3/§4.5.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let extracted = self.extracted.load(Ordering::Relaxed);
        let deduplicated = self.deduplicated.load(Ordering::Relaxed);
        let stored = self.stored.load(Ordering::Relaxed);
        let persistence_failed = self.persistence_failed.load(Ordering::Relaxed);
        let rate_limit_hits = self.rate_limit_hits.load(Ordering::Relaxed);
        let proxy_failures = self.proxy_failures.load(Ordering::Relaxed);

        let denom = succeeded + failed;
        let (success_rate_pct, success_rate_is_na) = if denom < 5 {
            (100.0, true)
        } else {
            (succeeded as f64 / denom as f64 * 100.0, false)
        };

        let requests_per_minute = self.prune_rpm_window();

        let avg_response_time_ms = {
            let samples = self.response_times_ms.lock().unwrap();
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().sum::<u64>() as f64 / samples.len() as f64
            }
        };

        let dedup_ratio_pct = if extracted == 0 {
            0.0
        } else {
            deduplicated as f64 / extracted as f64 * 100.0
        };

        let uptime_seconds = self.start_time.elapsed().as_secs();
        let jobs_per_minute = extracted as f64 * 60.0 / uptime_seconds.max(1) as f64;

        let current_memory_mb = self.current_memory_mb();
        let peak_memory_mb = f64::from_bits(self.peak_memory_mb_bits.load(Ordering::Relaxed));

        let last_extracted_ms = self.last_job_extracted_at_ms.load(Ordering::Relaxed);
        let last_job_extracted_at = if last_extracted_ms == 0 {
            None
        } else {
            chrono::DateTime::from_timestamp_millis(last_extracted_ms as i64)
        };

        MetricsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            succeeded,
            failed,
            extracted,
            deduplicated,
            stored,
            persistence_failed,
            rate_limit_hits,
            proxy_failures,
            success_rate_pct,
            success_rate_is_na,
            jobs_per_minute,
            dedup_ratio_pct,
            requests_per_minute,
            avg_response_time_ms,
            peak_memory_mb,
            current_memory_mb,
            uptime_seconds,
            last_job_extracted_at,
            process_start_epoch_ms: self.process_start_epoch_ms,
        }
    }

    /// Write the current snapshot to `path` (best-effort; logged on
    /// failure by the caller, never panics).
    pub fn flush_to_file(&self, path: &std::path::Path) -> std::io::Result<()> {
        let snapshot = self.snapshot();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        std::fs::write(path, bytes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    pub started: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub extracted: u64,
    pub deduplicated: u64,
    pub stored: u64,
    pub persistence_failed: u64,
    pub rate_limit_hits: u64,
    pub proxy_failures: u64,
    pub success_rate_pct: f64,
    pub success_rate_is_na: bool,
    pub jobs_per_minute: f64,
    pub dedup_ratio_pct: f64,
    pub requests_per_minute: usize,
    pub avg_response_time_ms: f64,
    pub peak_memory_mb: f64,
    pub current_memory_mb: f64,
    pub uptime_seconds: u64,
    pub last_job_extracted_at: Option<chrono::DateTime<chrono::Utc>>,
    pub process_start_epoch_ms: i64,
}

/// Long-lived cooperative flush task (§9): periodic snapshot write, final
/// flush when cancelled.
pub async fn run_flush_task(
    metrics: std::sync::Arc<MetricsAccumulator>,
    path: std::path::PathBuf,
    interval: std::time::Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = metrics.flush_to_file(&path) {
                    tracing::warn!(error = %e, "metrics flush failed");
                }
            }
            _ = cancel.cancelled() => {
                let _ = metrics.flush_to_file(&path);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_rate_is_na_below_five_samples() {
        let m = MetricsAccumulator::new(100);
        m.record_request_succeeded(10);
        m.record_request_succeeded(10);
        let snap = m.snapshot();
        assert!(snap.success_rate_is_na);
        assert_eq!(snap.success_rate_pct, 100.0);
    }

    #[test]
    fn success_rate_computed_once_denominator_reaches_five() {
        let m = MetricsAccumulator::new(100);
        for _ in 0..4 {
            m.record_request_succeeded(10);
        }
        m.record_request_failed();
        let snap = m.snapshot();
        assert!(!snap.success_rate_is_na);
        assert_eq!(snap.success_rate_pct, 80.0);
    }

    #[test]
    fn metrics_consistency_extracted_equals_sum_of_outcomes() {
        let m = MetricsAccumulator::new(100);
        m.record_job_extracted();
        m.record_job_extracted();
        m.record_job_extracted();
        m.record_job_deduplicated();
        m.record_job_stored();
        // one left pending
        let snap = m.snapshot();
        assert_eq!(
            snap.extracted,
            snap.deduplicated + snap.stored + snap.persistence_failed + 1
        );
    }

    #[test]
    fn response_time_ring_buffer_is_bounded() {
        let m = MetricsAccumulator::new(3);
        for i in 0..10u64 {
            m.record_request_succeeded(i);
        }
        let samples = m.response_times_ms.lock().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(*samples.back().unwrap(), 9);
    }

    #[test]
    fn dedup_ratio_pct_handles_zero_extracted() {
        let m = MetricsAccumulator::new(100);
        assert_eq!(m.snapshot().dedup_ratio_pct, 0.0);
    }
}
