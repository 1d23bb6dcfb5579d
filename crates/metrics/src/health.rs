//! Health Evaluator (§4.6): threshold checks over a `MetricsSnapshot`,
//! aggregated to a single severity.

use serde::Serialize;

use crate::accumulator::MetricsSnapshot;
use jobcrawler_core::config::HealthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    pub severity: Severity,
    pub reason: String,
    pub value: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub severity: Severity,
    pub checks: Vec<HealthCheck>,
    pub summary: String,
    pub snapshot: MetricsSnapshot,
}

fn check(
    name: &str,
    passed: bool,
    severity: Severity,
    reason: impl Into<String>,
    value: f64,
    threshold: f64,
) -> HealthCheck {
    HealthCheck {
        name: name.to_string(),
        passed,
        severity,
        reason: reason.into(),
        value,
        threshold,
    }
}

/// Evaluate `snapshot` against `config`'s thresholds (§4.6). Aggregate
/// severity is the max severity of any failing check.
pub fn evaluate(snapshot: &MetricsSnapshot, config: &HealthConfig) -> HealthReport {
    let mut checks = Vec::new();

    if !snapshot.success_rate_is_na {
        let rate = snapshot.success_rate_pct;
        if rate < config.success_rate_crit_pct {
            checks.push(check(
                "success_rate",
                false,
                Severity::Critical,
                format!("success rate {rate:.1}% below critical threshold"),
                rate,
                config.success_rate_crit_pct,
            ));
        } else if rate < config.success_rate_warn_pct {
            checks.push(check(
                "success_rate",
                false,
                Severity::Warning,
                format!("success rate {rate:.1}% below warning threshold"),
                rate,
                config.success_rate_warn_pct,
            ));
        } else {
            checks.push(check(
                "success_rate",
                true,
                Severity::Warning,
                "success rate healthy",
                rate,
                config.success_rate_warn_pct,
            ));
        }
    }

    let stale_minutes = snapshot
        .last_job_extracted_at
        .map(|t| (chrono::Utc::now() - t).num_minutes())
        .unwrap_or(i64::MAX);
    if stale_minutes >= config.stale_crit_minutes {
        checks.push(check(
            "minutes_since_last_extracted",
            false,
            Severity::Critical,
            format!("no job extracted in {stale_minutes} minutes"),
            stale_minutes as f64,
            config.stale_crit_minutes as f64,
        ));
    } else if stale_minutes >= config.stale_warn_minutes {
        checks.push(check(
            "minutes_since_last_extracted",
            false,
            Severity::Warning,
            format!("no job extracted in {stale_minutes} minutes"),
            stale_minutes as f64,
            config.stale_warn_minutes as f64,
        ));
    } else {
        checks.push(check(
            "minutes_since_last_extracted",
            true,
            Severity::Warning,
            "extraction is fresh",
            stale_minutes as f64,
            config.stale_warn_minutes as f64,
        ));
    }

    if snapshot.current_memory_mb >= config.memory_crit_mb {
        checks.push(check(
            "current_memory",
            false,
            Severity::Critical,
            format!("memory {:.0}MB above critical threshold", snapshot.current_memory_mb),
            snapshot.current_memory_mb,
            config.memory_crit_mb,
        ));
    } else if snapshot.current_memory_mb >= config.memory_warn_mb {
        checks.push(check(
            "current_memory",
            false,
            Severity::Warning,
            format!("memory {:.0}MB above warning threshold", snapshot.current_memory_mb),
            snapshot.current_memory_mb,
            config.memory_warn_mb,
        ));
    } else {
        checks.push(check(
            "current_memory",
            true,
            Severity::Warning,
            "memory within bounds",
            snapshot.current_memory_mb,
            config.memory_warn_mb,
        ));
    }

    if snapshot.rate_limit_hits >= config.rate_limit_hits_crit {
        checks.push(check(
            "rate_limit_hits",
            false,
            Severity::Critical,
            "rate-limit hits above critical threshold",
            snapshot.rate_limit_hits as f64,
            config.rate_limit_hits_crit as f64,
        ));
    } else if snapshot.rate_limit_hits >= config.rate_limit_hits_warn {
        checks.push(check(
            "rate_limit_hits",
            false,
            Severity::Warning,
            "rate-limit hits above warning threshold",
            snapshot.rate_limit_hits as f64,
            config.rate_limit_hits_warn as f64,
        ));
    }

    if snapshot.proxy_failures >= config.proxy_failures_crit {
        checks.push(check(
            "proxy_failures",
            false,
            Severity::Critical,
            "proxy failures above critical threshold",
            snapshot.proxy_failures as f64,
            config.proxy_failures_crit as f64,
        ));
    } else if snapshot.proxy_failures >= config.proxy_failures_warn {
        checks.push(check(
            "proxy_failures",
            false,
            Severity::Warning,
            "proxy failures above warning threshold",
            snapshot.proxy_failures as f64,
            config.proxy_failures_warn as f64,
        ));
    }

    // "zero jobs after N minutes of uptime" — skipped (insufficient data)
    // below the configured threshold, per §8 boundary behavior.
    let warn_secs = (config.no_progress_warn_minutes * 60) as u64;
    if snapshot.uptime_seconds >= warn_secs && snapshot.extracted == 0 {
        checks.push(check(
            "no_progress",
            false,
            Severity::Warning,
            format!(
                "no jobs extracted after {} minutes of uptime",
                config.no_progress_warn_minutes
            ),
            0.0,
            config.no_progress_warn_minutes as f64,
        ));
    } else {
        checks.push(check(
            "no_progress",
            true,
            Severity::Warning,
            "insufficient data",
            snapshot.uptime_seconds as f64,
            warn_secs as f64,
        ));
    }

    let severity = checks
        .iter()
        .filter(|c| !c.passed)
        .map(|c| c.severity)
        .max()
        .unwrap_or(Severity::Healthy);

    let summary = format!(
        "{:?}: {:.1} jobs/min, {:.1}% dedup ratio, {} stored",
        severity, snapshot.jobs_per_minute, snapshot.dedup_ratio_pct, snapshot.stored
    );

    HealthReport {
        severity,
        checks,
        summary,
        snapshot: snapshot.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accumulator::MetricsAccumulator;

    fn cfg() -> HealthConfig {
        HealthConfig {
            success_rate_warn_pct: 80.0,
            success_rate_crit_pct: 50.0,
            stale_warn_minutes: 5,
            stale_crit_minutes: 15,
            memory_warn_mb: 1024.0,
            memory_crit_mb: 2048.0,
            rate_limit_hits_warn: 10,
            rate_limit_hits_crit: 50,
            proxy_failures_warn: 5,
            proxy_failures_crit: 20,
            no_progress_warn_minutes: 10,
            report_path: "x".into(),
        }
    }

    #[test]
    fn no_progress_check_skipped_when_uptime_too_low() {
        let m = MetricsAccumulator::new(100);
        let report = evaluate(&m.snapshot(), &cfg());
        let no_progress = report.checks.iter().find(|c| c.name == "no_progress").unwrap();
        assert!(no_progress.passed);
        assert_eq!(no_progress.reason, "insufficient data");
    }

    #[test]
    fn aggregate_severity_is_max_of_failing_checks() {
        let m = MetricsAccumulator::new(100);
        for _ in 0..60 {
            m.record_proxy_failure();
        }
        let report = evaluate(&m.snapshot(), &cfg());
        assert_eq!(report.severity, Severity::Critical);
    }

    #[test]
    fn healthy_when_all_checks_pass() {
        let m = MetricsAccumulator::new(100);
        for _ in 0..10 {
            m.record_request_succeeded(5);
        }
        m.record_job_extracted();
        let report = evaluate(&m.snapshot(), &cfg());
        assert_eq!(report.severity, Severity::Healthy);
    }
}
