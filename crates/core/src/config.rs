use serde::Deserialize;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub proxy: ProxyPoolConfig,
    pub scheduler: DomainSchedulerConfig,
    pub rate_limit: RateLimitTuning,
    pub dedup: DedupConfig,
    pub metrics: MetricsConfig,
    pub health: HealthConfig,
    pub alert: AlertConfig,
    pub persistence: PersistenceConfig,
    pub orchestrator: OrchestratorConfig,
    pub headless: HeadlessConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub database_url: String,
    pub pool_max: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            pool_max: default_pool_max(),
        }
    }
}

fn default_pool_max() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ProxyPoolConfig {
    pub urls: Vec<String>,
    pub min_count: usize,
    pub refresh_interval_minutes: u64,
    pub max_response_time_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            min_count: 3,
            refresh_interval_minutes: 30,
            max_response_time_ms: 8_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DomainSchedulerConfig {
    pub enabled: bool,
    pub default_max_requests_per_minute: u32,
    pub default_min_delay_ms: u64,
    pub default_jitter_ms: u64,
    pub default_max_concurrent_per_domain: usize,
    pub business_hours_multiplier: f64,
    pub off_hours_start: u32,
    pub off_hours_end: u32,
    pub gate_timeout_secs: u64,
    pub idle_prune_minutes: u64,
}

impl Default for DomainSchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_max_requests_per_minute: 20,
            default_min_delay_ms: 1_000,
            default_jitter_ms: 500,
            default_max_concurrent_per_domain: 2,
            business_hours_multiplier: 1.5,
            off_hours_start: 22,
            off_hours_end: 6,
            gate_timeout_secs: 120,
            idle_prune_minutes: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateLimitTuning {
    pub base_delay_ms: u64,
    pub random_delay_range_ms: u64,
    pub backoff_multiplier: f64,
    pub max_backoff_attempts: u32,
    pub violation_ledger_capacity: usize,
}

impl Default for RateLimitTuning {
    fn default() -> Self {
        Self {
            base_delay_ms: 30_000,
            random_delay_range_ms: 10_000,
            backoff_multiplier: 2.0,
            max_backoff_attempts: 5,
            violation_ledger_capacity: 200,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub enabled: bool,
    pub log_skipped: bool,
    pub retention_days: i64,
    pub flush_interval_secs: u64,
    pub store_path: String,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_skipped: false,
            retention_days: 30,
            flush_interval_secs: 300,
            store_path: "storage/dedup-store.json".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MetricsConfig {
    pub flush_interval_ms: u64,
    pub snapshot_path: String,
    pub response_time_samples: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            flush_interval_ms: 120_000,
            snapshot_path: "storage/metrics-snapshot.json".into(),
            response_time_samples: 100,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HealthConfig {
    pub success_rate_warn_pct: f64,
    pub success_rate_crit_pct: f64,
    pub stale_warn_minutes: i64,
    pub stale_crit_minutes: i64,
    pub memory_warn_mb: f64,
    pub memory_crit_mb: f64,
    pub rate_limit_hits_warn: u64,
    pub rate_limit_hits_crit: u64,
    pub proxy_failures_warn: u64,
    pub proxy_failures_crit: u64,
    pub no_progress_warn_minutes: i64,
    pub report_path: String,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
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
            report_path: "storage/health-report.json".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub slack_webhook_url: Option<String>,
    pub generic_webhook_url: Option<String>,
    pub sendmail_to: Option<String>,
    pub cooldown_minutes: i64,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            slack_webhook_url: None,
            generic_webhook_url: None,
            sendmail_to: None,
            cooldown_minutes: 15,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PersistenceConfig {
    pub concurrency: usize,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self { concurrency: 8 }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub min_jobs_before_headless: u64,
    pub headless_skip_threshold: u64,
    pub min_description_len: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            min_jobs_before_headless: 10,
            headless_skip_threshold: 25,
            min_description_len: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeadlessConfig {
    pub max_concurrency: usize,
    pub session_max_usage_paid: u32,
    pub session_max_usage_free: u32,
    pub session_max_error_score: u32,
    pub navigation_retry_budget: u32,
}

impl Default for HeadlessConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            session_max_usage_paid: 30,
            session_max_usage_free: 10,
            session_max_error_score: 2,
            navigation_retry_budget: 3,
        }
    }
}

impl AppConfig {
    /// Load the optional TOML overlay at `path`, falling back to
    /// `AppConfig::default()` when the file is absent — the same
    /// load-or-fall-back behavior the original entry point used for its
    /// own `config.toml`.
    pub fn load_from_file(path: &str) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Ok(toml::from_str(&raw)?),
            Err(_) => Ok(Self::default()),
        }
    }
}
