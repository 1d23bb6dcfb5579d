mod cli;
mod queries;
mod status;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

// Use mimalloc to prevent memory bloat under high persistence-queue / headless
// session churn (glibc malloc doesn't release memory well under it).
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use jobcrawler_alerts::AlertDispatcher;
use jobcrawler_core::config::AppConfig;
use jobcrawler_core::Query;
use jobcrawler_dedup::DedupStore;
use jobcrawler_headless::{HeadlessController, SeedRequest};
use jobcrawler_metrics::MetricsAccumulator;
use jobcrawler_orchestrator::{JobSink, Orchestrator, TierGroup};
use jobcrawler_persistence::{PersistenceQueue, Storage};
use jobcrawler_proxy::{PoolClass, ProxyPoolManager};
use jobcrawler_scheduler::{DomainScheduler, RateLimitHandler};

use crate::cli::{Cli, Commands};

fn main() -> Result<()> {
    // Custom Tokio runtime: the persistence queue and headless session pool
    // both run many small, short-lived tasks, the same profile the teacher's
    // crawl loop was tuned for.
    let worker_threads: usize = std::env::var("JOBCRAWLER_WORKER_THREADS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|&n| n > 0 && n <= 128)
        .unwrap_or(32);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(worker_threads)
        .thread_stack_size(8 * 1024 * 1024)
        .max_blocking_threads(512)
        .enable_all()
        .build()?;

    runtime.block_on(async_main())
}

async fn async_main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Run => run_pipeline(config).await,
        Commands::Status => status::run(config).await,
    }
}

/// Load the optional TOML overlay (`JOBS_CONFIG_PATH` env, falling back to
/// the `--config` flag), then apply the environment-variable overrides
/// enumerated in §6 on top of it (ambient stack, §10.3).
fn load_config(config_flag: &str) -> Result<AppConfig> {
    let config_path = std::env::var("JOBS_CONFIG_PATH").unwrap_or_else(|_| config_flag.to_string());

    let config_str = std::fs::read_to_string(&config_path).unwrap_or_else(|_| {
        warn!(path = %config_path, "config file not found, using built-in defaults");
        String::new()
    });
    let mut config: AppConfig = toml::from_str(&config_str).context("parsing config file")?;

    apply_env_overrides(&mut config);
    Ok(config)
}

fn env_bool(name: &str, current: bool) -> bool {
    std::env::var(name)
        .map(|v| v != "0" && v.to_lowercase() != "false")
        .unwrap_or(current)
}

fn env_parse<T: std::str::FromStr>(name: &str, current: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(current)
}

fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(v) = std::env::var("DATABASE_URL") {
        config.database.database_url = v;
    }
    config.database.pool_max = env_parse("PG_POOL_MAX", config.database.pool_max);

    if let Ok(v) = std::env::var("PROXY_URLS") {
        config.proxy.urls = v
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    config.proxy.min_count = env_parse("PROXY_MIN_COUNT", config.proxy.min_count);
    config.proxy.refresh_interval_minutes =
        env_parse("PROXY_REFRESH_INTERVAL_MINUTES", config.proxy.refresh_interval_minutes);

    config.orchestrator.min_jobs_before_headless =
        env_parse("MIN_JOBS_BEFORE_HEADLESS", config.orchestrator.min_jobs_before_headless);
    config.orchestrator.headless_skip_threshold =
        env_parse("HEADLESS_SKIP_THRESHOLD", config.orchestrator.headless_skip_threshold);
    config.headless.max_concurrency = env_parse("HEADLESS_MAX_CONCURRENCY", config.headless.max_concurrency);

    config.scheduler.enabled = env_bool("ENABLE_DOMAIN_RATE_LIMITING", config.scheduler.enabled);
    config.rate_limit.base_delay_ms = env_parse("BASE_DELAY_MS", config.rate_limit.base_delay_ms);
    config.rate_limit.random_delay_range_ms =
        env_parse("RANDOM_DELAY_RANGE_MS", config.rate_limit.random_delay_range_ms);
    config.scheduler.off_hours_start = env_parse("OFF_HOURS_START", config.scheduler.off_hours_start);
    config.scheduler.off_hours_end = env_parse("OFF_HOURS_END", config.scheduler.off_hours_end);
    config.rate_limit.backoff_multiplier =
        env_parse("RATE_LIMIT_BACKOFF_MULTIPLIER", config.rate_limit.backoff_multiplier);
    config.rate_limit.max_backoff_attempts =
        env_parse("MAX_BACKOFF_ATTEMPTS", config.rate_limit.max_backoff_attempts);

    config.dedup.enabled = env_bool("DEDUP_ENABLED", config.dedup.enabled);
    config.dedup.log_skipped = env_bool("DEDUP_LOG_SKIPPED", config.dedup.log_skipped);
    config.dedup.retention_days = env_parse("DEDUP_RETENTION_DAYS", config.dedup.retention_days);

    config.alert.enabled = env_bool("ENABLE_ALERTS", config.alert.enabled);
    if let Ok(v) = std::env::var("ALERT_SLACK_WEBHOOK_URL") {
        config.alert.slack_webhook_url = Some(v);
    }
    if let Ok(v) = std::env::var("ALERT_GENERIC_WEBHOOK_URL") {
        config.alert.generic_webhook_url = Some(v);
    }
    if let Ok(v) = std::env::var("ALERT_SENDMAIL_TO") {
        config.alert.sendmail_to = Some(v);
    }
    config.alert.cooldown_minutes = env_parse("ALERT_COOLDOWN_MIN", config.alert.cooldown_minutes);

    config.metrics.flush_interval_ms = env_parse("METRICS_FLUSH_INTERVAL_MS", config.metrics.flush_interval_ms);
    config.persistence.concurrency = env_parse("PERSISTENCE_CONCURRENCY", config.persistence.concurrency);
}

/// One full ingestion pass: the three non-headless tier groups in
/// sequence, then the escalation decision, then the headless tier if
/// warranted (§2, §4.9, §4.10).
async fn run_pipeline(config: AppConfig) -> Result<()> {
    let shutdown = CancellationToken::new();
    spawn_ctrl_c_handler(shutdown.clone());

    let dedup = Arc::new(DedupStore::load(&config.dedup.store_path, config.dedup.retention_days));
    let scheduler = Arc::new(DomainScheduler::new(config.scheduler.clone()));
    let rate_limiter = Arc::new(RateLimitHandler::new(config.rate_limit.clone()));
    let metrics = Arc::new(MetricsAccumulator::new(config.metrics.response_time_samples));
    // Built once and shared with the proxy-revalidation background task so the
    // per-channel cooldown map isn't fragmented across two dispatcher instances.
    let alerts = Arc::new(AlertDispatcher::new(config.alert.clone()));

    let proxy_pool = Arc::new(ProxyPoolManager::new(jobcrawler_proxy::ProxyPoolConfig {
        min_count: config.proxy.min_count,
        max_response_time_ms: config.proxy.max_response_time_ms,
        echo_endpoint: "https://api.ipify.org?format=json".to_string(),
        real_ip: None,
    }));
    // The free-list proxy source is an external collaborator (§1 non-goals);
    // only the manually configured seeds are known to this binary.
    let free_list_urls: Vec<String> = Vec::new();
    proxy_pool
        .build_initial_pool(&config.proxy.urls, &free_list_urls)
        .await
        .context("initial proxy pool below minimum — fatal per §7")?;

    let persistence = Arc::new(PersistenceQueue::new(config.persistence.concurrency));

    let storage = Storage::connect(&config.database.database_url, config.database.pool_max)
        .await
        .context("database unreachable at startup — fatal per §7")?;
    storage.run_migrations().await?;
    let sink: Arc<dyn JobSink> = Arc::new(storage.clone());

    let orchestrator = Orchestrator::new(
        dedup.clone(),
        metrics.clone(),
        persistence.clone(),
        sink,
        config.orchestrator.clone(),
    );

    // Long-lived cooperative background tasks, each sharing the one
    // shutdown token (§5, §9 "timer-driven side effects").
    let flush_handles = spawn_background_tasks(
        dedup.clone(),
        scheduler.clone(),
        proxy_pool.clone(),
        metrics.clone(),
        alerts.clone(),
        &config,
        shutdown.clone(),
    );

    let has_paid_proxy = proxy_pool.class(&config.proxy.urls) == PoolClass::Paid;
    let queries = load_queries();

    // Source adapters are an external collaborator (§1); this binary wires
    // the tier-group cascade but plugs in none by default.
    let tier_groups = vec![
        TierGroup::new("primary_api", Vec::new()),
        TierGroup::new("secondary_rss", Vec::new()),
        TierGroup::new("tertiary_http", Vec::new()),
    ];

    let result = orchestrator.run(&queries, &tier_groups, has_paid_proxy).await;
    info!(
        stored = result.total_stored,
        duplicates = result.total_duplicates_skipped,
        invalid = result.total_validation_failed,
        headless_needed = result.headless_needed,
        reason = %result.headless_reason,
        duration_ms = result.duration_ms,
        "orchestrator run complete"
    );

    if result.headless_needed {
        match run_headless_tier(&config, scheduler.clone(), rate_limiter.clone(), metrics.clone(), has_paid_proxy)
            .await
        {
            Ok(succeeded) => info!(succeeded, "headless tier complete"),
            Err(e) => warn!(error = %e, "headless tier unavailable, continuing without it"),
        }
    }

    persistence.drain().await;

    let health = jobcrawler_metrics::evaluate(&metrics.snapshot(), &config.health);
    if health.severity != jobcrawler_metrics::Severity::Healthy {
        alerts.dispatch(health.severity, &health.summary).await;
    }

    shutdown.cancel();
    for handle in flush_handles {
        let _ = handle.await;
    }
    dedup.close();
    let _ = metrics.flush_to_file(std::path::Path::new(&config.metrics.snapshot_path));

    Ok(())
}

fn spawn_background_tasks(
    dedup: Arc<DedupStore>,
    scheduler: Arc<DomainScheduler>,
    proxy_pool: Arc<ProxyPoolManager>,
    metrics: Arc<MetricsAccumulator>,
    alerts: Arc<AlertDispatcher>,
    config: &AppConfig,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    let dedup_flush = tokio::spawn(jobcrawler_dedup::run_flush_task(
        dedup,
        std::time::Duration::from_secs(config.dedup.flush_interval_secs),
        shutdown.clone(),
    ));
    let scheduler_cleanup = tokio::spawn(jobcrawler_scheduler::run_cleanup_task(
        scheduler,
        std::time::Duration::from_secs(config.scheduler.idle_prune_minutes * 60),
        shutdown.clone(),
    ));
    let proxy_revalidation = tokio::spawn(jobcrawler_proxy::run_revalidation_task(
        proxy_pool,
        Vec::new(),
        alerts,
        std::time::Duration::from_secs(config.proxy.refresh_interval_minutes * 60),
        shutdown.clone(),
    ));
    let metrics_flush = tokio::spawn(jobcrawler_metrics::run_flush_task(
        metrics,
        std::path::PathBuf::from(&config.metrics.snapshot_path),
        std::time::Duration::from_millis(config.metrics.flush_interval_ms),
        shutdown,
    ));

    vec![dedup_flush, scheduler_cleanup, proxy_revalidation, metrics_flush]
}

fn spawn_ctrl_c_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested, draining in-flight work");
            shutdown.cancel();
        }
    });
}

/// Drive the browser tier against whatever seeds the operator configured.
/// Seed discovery from earlier tiers is an external collaborator concern
/// (§1); this binary only knows the explicit `HEADLESS_SEED_URLS` list.
async fn run_headless_tier(
    config: &AppConfig,
    scheduler: Arc<DomainScheduler>,
    rate_limiter: Arc<RateLimitHandler>,
    metrics: Arc<MetricsAccumulator>,
    has_paid_proxy: bool,
) -> Result<usize> {
    let seed_urls: Vec<String> = std::env::var("HEADLESS_SEED_URLS")
        .ok()
        .map(|v| {
            v.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default();

    if seed_urls.is_empty() {
        info!("no HEADLESS_SEED_URLS configured, skipping browser tier");
        return Ok(0);
    }

    let proxy_url = config.proxy.urls.first().map(String::as_str);
    let controller = HeadlessController::new(
        &config.headless,
        scheduler,
        rate_limiter,
        metrics,
        proxy_url,
        has_paid_proxy,
        !has_paid_proxy,
    )?;

    let seeds = seed_urls
        .into_iter()
        .filter_map(|url| {
            let domain = url::Url::parse(&url).ok()?.host_str()?.to_string();
            Some(SeedRequest {
                domain,
                url,
                risk: jobcrawler_headless::RiskLevel::Medium,
            })
        })
        .collect();

    Ok(controller.run_seeds(seeds).await)
}

fn load_queries() -> Vec<Query> {
    match std::env::var("SEARCH_QUERIES") {
        Ok(raw) => match serde_json::from_str::<Vec<Query>>(&raw) {
            Ok(queries) if !queries.is_empty() => queries,
            Ok(_) => queries::default_queries(),
            Err(e) => {
                error!(error = %e, "SEARCH_QUERIES malformed, using defaults");
                queries::default_queries()
            }
        },
        Err(_) => queries::default_queries(),
    }
}
