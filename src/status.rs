//! `jobcrawler status`: connectivity check plus the latest persisted
//! metrics snapshot and health report, if any were ever flushed.

use anyhow::Result;
use jobcrawler_core::config::AppConfig;
use jobcrawler_metrics::{evaluate, MetricsSnapshot};
use jobcrawler_persistence::Storage;

pub async fn run(config: AppConfig) -> Result<()> {
    let storage = Storage::connect(&config.database.database_url, config.database.pool_max).await?;
    let stored = storage.count_jobs().await?;

    println!("Database:      connected");
    println!("Jobs stored:   {stored}");

    match std::fs::read_to_string(&config.metrics.snapshot_path) {
        Ok(raw) => match serde_json::from_str::<MetricsSnapshot>(&raw) {
            Ok(snapshot) => {
                let report = evaluate(&snapshot, &config.health);
                println!("Health:        {:?}", report.severity);
                println!("Success rate:  {:.1}%", snapshot.success_rate_pct);
                println!("Jobs/min:      {:.2}", snapshot.jobs_per_minute);
                println!("Uptime:        {}s", snapshot.uptime_seconds);
            }
            Err(e) => println!("Metrics snapshot unreadable: {e}"),
        },
        Err(_) => println!("No metrics snapshot yet at {}", config.metrics.snapshot_path),
    }

    Ok(())
}
