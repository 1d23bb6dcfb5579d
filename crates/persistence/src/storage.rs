//! Relational sink for validated, non-duplicate jobs (§6 DB schema).

use jobcrawler_core::{SourceTier, ValidatedJob};
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

#[derive(Clone)]
pub struct Storage {
    pool: PgPool,
}

fn tier_label(tier: SourceTier) -> &'static str {
    match tier {
        SourceTier::PrimaryApi => "primary_api",
        SourceTier::SecondaryRss => "secondary_rss",
        SourceTier::TertiaryHttp => "tertiary_http",
        SourceTier::Headless => "headless",
    }
}

/// SHA-256 of `"{url}||{title}||{company}"` — the DB-level fingerprint
/// (§6), distinct from the dedup store's three-tier bundle.
pub fn db_fingerprint(job: &ValidatedJob) -> String {
    let key = format!("{}||{}||{}", job.raw.url, job.raw.title, job.raw.company);
    let digest = Sha256::digest(key.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

impl Storage {
    pub async fn connect(database_url: &str, pool_max: u32) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(pool_max)
            .connect(database_url)
            .await?;
        info!(pool_max, "connected to postgres");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await?;
        info!("migrations complete");
        Ok(())
    }

    /// Insert one validated job, conflict-on-fingerprint-do-nothing.
    /// Returns `true` if a new row was written.
    pub async fn insert_job(&self, job: &ValidatedJob) -> Result<bool, StorageError> {
        let fingerprint = db_fingerprint(job);
        let tier = job
            .raw
            .source_tier
            .map(tier_label)
            .unwrap_or("primary_api");

        let result = sqlx::query(
            r#"INSERT INTO jobs
                 (url, title, company, source, location, description, salary, job_type,
                  experience, seniority, posted_date, platform, platform_job_id, apply_url,
                  source_tier, fingerprint, scraped_at)
               VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)
               ON CONFLICT (fingerprint) DO NOTHING"#,
        )
        .bind(&job.raw.url)
        .bind(&job.raw.title)
        .bind(&job.raw.company)
        .bind(&job.raw.source)
        .bind(&job.raw.location)
        .bind(&job.raw.description)
        .bind(&job.raw.salary)
        .bind(&job.raw.job_type)
        .bind(&job.raw.experience)
        .bind(&job.raw.seniority)
        .bind(&job.raw.posted_date)
        .bind(&job.platform)
        .bind(&job.raw.platform_job_id)
        .bind(&job.raw.apply_url)
        .bind(tier)
        .bind(&fingerprint)
        .bind(job.scraped_at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    pub async fn count_jobs(&self) -> Result<i64, StorageError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobcrawler_core::RawJob;

    fn job(url: &str, title: &str, company: &str) -> ValidatedJob {
        ValidatedJob {
            raw: RawJob {
                title: title.into(),
                company: company.into(),
                description: "irrelevant for fingerprint".into(),
                url: url.into(),
                source: "test".into(),
                ..Default::default()
            },
            scraped_at: chrono::Utc::now(),
            platform: "test".into(),
        }
    }

    #[test]
    fn db_fingerprint_is_deterministic() {
        let a = job("https://example.com/1", "Engineer", "Acme");
        let b = job("https://example.com/1", "Engineer", "Acme");
        assert_eq!(db_fingerprint(&a), db_fingerprint(&b));
    }

    #[test]
    fn db_fingerprint_differs_on_title() {
        let a = job("https://example.com/1", "Engineer", "Acme");
        let b = job("https://example.com/1", "Manager", "Acme");
        assert_ne!(db_fingerprint(&a), db_fingerprint(&b));
    }
}
