use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Immutable search input handed to every source adapter.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Query {
    pub keywords: String,
    pub location: Option<String>,
    pub max_results: Option<u32>,
}

/// Ordered group a source adapter runs in; tiers are cheaper/safer first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceTier {
    PrimaryApi,
    SecondaryRss,
    TertiaryHttp,
    Headless,
}

impl Default for SourceTier {
    fn default() -> Self {
        SourceTier::PrimaryApi
    }
}

/// Raw shape returned by a source adapter. No identity yet; produced fresh
/// for every fetch and consumed by the validator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawJob {
    pub title: String,
    pub company: String,
    pub location: Option<String>,
    pub description: String,
    pub url: String,
    pub apply_url: Option<String>,
    pub salary: Option<String>,
    pub job_type: Option<String>,
    pub experience: Option<String>,
    pub posted_date: Option<String>,
    pub seniority: Option<String>,
    pub source: String,
    pub platform_job_id: Option<String>,
    pub source_tier: Option<SourceTier>,
}

/// Post-validation record. Invariants enforced by `validate` and never
/// re-checked afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedJob {
    pub raw: RawJob,
    pub scraped_at: chrono::DateTime<chrono::Utc>,
    pub platform: String,
}

impl ValidatedJob {
    /// Promote a `RawJob` to a `ValidatedJob`, enforcing §3's schema.
    ///
    /// `min_description_len` is a parameter rather than a constant because
    /// the two save-pipeline copies in the upstream codebase disagreed on
    /// it (10 vs 50); the reconciled contract in §4.9 uses 10 everywhere,
    /// but callers that need the stricter bound can still ask for it.
    pub fn validate(
        raw: RawJob,
        platform: impl Into<String>,
        min_description_len: usize,
    ) -> Result<Self, CoreError> {
        if raw.title.trim().chars().count() < 2 {
            return Err(CoreError::ValidationFailure(format!(
                "title too short: {:?}",
                raw.title
            )));
        }
        if raw.description.trim().chars().count() < min_description_len {
            return Err(CoreError::ValidationFailure(format!(
                "description shorter than {min_description_len} chars"
            )));
        }
        let parsed = url::Url::parse(&raw.url)
            .map_err(|_| CoreError::ValidationFailure(format!("url not absolute: {}", raw.url)))?;
        if parsed.cannot_be_a_base() {
            return Err(CoreError::ValidationFailure(format!(
                "url not absolute: {}",
                raw.url
            )));
        }

        Ok(ValidatedJob {
            raw,
            scraped_at: chrono::Utc::now(),
            platform: platform.into(),
        })
    }
}

/// What a single source adapter returned for one query. Adapters MUST NOT
/// throw out of `fetch` — a failed attempt is expressed via `error`, not a
/// `Result::Err`, so one adapter's trouble never aborts its siblings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SourceResult {
    pub source: String,
    pub tier: SourceTier,
    pub jobs: Vec<RawJob>,
    pub duration_ms: u64,
    pub error: Option<String>,
}

/// Shared shape every upstream collector implements. HTML/selector parsing,
/// pagination, and CAPTCHA handling are the adapter's own concern; only the
/// output contract is specified here.
#[async_trait]
pub trait SourceAdapter: Send + Sync + 'static {
    fn name(&self) -> &str;
    fn tier(&self) -> SourceTier;
    async fn fetch(&self, query: &Query) -> SourceResult;
}
