//! Proxy Pool Manager (§4.4): fetch raw lists, validate anonymity and
//! latency, periodically revalidate.

use arc_swap::ArcSwap;
use jobcrawler_alerts::AlertDispatcher;
use jobcrawler_metrics::Severity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anonymity {
    Elite,
    Anonymous,
    Transparent,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedProxy {
    pub url: String,
    pub host: String,
    pub port: u16,
    pub protocol: String,
    pub source: String,
    pub response_time_ms: u64,
    pub anonymity: Anonymity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolClass {
    Paid,
    Free,
}

const PAID_PROVIDER_SUBSTRINGS: &[&str] = &[
    "webshare",
    "oxylabs",
    "brightdata",
    "bright-data",
    "smartproxy",
    "zyte",
    "residential",
    "iproyal",
    "packetstream",
    "soax",
    "netnut",
];

/// Substring match against the curated paid-provider list (§4.4).
pub fn classify_pool(urls: &[String]) -> PoolClass {
    if urls.is_empty() {
        return PoolClass::Free;
    }
    let paid = urls.iter().any(|u| {
        let lower = u.to_lowercase();
        PAID_PROVIDER_SUBSTRINGS.iter().any(|p| lower.contains(p))
    });
    if paid {
        PoolClass::Paid
    } else {
        PoolClass::Free
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("initial proxy pool below minimum: got {got}, need {min}")]
    BelowMinimum { got: usize, min: usize },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub min_count: usize,
    pub max_response_time_ms: u64,
    pub echo_endpoint: String,
    pub real_ip: Option<String>,
}

pub struct ProxyPoolManager {
    pool: ArcSwap<Vec<ValidatedProxy>>,
    config: ProxyPoolConfig,
    client: reqwest::Client,
}

impl ProxyPoolManager {
    pub fn new(config: ProxyPoolConfig) -> Self {
        Self {
            pool: ArcSwap::from_pointee(Vec::new()),
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn current(&self) -> Arc<Vec<ValidatedProxy>> {
        self.pool.load_full()
    }

    pub fn class(&self, manual_urls: &[String]) -> PoolClass {
        classify_pool(manual_urls)
    }

    /// Validate one candidate URL against the IP-echo endpoint. Manual
    /// proxies still go through this — only the *anonymity filter* is
    /// skipped for them per §4.4; latency/status are always checked.
    async fn validate_one(
        &self,
        url: &str,
        source: &str,
        enforce_anonymity: bool,
    ) -> Option<ValidatedProxy> {
        let parsed = match reqwest::Url::parse(url) {
            Ok(u) => u,
            Err(_) => return None,
        };
        let host = parsed.host_str()?.to_string();
        let port = parsed.port_or_known_default().unwrap_or(0);
        let protocol = parsed.scheme().to_string();

        let proxy = match reqwest::Proxy::all(url) {
            Ok(p) => p,
            Err(_) => return None,
        };
        let client = match reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_millis(self.config.max_response_time_ms))
            .build()
        {
            Ok(c) => c,
            Err(_) => return None,
        };

        let started = tokio::time::Instant::now();
        let resp = client.get(&self.config.echo_endpoint).send().await.ok()?;
        let elapsed = started.elapsed().as_millis() as u64;

        if resp.status() != reqwest::StatusCode::OK {
            return None;
        }
        if elapsed > self.config.max_response_time_ms {
            return None;
        }

        let anonymity = if !enforce_anonymity {
            Anonymity::Unknown
        } else if let Some(real_ip) = &self.config.real_ip {
            match resp.text().await {
                Ok(body) if !body.contains(real_ip) => Anonymity::Anonymous,
                Ok(_) => return None,
                Err(_) => Anonymity::Unknown,
            }
        } else {
            Anonymity::Unknown
        };

        Some(ValidatedProxy {
            url: url.to_string(),
            host,
            port,
            protocol,
            source: source.to_string(),
            response_time_ms: elapsed,
            anonymity,
        })
    }

    /// Combine manual and free-list sources, validate, and ensure the
    /// resulting pool is at least `min_count`; aborts startup otherwise.
    pub async fn build_initial_pool(
        &self,
        manual_urls: &[String],
        free_list_urls: &[String],
    ) -> Result<(), ProxyError> {
        let mut validated = Vec::new();
        for url in manual_urls {
            if let Some(p) = self.validate_one(url, "manual", false).await {
                validated.push(p);
            }
        }
        for url in free_list_urls {
            if let Some(p) = self.validate_one(url, "free-list", true).await {
                validated.push(p);
            }
        }
        validated.sort_by_key(|p| p.response_time_ms);

        if validated.len() < self.config.min_count {
            error!(
                got = validated.len(),
                min = self.config.min_count,
                "proxy pool below minimum at startup"
            );
            return Err(ProxyError::BelowMinimum {
                got: validated.len(),
                min: self.config.min_count,
            });
        }

        info!(count = validated.len(), "proxy pool initialized");
        self.pool.store(Arc::new(validated));
        Ok(())
    }

    /// Retest each proxy in the current pool and drop failures; if the
    /// result drops below minimum, top up from the free list and warn.
    /// Dispatches a `PoolDepleted` critical alert (§7) if the top-up still
    /// leaves the pool below minimum.
    pub async fn revalidate(&self, free_list_urls: &[String], alerts: &AlertDispatcher) {
        let current = self.pool.load_full();
        let mut still_good = Vec::new();
        for proxy in current.iter() {
            let enforce = proxy.source != "manual";
            if let Some(p) = self.validate_one(&proxy.url, &proxy.source, enforce).await {
                still_good.push(p);
            }
        }

        if still_good.len() < self.config.min_count {
            warn!(
                count = still_good.len(),
                min = self.config.min_count,
                "pool below minimum after revalidation, topping up from free list"
            );
            for url in free_list_urls {
                if still_good.len() >= self.config.min_count {
                    break;
                }
                if let Some(p) = self.validate_one(url, "free-list", true).await {
                    still_good.push(p);
                }
            }
            if still_good.len() < self.config.min_count {
                error!(
                    count = still_good.len(),
                    min = self.config.min_count,
                    "proxy pool still below minimum after top-up"
                );
                alerts
                    .dispatch(
                        Severity::Critical,
                        &format!(
                            "proxy pool depleted: {} proxies left, minimum is {}",
                            still_good.len(),
                            self.config.min_count
                        ),
                    )
                    .await;
            }
        }

        still_good.sort_by_key(|p| p.response_time_ms);
        self.pool.store(Arc::new(still_good));
    }
}

/// Long-lived cooperative revalidation task, started from the entry point
/// with its own cancellation handle (§9, §4.4 lifecycle).
pub async fn run_revalidation_task(
    manager: Arc<ProxyPoolManager>,
    free_list_urls: Vec<String>,
    alerts: Arc<AlertDispatcher>,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => manager.revalidate(&free_list_urls, &alerts).await,
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_proxy_urls_classifies_free() {
        assert_eq!(classify_pool(&[]), PoolClass::Free);
    }

    #[test]
    fn webshare_classifies_paid_case_insensitive() {
        assert_eq!(
            classify_pool(&["http://USER:[email protected]:80".to_string()]),
            PoolClass::Paid
        );
    }

    #[test]
    fn brightdata_classifies_paid() {
        assert_eq!(
            classify_pool(&["http://zone-residential:[email protected]:22225".to_string()]),
            PoolClass::Paid
        );
    }

    #[test]
    fn unrecognized_provider_classifies_free() {
        assert_eq!(
            classify_pool(&["http://203.0.113.5:8080".to_string()]),
            PoolClass::Free
        );
    }
}
