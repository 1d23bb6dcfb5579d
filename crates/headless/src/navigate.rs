//! Pre/post-navigation hooks and failed-request classification (§4.10).
//! Drives one seed URL under the same domain scheduler and rate-limit
//! handler the non-headless tiers would use if they ever needed backoff.

use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use tracing::{info, warn};

use jobcrawler_metrics::MetricsAccumulator;
use jobcrawler_scheduler::{is_soft_blocked, DomainScheduler, RateLimitHandler};

use crate::session::{HeadlessError, HeadlessSession};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RiskLevel {
    High,
    Medium,
    Low,
}

impl RiskLevel {
    fn goto_timeout(self) -> Duration {
        match self {
            RiskLevel::High => Duration::from_secs(60),
            RiskLevel::Medium => Duration::from_secs(45),
            RiskLevel::Low => Duration::from_secs(30),
        }
    }
}

const VIEWPORTS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1536, 864),
    (1440, 900),
    (1280, 720),
];

fn random_viewport() -> (u32, u32) {
    *VIEWPORTS.choose(&mut rand::thread_rng()).unwrap()
}

/// Override `navigator.webdriver` and a handful of other fingerprint
/// signals headless Chrome leaks by default.
const STEALTH_SCRIPT: &str = r#"
Object.defineProperty(navigator, 'webdriver', { get: () => undefined });
Object.defineProperty(navigator, 'plugins', { get: () => [1, 2, 3] });
Object.defineProperty(navigator, 'languages', { get: () => ['en-US', 'en'] });
window.chrome = window.chrome || { runtime: {} };
"#;

/// Installed once per tab (`ensure_request_interception`'s singleton
/// guard); overrides `fetch`/`XMLHttpRequest` to silently drop tracking
/// pixels and, in paid-proxy mode, heavy media requests.
fn interception_script(paid_mode: bool) -> String {
    let block_media = if paid_mode { "true" } else { "false" };
    format!(
        r#"
(() => {{
    const trackingHosts = ['doubleclick.net', 'google-analytics.com', 'facebook.com/tr'];
    const mediaExt = /\.(png|jpe?g|gif|webp|woff2?|ttf|mp4|webm)(\?|$)/i;
    const blockMedia = {block_media};
    const shouldBlock = (url) => {{
        if (trackingHosts.some((h) => url.includes(h))) return true;
        if (blockMedia && mediaExt.test(url)) return true;
        return false;
    }};
    const origFetch = window.fetch;
    window.fetch = function (input, init) {{
        const url = typeof input === 'string' ? input : input.url;
        if (shouldBlock(url)) return Promise.reject(new Error('blocked'));
        return origFetch.call(this, input, init);
    }};
    const origOpen = XMLHttpRequest.prototype.open;
    XMLHttpRequest.prototype.open = function (method, url, ...rest) {{
        if (shouldBlock(url)) {{ this.__blocked = true; }}
        return origOpen.call(this, method, url, ...rest);
    }};
}})();
"#
    )
}

fn ensure_hooks_installed(
    session: &HeadlessSession,
    paid_mode: bool,
) -> Result<(), HeadlessError> {
    session.ensure_request_interception(|tab| {
        tab.evaluate(STEALTH_SCRIPT, false)
            .map_err(|e| HeadlessError::BrowserError(e.to_string()))?;
        tab.evaluate(&interception_script(paid_mode), false)
            .map_err(|e| HeadlessError::BrowserError(e.to_string()))?;
        Ok(())
    })
}

pub struct NavigationOutcome {
    pub duration_ms: u64,
    pub blocked: bool,
}

/// One full pre-nav / navigate / post-nav cycle for a single seed URL
/// (§4.10). `domain` is the host extracted from `url`.
pub async fn navigate_seed(
    scheduler: &DomainScheduler,
    rate_limiter: &RateLimitHandler,
    metrics: &MetricsAccumulator,
    session: &HeadlessSession,
    domain: &str,
    url: &str,
    risk: RiskLevel,
    paid_mode: bool,
    free_proxy_pool: bool,
) -> Result<NavigationOutcome, HeadlessError> {
    metrics.record_request_started();

    let (width, height) = random_viewport();
    info!(domain, width, height, "navigating with randomized viewport");

    ensure_hooks_installed(session, paid_mode)?;

    scheduler.wait_until_proceed(domain).await;
    let permit = scheduler.record_request(domain);

    let delay_ms = scheduler.compute_delay_ms(domain, free_proxy_pool);
    tokio::time::sleep(Duration::from_millis(delay_ms)).await;

    let started = Instant::now();
    let goto_timeout = risk.goto_timeout();
    let navigated = tokio::time::timeout(goto_timeout, async {
        session
            .tab
            .navigate_to(url)
            .and_then(|tab| tab.wait_until_navigated())
            .map(|_| ())
    })
    .await;

    permit.release();
    session.record_use();

    let duration_ms = started.elapsed().as_millis() as u64;

    let navigated_ok = matches!(navigated, Ok(Ok(())));
    if !navigated_ok {
        metrics.record_request_failed();
        return Ok(NavigationOutcome {
            duration_ms,
            blocked: false,
        });
    }

    metrics.record_request_succeeded(duration_ms);

    let body_text = session
        .tab
        .get_content()
        .unwrap_or_default();
    let title = session
        .tab
        .evaluate("document.title", false)
        .ok()
        .and_then(|r| r.value)
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    if is_soft_blocked(&title, &body_text) {
        metrics.record_rate_limit_hit();
        rate_limiter
            .handle_violation(domain, "soft block detected on page", None)
            .await;
        return Ok(NavigationOutcome {
            duration_ms,
            blocked: true,
        });
    }

    rate_limiter.record_success(domain);
    Ok(NavigationOutcome {
        duration_ms,
        blocked: false,
    })
}

/// After all retries for a request are exhausted (§4.10 failed-request
/// handler). `status` is the last observed HTTP status, if any.
pub async fn handle_failed_request(
    rate_limiter: &RateLimitHandler,
    metrics: &MetricsAccumulator,
    session_pool: &crate::session::SessionPool,
    session: &HeadlessSession,
    domain: &str,
    status: Option<u16>,
) {
    match status {
        Some(429) => {
            session_pool.mark_bad(session);
            metrics.record_rate_limit_hit();
            // sole sleep on this path — §8 sole-backoff-authority invariant
            rate_limiter.handle_violation(domain, "429 rate limited", status).await;
        }
        Some(403) => {
            session_pool.mark_bad(session);
            metrics.record_rate_limit_hit();
            warn!(domain, "403 response, flagging for residential-proxy escalation");
            rate_limiter.handle_violation(domain, "403 hard blocked", status).await;
        }
        Some(407) => {
            metrics.record_proxy_failure();
        }
        Some(code) if code >= 500 => {
            warn!(domain, status = code, "permanent failure after retries exhausted");
        }
        None => {
            warn!(domain, "request timed out after retries exhausted");
        }
        Some(code) => {
            warn!(domain, status = code, "unexpected terminal status after retries");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn goto_timeout_matches_risk_level_table() {
        assert_eq!(RiskLevel::High.goto_timeout(), Duration::from_secs(60));
        assert_eq!(RiskLevel::Medium.goto_timeout(), Duration::from_secs(45));
        assert_eq!(RiskLevel::Low.goto_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn interception_script_blocks_media_only_in_paid_mode() {
        assert!(interception_script(true).contains("blockMedia = true"));
        assert!(interception_script(false).contains("blockMedia = false"));
    }

    #[test]
    fn random_viewport_always_picks_from_the_curated_table() {
        for _ in 0..20 {
            assert!(VIEWPORTS.contains(&random_viewport()));
        }
    }
}
