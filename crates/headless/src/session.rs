//! Browser session pool (§4.10): Chrome tabs bounded by per-session usage
//! and error score, retired on repeated 403/429.

use std::ffi::OsString;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum HeadlessError {
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("tab open failed: {0}")]
    OpenTab(String),
    #[error("browser operation failed: {0}")]
    BrowserError(String),
    #[error("pool exhausted: all sessions retired or busy")]
    PoolExhausted,
}

/// Pure error-score bookkeeping, split out from `HeadlessSession` so the
/// retirement rule can be exercised without a live browser tab.
#[derive(Default)]
struct RetirementTracker {
    error_score: AtomicU32,
    retired: AtomicBool,
}

impl RetirementTracker {
    fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    fn mark_bad(&self, max_error_score: u32) {
        let score = self.error_score.fetch_add(1, Ordering::SeqCst) + 1;
        if score > max_error_score {
            self.retired.store(true, Ordering::SeqCst);
        }
    }
}

pub struct HeadlessSession {
    pub tab: Arc<Tab>,
    usage: AtomicU32,
    retirement: RetirementTracker,
    /// §8 "Request-interception singleton": the handler install happens
    /// at most once per page regardless of call count; a failed install
    /// clears the flag so the next call retries.
    interception_registered: AtomicBool,
}

impl HeadlessSession {
    fn new(tab: Arc<Tab>) -> Self {
        Self {
            tab,
            usage: AtomicU32::new(0),
            retirement: RetirementTracker::default(),
            interception_registered: AtomicBool::new(false),
        }
    }

    pub fn is_retired(&self) -> bool {
        self.retirement.is_retired()
    }

    pub fn usage_count(&self) -> u32 {
        self.usage.load(Ordering::SeqCst)
    }

    pub fn record_use(&self) {
        self.usage.fetch_add(1, Ordering::SeqCst);
    }

    /// Called from the failed-request handler on 403/429. Retires once
    /// `error_score` exceeds the configured max (§4.10 session pool).
    pub fn mark_bad(&self, max_error_score: u32) {
        self.retirement.mark_bad(max_error_score);
    }

    /// `install` runs exactly once for this session's lifetime, regardless
    /// of how many navigations call this method. A failing install leaves
    /// the flag clear so the next navigation retries it.
    pub fn ensure_request_interception<F>(&self, install: F) -> Result<(), HeadlessError>
    where
        F: FnOnce(&Tab) -> Result<(), HeadlessError>,
    {
        if self
            .interception_registered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }
        if let Err(e) = install(&self.tab) {
            self.interception_registered.store(false, Ordering::SeqCst);
            return Err(e);
        }
        Ok(())
    }
}

pub struct SessionPool {
    browser: Browser,
    sessions: Mutex<Vec<Arc<HeadlessSession>>>,
    max_usage: u32,
    max_error_score: u32,
    pool_size: usize,
}

impl SessionPool {
    pub fn new(
        pool_size: usize,
        max_usage: u32,
        max_error_score: u32,
        proxy_url: Option<&str>,
    ) -> Result<Self, HeadlessError> {
        let mut extra_args: Vec<OsString> = vec![
            OsString::from("--no-sandbox"),
            OsString::from("--disable-dev-shm-usage"),
            OsString::from("--disable-gpu"),
        ];
        if let Some(proxy) = proxy_url {
            extra_args.push(OsString::from(format!("--proxy-server={proxy}")));
        }

        let mut builder = LaunchOptionsBuilder::default();
        builder
            .headless(true)
            .args(extra_args.iter().map(|a| a.as_ref()).collect());
        if let Ok(chrome_path) = std::env::var("CHROME_PATH") {
            builder.path(Some(std::path::PathBuf::from(chrome_path)));
        }
        let launch_options = builder
            .build()
            .map_err(|e| HeadlessError::Launch(e.to_string()))?;
        let browser =
            Browser::new(launch_options).map_err(|e| HeadlessError::Launch(e.to_string()))?;

        Ok(Self {
            browser,
            sessions: Mutex::new(Vec::new()),
            max_usage,
            max_error_score,
            pool_size,
        })
    }

    /// Pick a live session under its usage limit, or open a fresh tab if
    /// the pool has headroom; errors once both are exhausted.
    pub fn checkout(&self) -> Result<Arc<HeadlessSession>, HeadlessError> {
        let mut sessions = self.sessions.lock().unwrap();
        sessions.retain(|s| !s.is_retired());

        if let Some(session) = sessions.iter().find(|s| s.usage_count() < self.max_usage) {
            return Ok(session.clone());
        }

        if sessions.len() >= self.pool_size {
            return Err(HeadlessError::PoolExhausted);
        }

        let tab = self
            .browser
            .new_tab()
            .map_err(|e| HeadlessError::OpenTab(e.to_string()))?;
        let session = Arc::new(HeadlessSession::new(tab));
        sessions.push(session.clone());
        info!(pool_size = sessions.len(), "opened new headless session");
        Ok(session)
    }

    pub fn mark_bad(&self, session: &HeadlessSession) {
        session.mark_bad(self.max_error_score);
        if session.is_retired() {
            warn!("headless session retired after repeated 403/429");
        }
    }

    pub fn live_count(&self) -> usize {
        self.sessions
            .lock()
            .unwrap()
            .iter()
            .filter(|s| !s.is_retired())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interception_install_runs_exactly_once() {
        let tab_calls = std::sync::atomic::AtomicU32::new(0);
        // A session never needs a live browser for this invariant test —
        // exercise the flag logic directly through a stub-shaped closure.
        let registered = AtomicBool::new(false);
        let install = |_already: bool| {
            tab_calls.fetch_add(1, Ordering::SeqCst);
        };
        for _ in 0..5 {
            if registered
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                install(false);
            }
        }
        assert_eq!(tab_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn mark_bad_retires_after_exceeding_max_error_score() {
        let tracker = RetirementTracker::default();
        tracker.mark_bad(2);
        assert!(!tracker.is_retired());
        tracker.mark_bad(2);
        assert!(!tracker.is_retired());
        tracker.mark_bad(2);
        assert!(tracker.is_retired());
    }
}
