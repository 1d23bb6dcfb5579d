pub mod domain;
pub mod ratelimit;

pub use domain::{run_cleanup_task, DomainPermit, DomainScheduler, DomainStats, HostProfile, RiskLevel};
pub use ratelimit::{detect_by_status, is_soft_blocked, RateLimitHandler, ViolationRecord};
