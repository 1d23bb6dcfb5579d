pub mod accumulator;
pub mod health;

pub use accumulator::{run_flush_task, MetricsAccumulator, MetricsSnapshot};
pub use health::{evaluate, HealthCheck, HealthReport, Severity};
