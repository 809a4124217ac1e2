pub mod metrics;
pub mod retry;

pub use metrics::{PerformanceMonitor, ScanMetrics};
pub use retry::{RetryPolicy, RetryRunner};
