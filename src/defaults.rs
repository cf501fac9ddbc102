//! Default tunables, centralized the way `k1s0-retry`'s `policy` module
//! centralizes `RetryConfig`: one place callers and tests can read the
//! orchestrator's default retry, timeout and compensation numbers from.
use std::time::Duration;

pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(1000);
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_COMPENSATION_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_COMPENSATION_RETRIES: u32 = 1;
pub const DEFAULT_LOGGING_ENABLED: bool = true;
pub const DEFAULT_SKIP_COMPENSATION: bool = false;
