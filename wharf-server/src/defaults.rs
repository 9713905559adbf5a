use std::time::Duration;

/// Health checker scan interval and per-probe timeout (§4.5).
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);
pub const HEALTH_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Store snapshot write coalescing window (§4.1).
pub const SNAPSHOT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Blue-green health-poll schedule during a deploy (§4.3 step 4).
pub const DEPLOY_POLL_INITIAL_BACKOFF: Duration = Duration::from_millis(500);
pub const DEPLOY_POLL_BACKOFF_FACTOR: f64 = 1.5;
pub const DEPLOY_POLL_BACKOFF_CAP: Duration = Duration::from_secs(5);
pub const DEPLOY_POLL_TOTAL_BUDGET: Duration = Duration::from_secs(60);
pub const DEPLOY_POLL_CONSECUTIVE_SUCCESSES: u32 = 3;

/// Per-deployment cancellation budget (§5).
pub const DEPLOY_CANCEL_BUDGET: Duration = Duration::from_secs(5 * 60);

/// Drain budget before a removed host's containers are stopped (§9 open
/// question (a), resolved: drain before stop).
pub const REMOVE_DRAIN_BUDGET: Duration = Duration::from_secs(30);

/// Certificate retry queue cadence and cap (§4.4, §3).
pub const CERT_RETRY_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const CERT_RETRY_MAX_ATTEMPTS: u32 = 24;

/// Certificate renewal sweep cadence and the notAfter threshold that
/// triggers re-issuance (§4.4).
pub const CERT_RENEWAL_SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);
pub const CERT_RENEWAL_THRESHOLD_DAYS: i64 = 30;

/// Per-attempt ACME budget (§5).
pub const ACME_ATTEMPT_BUDGET: Duration = Duration::from_secs(2 * 60);

/// Data-plane dial and response-header timeouts (§4.2, §5).
pub const BACKEND_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const BACKEND_HEADER_TIMEOUT: Duration = Duration::from_secs(30);

/// Graceful shutdown drain budget for in-flight requests (§5).
pub const SHUTDOWN_DRAIN_BUDGET: Duration = Duration::from_secs(30);
