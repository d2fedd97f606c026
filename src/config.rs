//! Process-wide knobs for the kernel pool and execution engine.
//!
//! Loading these values from files, environment variables, or CLI flags is
//! explicitly out of scope for this crate (see `SPEC_FULL.md` §1) — callers
//! construct a [`Config`] directly, overriding fields or using the `with_*`
//! builder methods, and hand it to [`crate::Pool::new`].

use std::time::Duration;

/// Tunables for the kernel pool, health loop, and execution engine.
///
/// Field defaults reproduce the constants of the reference implementation
/// this crate's pool and engine are modeled on.
#[derive(Debug, Clone)]
pub struct Config {
    /// Floor the pool replenishes to.
    pub min_kernels: usize,

    /// Hard cap on simultaneously-owned kernels.
    pub max_kernels: usize,

    /// Idle time after which a kernel is considered stale.
    pub kernel_timeout: Duration,

    /// Period of the background health probe.
    pub health_check_interval: Duration,

    /// Upper bound on execution retries AND on per-kernel failures before
    /// eviction.
    pub max_retry_attempts: u32,

    /// Base of the exponential retry backoff (seconds = base^attempt_index).
    pub retry_backoff_base: f64,

    /// Total per-execution wall-clock ceiling.
    pub ws_timeout: Duration,

    /// WebSocket keepalive ping interval.
    pub ws_ping_interval: Duration,

    /// WebSocket keepalive ping timeout.
    pub ws_ping_timeout: Duration,

    /// Per-receive timeout once the session has been idle for at least
    /// [`Config::activity_idle_threshold`].
    pub no_activity_recv_timeout: Duration,

    /// Per-receive timeout while the session has seen recent activity.
    pub active_recv_timeout: Duration,

    /// How long since the last received envelope before the adaptive
    /// receive timeout widens from `active_recv_timeout` to
    /// `no_activity_recv_timeout`.
    pub activity_idle_threshold: Duration,

    /// Wall-clock ceiling for one admin kernel-create call.
    pub admin_create_timeout: Duration,

    /// Wall-clock ceiling for one admin kernel-delete call.
    pub admin_delete_timeout: Duration,

    /// Wall-clock ceiling for one health/discovery probe.
    pub probe_timeout: Duration,

    /// Kernel spec name passed to the admin create call (e.g. `"python3"`).
    pub kernel_spec_name: String,

    /// Filesystem path that may hold an adoptable pre-existing kernel id.
    pub discover_existing_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            min_kernels: 2,
            max_kernels: 5,
            kernel_timeout: Duration::from_secs(300),
            health_check_interval: Duration::from_secs(30),
            max_retry_attempts: 3,
            retry_backoff_base: 2.0,
            ws_timeout: Duration::from_secs(600),
            ws_ping_interval: Duration::from_secs(30),
            ws_ping_timeout: Duration::from_secs(10),
            no_activity_recv_timeout: Duration::from_secs(30),
            active_recv_timeout: Duration::from_secs(5),
            activity_idle_threshold: Duration::from_secs(60),
            admin_create_timeout: Duration::from_secs(30),
            admin_delete_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            kernel_spec_name: "python3".to_string(),
            discover_existing_path: "/app/uploads/python_kernel_id.txt".to_string(),
        }
    }
}

impl Config {
    /// The per-receive timeout to use given how long it has been since the
    /// session last observed any envelope.
    pub fn recv_timeout(&self, time_since_activity: Duration) -> Duration {
        if time_since_activity > self.activity_idle_threshold {
            self.no_activity_recv_timeout
        } else {
            self.active_recv_timeout
        }
    }

    /// The backoff delay before retry attempt `attempt_index` (0-based).
    pub fn backoff(&self, attempt_index: u32) -> Duration {
        Duration::from_secs_f64(self.retry_backoff_base.powi(attempt_index as i32))
    }

    /// Override `min_kernels`.
    pub fn with_min_kernels(mut self, min_kernels: usize) -> Self {
        self.min_kernels = min_kernels;
        self
    }

    /// Override `max_kernels`.
    pub fn with_max_kernels(mut self, max_kernels: usize) -> Self {
        self.max_kernels = max_kernels;
        self
    }

    /// Override `max_retry_attempts`.
    pub fn with_max_retry_attempts(mut self, max_retry_attempts: u32) -> Self {
        self.max_retry_attempts = max_retry_attempts;
        self
    }
}
