use std::env;
use std::time::Duration;

use frame_proto::MODERN_CALL_TYPE;

/// Wildcard origin; accepted on inbound checks and always used for outbound sends.
pub const ANY_ORIGIN: &str = "*";

/// Tunables for one bridge instance.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Default bound for correlated requests and wait helpers.
    pub request_timeout: Duration,
    pub probe_interval: Duration,
    /// Interval probes without a readiness signal before a reload is attempted.
    pub probe_threshold: u32,
    pub max_attempts: u32,
    pub backoff_step: Duration,
    pub backoff_cap: Duration,
    /// Bound for the one-off modern dialect probe.
    pub transport_probe_timeout: Duration,
    /// How long `call` waits for readiness before forcing it.
    pub ready_timeout: Duration,
    pub poll_interval: Duration,
    /// Explicit inbound origin policy. `None` derives it from `source`.
    pub allowed_origin: Option<String>,
    pub source: Option<String>,
    pub dispatch_type: String,
    pub log_filter: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_millis(10_000),
            probe_interval: Duration::from_millis(1_000),
            probe_threshold: 10,
            max_attempts: 5,
            backoff_step: Duration::from_millis(2_000),
            backoff_cap: Duration::from_millis(8_000),
            transport_probe_timeout: Duration::from_millis(1_500),
            ready_timeout: Duration::from_millis(10_000),
            poll_interval: Duration::from_millis(150),
            allowed_origin: None,
            source: None,
            dispatch_type: MODERN_CALL_TYPE.to_string(),
            log_filter: "info".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from `FRAME_BRIDGE_*` environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            request_timeout: env_millis("FRAME_BRIDGE_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout),
            probe_interval: env_millis("FRAME_BRIDGE_PROBE_INTERVAL_MS")
                .unwrap_or(defaults.probe_interval),
            probe_threshold: env_parse("FRAME_BRIDGE_PROBE_THRESHOLD")
                .unwrap_or(defaults.probe_threshold),
            max_attempts: env_parse("FRAME_BRIDGE_MAX_ATTEMPTS").unwrap_or(defaults.max_attempts),
            backoff_step: env_millis("FRAME_BRIDGE_BACKOFF_STEP_MS")
                .unwrap_or(defaults.backoff_step),
            backoff_cap: env_millis("FRAME_BRIDGE_BACKOFF_CAP_MS").unwrap_or(defaults.backoff_cap),
            transport_probe_timeout: env_millis("FRAME_BRIDGE_TRANSPORT_PROBE_TIMEOUT_MS")
                .unwrap_or(defaults.transport_probe_timeout),
            ready_timeout: env_millis("FRAME_BRIDGE_READY_TIMEOUT_MS")
                .unwrap_or(defaults.ready_timeout),
            poll_interval: env_millis("FRAME_BRIDGE_POLL_INTERVAL_MS")
                .unwrap_or(defaults.poll_interval),
            allowed_origin: env::var("FRAME_BRIDGE_ALLOWED_ORIGIN")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            source: env::var("FRAME_BRIDGE_SOURCE")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            dispatch_type: defaults.dispatch_type,
            log_filter: env::var("RUST_LOG").unwrap_or(defaults.log_filter),
        }
    }

    /// Reload delay for the given 1-based attempt: `min(step * attempt, cap)`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.backoff_step
            .saturating_mul(attempt.max(1))
            .min(self.backoff_cap)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    env::var(var).ok().and_then(|v| v.trim().parse().ok())
}

fn env_millis(var: &str) -> Option<Duration> {
    env_parse::<u64>(var).map(Duration::from_millis)
}
