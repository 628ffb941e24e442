//! Engine configuration.
//!
//! Every knob has an environment override so deployments tune timeouts
//! without code changes; the builder methods exist for tests and embedders.

use std::time::Duration;

/// Default callee-side execution timeout (hooks + handler + output guards).
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_millis(25_000);

/// Default caller-side wait timeout, also used as the publish TTL.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(60_000);

/// Default service load allowance added to the wait timeout for queue expiry.
pub const DEFAULT_SERVICE_LOAD_TIME: Duration = Duration::from_millis(60_000);

/// Default per-channel prefetch.
pub const DEFAULT_PREFETCH: u16 = 1000;

/// RPC engine configuration.
#[derive(Debug, Clone)]
#[must_use]
pub struct RpcConfig {
    /// Callee-side execution timeout covering hooks and handler.
    pub exec_timeout: Duration,
    /// Caller-side wait timeout; requests carry it as their broker TTL.
    pub wait_timeout: Duration,
    /// Slack added to `wait_timeout` when computing procedure queue expiry.
    pub service_load_time: Duration,
    /// Prefetch applied to every consumer channel.
    pub prefetch: u16,
    /// Disables the decode-time reviver for this service instance.
    pub no_reviver: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            exec_timeout: DEFAULT_EXEC_TIMEOUT,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            service_load_time: DEFAULT_SERVICE_LOAD_TIME,
            prefetch: DEFAULT_PREFETCH,
            no_reviver: false,
        }
    }
}

impl RpcConfig {
    /// Loads configuration from the environment:
    /// `ISLAND_RPC_EXEC_TIMEOUT_MS`, `ISLAND_RPC_WAIT_TIMEOUT_MS`,
    /// `ISLAND_SERVICE_LOAD_TIME_MS`, `RPC_PREFETCH` and `RPC_NO_REVIVER`.
    /// Unset or unparseable values fall back to the defaults.
    pub fn from_env() -> Self {
        Self {
            exec_timeout: env_millis("ISLAND_RPC_EXEC_TIMEOUT_MS", DEFAULT_EXEC_TIMEOUT),
            wait_timeout: env_millis("ISLAND_RPC_WAIT_TIMEOUT_MS", DEFAULT_WAIT_TIMEOUT),
            service_load_time: env_millis("ISLAND_SERVICE_LOAD_TIME_MS", DEFAULT_SERVICE_LOAD_TIME),
            prefetch: env_u16("RPC_PREFETCH", DEFAULT_PREFETCH),
            no_reviver: env_flag("RPC_NO_REVIVER"),
        }
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout = timeout;
        self
    }

    pub fn with_wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn with_service_load_time(mut self, load_time: Duration) -> Self {
        self.service_load_time = load_time;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn without_reviver(mut self) -> Self {
        self.no_reviver = true;
        self
    }

    /// Server-side expiry for procedure queues, reaping orphans once every
    /// caller has given up and a restarting service has had time to come
    /// back.
    #[must_use]
    pub fn queue_expires(&self) -> Duration {
        self.wait_timeout + self.service_load_time
    }
}

fn env_millis(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> u16 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| {
            let v = v.trim().to_ascii_lowercase();
            v == "1" || v == "true"
        })
        .unwrap_or(false)
}
