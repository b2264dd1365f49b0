//! Controller configuration

use std::time::Duration;

/// Configuration for a [`Controller`](crate::Controller).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Hostname recorded in the node registry and used by peers
    pub hostname: String,
    /// TCP port for inbound peer/worker-controller connections
    pub port: u16,
    /// Skip the listener and peer/worker dispatch; execute everything
    /// in-process
    pub local_only: bool,
    /// Fixed interval between lease passes
    pub lease_interval: Duration,
    /// Interval between node heartbeat updates
    pub heartbeat_interval: Duration,
    /// Assignments older than this are considered abandoned
    pub overdue_timeout: Duration,
    /// Delay before a failed job becomes eligible again
    pub retry_cooldown: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            port: 9741,
            local_only: false,
            lease_interval: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(30),
            overdue_timeout: Duration::from_secs(3600),
            retry_cooldown: Duration::from_secs(60),
        }
    }
}

impl ControllerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_local_only(mut self, local_only: bool) -> Self {
        self.local_only = local_only;
        self
    }

    pub fn with_lease_interval(mut self, interval: Duration) -> Self {
        self.lease_interval = interval;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_overdue_timeout(mut self, timeout: Duration) -> Self {
        self.overdue_timeout = timeout;
        self
    }

    pub fn with_retry_cooldown(mut self, cooldown: Duration) -> Self {
        self.retry_cooldown = cooldown;
        self
    }
}
