//! Centralized configuration for the service supervisor.
//!
//! `TimingConfig` holds the reference timing constants; `SupervisorConfig`
//! is the runtime value handed to a `ServiceSupervisor`, defaulting to them.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reference timings for supervision.
pub struct TimingConfig;

impl TimingConfig {
    /// Poll interval of a health monitor while the service is up.
    pub const MONITOR_INTERVAL: Duration = Duration::from_secs(5);
    /// Delay between teardown attempts.
    pub const STOP_RETRY_INTERVAL: Duration = Duration::from_secs(2);
    /// Failed teardown attempts tolerated before giving up.
    pub const MAX_STOP_RETRIES: u32 = 3;
    /// Wait between spawning a service and verifying it is still up.
    pub const START_VERIFY_DELAY: Duration = Duration::from_secs(2);
    /// Debounce window before a fresh service may be stopped.
    pub const DEFAULT_MIN_UPTIME: Duration = Duration::from_secs(5);
    /// Upper bound on `shutdown_all` waiting for the registry to drain.
    pub const MAX_GLOBAL_EXIT_TIME: Duration = Duration::from_secs(10);
    pub const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(200);
    /// How long one termination attempt waits for the OS to confirm exit.
    pub const TERMINATE_GRACE: Duration = Duration::from_secs(2);
    pub const TERMINATE_POLL_INTERVAL: Duration = Duration::from_millis(50);
}

/// How a process is judged alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LivenessCheck {
    /// The spawned process itself still exists.
    #[default]
    ProcessExists,
    /// The spawned process exists and has at least one child process.
    ///
    /// Matches launchers that run every workload behind a wrapper whose own
    /// PID is not the real workload. A leaf workload with no children is
    /// reported dead under this check.
    HasChildren,
}

/// Runtime configuration for a `ServiceSupervisor`.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub monitor_interval: Duration,
    pub stop_retry_interval: Duration,
    pub max_stop_retries: u32,
    pub start_verify_delay: Duration,
    pub default_min_uptime: Duration,
    pub max_global_exit_time: Duration,
    pub shutdown_poll_interval: Duration,
    pub terminate_grace: Duration,
    pub liveness: LivenessCheck,
    /// Signal delivered to a service's process group on teardown.
    #[cfg(unix)]
    pub termination_signal: nix::sys::signal::Signal,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            monitor_interval: TimingConfig::MONITOR_INTERVAL,
            stop_retry_interval: TimingConfig::STOP_RETRY_INTERVAL,
            max_stop_retries: TimingConfig::MAX_STOP_RETRIES,
            start_verify_delay: TimingConfig::START_VERIFY_DELAY,
            default_min_uptime: TimingConfig::DEFAULT_MIN_UPTIME,
            max_global_exit_time: TimingConfig::MAX_GLOBAL_EXIT_TIME,
            shutdown_poll_interval: TimingConfig::SHUTDOWN_POLL_INTERVAL,
            terminate_grace: TimingConfig::TERMINATE_GRACE,
            liveness: LivenessCheck::default(),
            #[cfg(unix)]
            termination_signal: nix::sys::signal::Signal::SIGTERM,
        }
    }
}

impl SupervisorConfig {
    /// Sub-second timings, for tests and demos.
    pub fn fast() -> Self {
        Self {
            monitor_interval: Duration::from_millis(100),
            stop_retry_interval: Duration::from_millis(50),
            start_verify_delay: Duration::from_millis(300),
            default_min_uptime: Duration::ZERO,
            max_global_exit_time: Duration::from_secs(5),
            shutdown_poll_interval: Duration::from_millis(20),
            terminate_grace: Duration::from_millis(500),
            ..Self::default()
        }
    }

    /// Set the monitor poll interval.
    pub fn with_monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }

    /// Set the delay between teardown attempts.
    pub fn with_stop_retry_interval(mut self, interval: Duration) -> Self {
        self.stop_retry_interval = interval;
        self
    }

    /// Set the number of failed teardown attempts tolerated.
    pub fn with_max_stop_retries(mut self, retries: u32) -> Self {
        self.max_stop_retries = retries;
        self
    }

    /// Set the post-spawn verification delay.
    pub fn with_start_verify_delay(mut self, delay: Duration) -> Self {
        self.start_verify_delay = delay;
        self
    }

    /// Set the debounce window used when a start request gives none.
    pub fn with_default_min_uptime(mut self, min_uptime: Duration) -> Self {
        self.default_min_uptime = min_uptime;
        self
    }

    /// Set the `shutdown_all` wait bound.
    pub fn with_max_global_exit_time(mut self, timeout: Duration) -> Self {
        self.max_global_exit_time = timeout;
        self
    }

    /// Set the per-attempt termination grace period.
    pub fn with_terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Set the liveness check.
    pub fn with_liveness(mut self, liveness: LivenessCheck) -> Self {
        self.liveness = liveness;
        self
    }

    /// Set the teardown signal.
    #[cfg(unix)]
    pub fn with_termination_signal(mut self, signal: nix::sys::signal::Signal) -> Self {
        self.termination_signal = signal;
        self
    }
}
