//! Per-service health monitoring and teardown.
//!
//! One `HealthMonitor` task runs for every registered service. It polls the
//! service's processes while `MONITORING`, and on a stop request or a dead
//! process switches to `STOPPING`: processes are terminated last-registered
//! first, failed attempts are retried a bounded number of times, and the
//! task ends in `STOPPED` (record removed) or `FAILED` (record kept until
//! acknowledged).

use crate::cancel::CancellationToken;
use crate::config::SupervisorConfig;
use crate::registry::ServiceRegistry;
use crate::status::{publish, StatusEvent, StatusKind, StatusSender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LifecycleState {
    Monitoring,
    Stopping,
    Stopped,
    Failed,
}

impl LifecycleState {
    /// Whether a monitor task is still driving the service.
    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Monitoring | LifecycleState::Stopping)
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleState::Monitoring => write!(f, "monitoring"),
            LifecycleState::Stopping => write!(f, "stopping"),
            LifecycleState::Stopped => write!(f, "stopped"),
            LifecycleState::Failed => write!(f, "failed"),
        }
    }
}

/// Timings a monitor runs on.
#[derive(Debug, Clone, Copy)]
pub struct MonitorTimings {
    pub poll_interval: Duration,
    pub stop_retry_interval: Duration,
    pub max_stop_retries: u32,
}

impl From<&SupervisorConfig> for MonitorTimings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            poll_interval: config.monitor_interval,
            stop_retry_interval: config.stop_retry_interval,
            max_stop_retries: config.max_stop_retries,
        }
    }
}

/// Background supervisor of one service instance.
pub struct HealthMonitor {
    service: String,
    instance_id: Uuid,
    registry: Arc<ServiceRegistry>,
    stop: CancellationToken,
    status: StatusSender,
    timings: MonitorTimings,
}

impl HealthMonitor {
    pub fn new(
        service: impl Into<String>,
        instance_id: Uuid,
        registry: Arc<ServiceRegistry>,
        stop: CancellationToken,
        status: StatusSender,
        timings: MonitorTimings,
    ) -> Self {
        Self {
            service: service.into(),
            instance_id,
            registry,
            stop,
            status,
            timings,
        }
    }

    /// Run the monitor on the current tokio runtime.
    pub fn spawn(self) -> JoinHandle<LifecycleState> {
        tokio::spawn(self.run())
    }

    /// Drive the service to a terminal state.
    pub async fn run(self) -> LifecycleState {
        info!(service = %self.service, instance = %self.instance_id, "Health monitor started");

        let mut state = LifecycleState::Monitoring;
        while state.is_active() {
            state = match state {
                LifecycleState::Monitoring => self.watch().await,
                LifecycleState::Stopping => self.teardown().await,
                terminal => terminal,
            };
        }

        info!(service = %self.service, %state, "Health monitor exited");
        state
    }

    fn event(&self, kind: StatusKind, description: impl Into<String>) -> StatusEvent {
        StatusEvent::new(self.service.clone(), self.instance_id, kind, description)
    }

    async fn watch(&self) -> LifecycleState {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.timings.poll_interval) => {}
                _ = self.stop.cancelled() => {}
            }

            if self.stop.is_cancelled() {
                debug!(service = %self.service, "Stop requested");
                return LifecycleState::Stopping;
            }

            let Some(processes) = self.registry.processes(&self.service) else {
                warn!(service = %self.service, "Service vanished from the registry");
                return LifecycleState::Stopped;
            };

            for record in &processes {
                if !record.process.is_alive().await {
                    warn!(
                        service = %self.service,
                        pid = record.pid(),
                        "`{}` is no longer running",
                        record.command
                    );
                    publish(
                        &self.status,
                        self.event(StatusKind::Exception, "process exited unexpectedly")
                            .with_process(record.command.clone(), record.pid()),
                    );
                    // State first, so a concurrent stop sees it as already stopping.
                    self.registry
                        .set_state(&self.service, LifecycleState::Stopping);
                    self.stop.cancel();
                    return LifecycleState::Stopping;
                }
            }

            if self.stop.is_cancelled() {
                return LifecycleState::Stopping;
            }
            publish(&self.status, self.event(StatusKind::Running, "running"));
        }
    }

    async fn teardown(&self) -> LifecycleState {
        let mut retries = 0u32;

        loop {
            let processes = self.registry.processes(&self.service).unwrap_or_default();
            let mut failures = Vec::new();

            // Last started first: later processes may depend on earlier ones.
            for record in processes.iter().rev() {
                match record.process.terminate().await {
                    Ok(true) => {
                        self.registry.retire_process(&self.service, record.pid());
                    }
                    Ok(false) => failures.push(format!(
                        "`{}` (pid {}) is still running",
                        record.command,
                        record.pid()
                    )),
                    Err(e) => failures.push(format!(
                        "`{}` (pid {}): {}",
                        record.command,
                        record.pid(),
                        e
                    )),
                }
            }

            if failures.is_empty() {
                // The record went away with its last retired process.
                info!(service = %self.service, "Service stopped");
                publish(&self.status, self.event(StatusKind::Over, "stopped"));
                return LifecycleState::Stopped;
            }

            retries += 1;
            if retries > self.timings.max_stop_retries {
                error!(
                    service = %self.service,
                    attempts = retries,
                    "Giving up on teardown: {}",
                    failures.join("; ")
                );
                self.registry.set_state(&self.service, LifecycleState::Failed);
                publish(
                    &self.status,
                    self.event(
                        StatusKind::Exception,
                        format!("some processes would not exit: {}", failures.join("; ")),
                    ),
                );
                return LifecycleState::Failed;
            }

            warn!(
                service = %self.service,
                attempt = retries,
                "Teardown incomplete, retrying in {:?}: {}",
                self.timings.stop_retry_interval,
                failures.join("; ")
            );
            tokio::time::sleep(self.timings.stop_retry_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{LaunchPolicy, ProcessSpawner};
    use crate::registry::ProcessRecord;
    use crate::status::{status_channel, StatusReceiver};
    use crate::testing::{FakeBehavior, FakeSpawner};

    fn timings() -> MonitorTimings {
        MonitorTimings {
            poll_interval: Duration::from_secs(5),
            stop_retry_interval: Duration::from_secs(2),
            max_stop_retries: 3,
        }
    }

    fn start(
        spawner: &FakeSpawner,
        lines: &[&str],
    ) -> (Arc<ServiceRegistry>, CancellationToken, StatusReceiver, JoinHandle<LifecycleState>) {
        let registry = Arc::new(ServiceRegistry::new());
        let processes = lines
            .iter()
            .map(|line| {
                ProcessRecord::new("ui", spawner.spawn("ui", line, LaunchPolicy::Default).unwrap())
            })
            .collect();
        let (tx, rx) = status_channel();
        let stop = registry
            .add("ui", processes, Duration::ZERO, tx.clone())
            .unwrap();
        let monitor = HealthMonitor::new(
            "ui",
            Uuid::nil(),
            Arc::clone(&registry),
            stop.clone(),
            tx,
            timings(),
        );
        (registry, stop, rx, monitor.spawn())
    }

    #[tokio::test(start_paused = true)]
    async fn test_reports_running_each_poll() {
        let spawner = FakeSpawner::new();
        let (registry, stop, mut rx, handle) = start(&spawner, &["a"]);

        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(rx.recv().await.unwrap().kind, StatusKind::Running);
        assert_eq!(rx.recv().await.unwrap().kind, StatusKind::Running);

        stop.cancel();
        registry.set_state("ui", LifecycleState::Stopping);
        assert_eq!(handle.await.unwrap(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_process_triggers_teardown() {
        let spawner = FakeSpawner::new();
        let (registry, _stop, mut rx, handle) = start(&spawner, &["server", "client"]);

        spawner.process("client").kill();
        let state = handle.await.unwrap();
        assert_eq!(state, LifecycleState::Stopped);

        let exception = rx.recv().await.unwrap();
        assert_eq!(exception.kind, StatusKind::Exception);
        assert_eq!(exception.command.as_deref(), Some("client"));
        let over = rx.recv().await.unwrap();
        assert_eq!(over.kind, StatusKind::Over);
        assert_eq!(over.description, "stopped");

        assert!(!registry.contains("ui"));
        assert!(!spawner.process("server").alive());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_process_marks_stopping_before_waking() {
        let spawner = FakeSpawner::new().with_behavior(
            "server",
            FakeBehavior {
                refuse_terminations: 1,
                ..Default::default()
            },
        );
        let (registry, stop, _rx, handle) = start(&spawner, &["server", "client"]);

        spawner.process("client").kill();
        stop.cancelled().await;
        assert_eq!(registry.state("ui"), Some(LifecycleState::Stopping));
        assert!(matches!(
            registry.request_stop("ui", tokio::time::Instant::now(), false),
            crate::registry::StopRequest::AlreadyStopping
        ));
        assert_eq!(handle.await.unwrap(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_teardown_reverse_order() {
        let spawner = FakeSpawner::new();
        let (_registry, stop, _rx, handle) = start(&spawner, &["c1", "c2", "c3"]);

        stop.cancel();
        assert_eq!(handle.await.unwrap(), LifecycleState::Stopped);
        assert_eq!(spawner.terminations(), vec!["c3", "c2", "c1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_wakes_monitor_immediately() {
        let spawner = FakeSpawner::new();
        let (registry, stop, _rx, handle) = start(&spawner, &["a"]);

        let started = tokio::time::Instant::now();
        stop.cancel();
        handle.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(registry.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_refusal_is_retried() {
        let spawner = FakeSpawner::new().with_behavior(
            "stubborn",
            FakeBehavior {
                refuse_terminations: 2,
                ..Default::default()
            },
        );
        let (registry, stop, mut rx, handle) = start(&spawner, &["ok", "stubborn"]);

        let entered = tokio::time::Instant::now();
        stop.cancel();
        assert_eq!(handle.await.unwrap(), LifecycleState::Stopped);
        assert!(entered.elapsed() <= Duration::from_secs(3 * 2));
        assert!(registry.is_empty());

        // "ok" is retired on the first pass and not touched again.
        let attempts = spawner.terminations();
        assert_eq!(attempts.iter().filter(|c| *c == "stubborn").count(), 3);
        assert_eq!(attempts.iter().filter(|c| *c == "ok").count(), 1);
        assert_eq!(rx.recv().await.unwrap().kind, StatusKind::Over);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_and_keeps_failed_record() {
        let spawner = FakeSpawner::new().with_behavior(
            "stuck",
            FakeBehavior {
                refuse_terminations: u32::MAX,
                ..Default::default()
            },
        );
        let (registry, stop, mut rx, handle) = start(&spawner, &["fine", "stuck"]);

        let entered = tokio::time::Instant::now();
        stop.cancel();
        assert_eq!(handle.await.unwrap(), LifecycleState::Failed);
        // Bounded by the retry budget, not by how stubborn the process is.
        let budget = timings().stop_retry_interval * timings().max_stop_retries;
        assert!(entered.elapsed() <= budget, "took {:?}", entered.elapsed());
        // Initial attempt plus three retries.
        assert_eq!(
            spawner.terminations().iter().filter(|c| *c == "stuck").count(),
            4
        );

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, StatusKind::Exception);
        assert!(event.description.contains("would not exit"));

        let record = registry.get("ui").unwrap();
        assert_eq!(record.state, LifecycleState::Failed);
        assert_eq!(record.processes.len(), 1);
        assert_eq!(record.processes[0].command, "stuck");
    }
}
