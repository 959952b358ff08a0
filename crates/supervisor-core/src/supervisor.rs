//! Public facade: start, stop and query supervised services.

use crate::cancel::CancellationToken;
use crate::config::SupervisorConfig;
use crate::error::{Result, StartError, StopError, SupervisorError};
use crate::monitor::{HealthMonitor, LifecycleState, MonitorTimings};
use crate::platform;
use crate::process::{LaunchPolicy, ManagedProcess, OsSpawner, ProcessSpawner};
use crate::registry::{ProcessRecord, Registration, ServiceRegistry, ServiceSnapshot, StopRequest};
use crate::status::{publish, StatusEvent, StatusKind, StatusSender};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Supervisor of named groups of long-running processes.
///
/// At most one service name is supervised at a time. Each registered
/// service is driven by its own `HealthMonitor` task, which reports through
/// the status channel given at start.
///
/// # Example
///
/// ```rust,no_run
/// use service_supervisor::{status_channel, LaunchPolicy, ServiceSupervisor, SupervisorConfig};
///
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// let supervisor = ServiceSupervisor::new(SupervisorConfig::default());
/// let (tx, mut rx) = status_channel();
///
/// supervisor
///     .start_service("io", ["relay-server --port 9000"], LaunchPolicy::Shell, tx, None)
///     .await?;
///
/// while let Some(event) = rx.recv().await {
///     println!("{}: {} {}", event.service, event.kind, event.description);
/// }
/// # Ok(())
/// # }
/// ```
pub struct ServiceSupervisor {
    registry: Arc<ServiceRegistry>,
    spawner: Arc<dyn ProcessSpawner>,
    config: SupervisorConfig,
}

impl ServiceSupervisor {
    /// Create a supervisor launching real OS processes.
    pub fn new(config: SupervisorConfig) -> Self {
        let spawner = Arc::new(OsSpawner::from_config(&config));
        Self::with_spawner(config, spawner)
    }

    /// Create a supervisor on a custom process backend.
    pub fn with_spawner(config: SupervisorConfig, spawner: Arc<dyn ProcessSpawner>) -> Self {
        info!(
            platform = platform::current_platform(),
            liveness = ?config.liveness,
            "Service supervisor created"
        );
        Self {
            registry: Arc::new(ServiceRegistry::new()),
            spawner,
            config,
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    /// Start `commands` as service `name`.
    ///
    /// Spawns every command, waits the verification delay and checks each
    /// process is still alive before registering the service and starting
    /// its monitor. Any failure terminates everything spawned by this call.
    /// `min_uptime` defaults to the configured debounce window.
    pub async fn start_service<I, S>(
        &self,
        name: &str,
        commands: I,
        policy: LaunchPolicy,
        status: StatusSender,
        min_uptime: Option<Duration>,
    ) -> std::result::Result<(), StartError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let commands: Vec<String> = commands.into_iter().map(Into::into).collect();
        if commands.is_empty() {
            return Err(StartError::NoCommands);
        }

        let reservation = self.registry.reserve(name, &commands)?;
        info!(service = %name, count = commands.len(), ?policy, "Starting service");

        let mut spawned: Vec<Arc<dyn ManagedProcess>> = Vec::with_capacity(commands.len());
        for command in reservation.commands() {
            match self.spawner.spawn(name, command, policy) {
                Ok(process) => spawned.push(process),
                Err(e) => {
                    warn!(service = %name, "Failed to start `{}`: {}", command, e);
                    let rollback_errors = rollback(name, &spawned).await;
                    return Err(StartError::SpawnFailed {
                        command: command.clone(),
                        detail: e.to_string(),
                        rollback_errors,
                    });
                }
            }
        }

        tokio::time::sleep(self.config.start_verify_delay).await;

        for process in &spawned {
            if !process.is_alive().await {
                warn!(
                    service = %name,
                    pid = process.pid(),
                    "`{}` exited during startup",
                    process.command()
                );
                let rollback_errors = rollback(name, &spawned).await;
                return Err(StartError::EarlyExit {
                    command: process.command().to_string(),
                    rollback_errors,
                });
            }
        }

        let records: Vec<ProcessRecord> = spawned
            .iter()
            .map(|process| ProcessRecord::new(name, Arc::clone(process)))
            .collect();
        let min_uptime = min_uptime.unwrap_or(self.config.default_min_uptime);

        match self
            .registry
            .register(reservation, records, min_uptime, status.clone())
        {
            Registration::Created { instance_id, stop } => {
                HealthMonitor::new(
                    name,
                    instance_id,
                    Arc::clone(&self.registry),
                    stop,
                    status,
                    MonitorTimings::from(&self.config),
                )
                .spawn();
                info!(service = %name, instance = %instance_id, "Service started");
                Ok(())
            }
            Registration::Extended { instance_id } => {
                debug!(
                    service = %name,
                    "Joined running instance; status keeps flowing to its original channel"
                );
                info!(service = %name, instance = %instance_id, "Added processes to service");
                Ok(())
            }
            Registration::Rejected { state } => {
                warn!(service = %name, %state, "Service left monitoring during startup");
                let rollback_errors = rollback(name, &spawned).await;
                Err(StartError::ServiceStopping {
                    service: name.to_string(),
                    state,
                    rollback_errors,
                })
            }
        }
    }

    /// Ask the monitor of `name` to tear the service down.
    ///
    /// Returns once the request is accepted; teardown completes in the
    /// background and is reported through the status channel. Stopping an
    /// unknown or already stopping service is a no-op.
    pub fn stop_service(&self, name: &str) -> std::result::Result<(), StopError> {
        match self.registry.request_stop(name, Instant::now(), true) {
            StopRequest::NotRegistered => {
                debug!(service = %name, "Nothing to stop");
                Ok(())
            }
            StopRequest::AlreadyStopping => {
                debug!(service = %name, "Stop already in progress");
                Ok(())
            }
            StopRequest::Failed => Err(StopError::TeardownFailed {
                service: name.to_string(),
            }),
            StopRequest::TooSoon { remaining } => {
                info!(service = %name, ?remaining, "Stop refused: service started too recently");
                Err(StopError::TooSoon { remaining })
            }
            StopRequest::Accepted {
                instance_id,
                status,
                stop,
            } => {
                accept_stop(name, instance_id, &status, &stop);
                Ok(())
            }
        }
    }

    /// Stop every service and wait for the registry to drain.
    ///
    /// Ignores the debounce window. Returns `false` if services were still
    /// registered when the configured wait bound elapsed.
    pub async fn shutdown_all(&self) -> bool {
        let names = self.registry.list_service_names();
        info!(count = names.len(), "Shutting down all services");

        for name in &names {
            match self.registry.request_stop(name, Instant::now(), false) {
                StopRequest::Accepted {
                    instance_id,
                    status,
                    stop,
                } => accept_stop(name, instance_id, &status, &stop),
                StopRequest::Failed => {
                    warn!(service = %name, "Service failed to stop earlier; not waiting on it")
                }
                _ => {}
            }
        }

        let started = Instant::now();
        loop {
            let remaining = self.registry.active_service_names();
            if remaining.is_empty() {
                info!("All services stopped");
                return true;
            }
            if started.elapsed() >= self.config.max_global_exit_time {
                warn!(
                    services = ?remaining,
                    "Services still stopping after {:?}; giving up",
                    self.config.max_global_exit_time
                );
                return false;
            }
            tokio::time::sleep(self.config.shutdown_poll_interval).await;
        }
    }

    /// Processes of `name`, in start order.
    pub fn processes_of(&self, name: &str) -> Vec<ProcessRecord> {
        self.registry.processes(name).unwrap_or_default()
    }

    pub fn pids_of(&self, name: &str) -> Vec<u32> {
        self.processes_of(name)
            .iter()
            .map(ProcessRecord::pid)
            .collect()
    }

    /// Whether `name` is registered and every one of its processes is alive.
    pub async fn is_alive(&self, name: &str) -> bool {
        let processes = self.processes_of(name);
        if processes.is_empty() {
            return false;
        }
        futures::future::join_all(processes.iter().map(|record| record.process.is_alive()))
            .await
            .into_iter()
            .all(|alive| alive)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Whether any service is registered, including one held in `FAILED`.
    pub fn has_any_service_running(&self) -> bool {
        !self.registry.is_empty()
    }

    pub fn state_of(&self, name: &str) -> Option<LifecycleState> {
        self.registry.state(name)
    }

    pub fn snapshot(&self, name: &str) -> Option<ServiceSnapshot> {
        self.registry.get(name).map(|record| record.snapshot())
    }

    pub fn list_services(&self) -> Vec<ServiceSnapshot> {
        self.registry
            .records()
            .iter()
            .map(|record| record.snapshot())
            .collect()
    }

    /// Write to the stdin of `command` under service `name`.
    pub fn write_input(&self, name: &str, command: &str, data: &[u8]) -> Result<()> {
        let processes = self
            .registry
            .processes(name)
            .ok_or_else(|| SupervisorError::ServiceNotFound(name.to_string()))?;
        let record = processes
            .iter()
            .find(|record| record.command == command)
            .ok_or_else(|| {
                SupervisorError::Other(format!(
                    "`{}` is not running under service `{}`",
                    command, name
                ))
            })?;
        record.process.write_input(data)
    }

    /// Forget a service whose teardown gave up.
    ///
    /// Returns its final snapshot, or `None` if `name` is not held in
    /// `FAILED`. Processes that refused to exit are left to the caller.
    pub fn acknowledge_failure(&self, name: &str) -> Option<ServiceSnapshot> {
        let record = self.registry.acknowledge_failure(name)?;
        let pids: Vec<u32> = record.processes.iter().map(ProcessRecord::pid).collect();
        warn!(service = %name, ?pids, "Failure acknowledged; record dropped");
        Some(record.snapshot())
    }
}

impl Default for ServiceSupervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

fn accept_stop(
    name: &str,
    instance_id: Uuid,
    status: &StatusSender,
    stop: &CancellationToken,
) {
    info!(service = %name, instance = %instance_id, "Stop accepted");
    publish(
        status,
        StatusEvent::new(name, instance_id, StatusKind::Over, "stopping"),
    );
    stop.cancel();
}

/// Terminate processes spawned by a failed start, last first.
async fn rollback(name: &str, spawned: &[Arc<dyn ManagedProcess>]) -> Vec<String> {
    let mut errors = Vec::new();
    for process in spawned.iter().rev() {
        match process.terminate().await {
            Ok(true) => {}
            Ok(false) => errors.push(format!(
                "`{}` (pid {}) did not exit",
                process.command(),
                process.pid()
            )),
            Err(e) => errors.push(format!(
                "`{}` (pid {}): {}",
                process.command(),
                process.pid(),
                e
            )),
        }
    }
    if errors.is_empty() {
        debug!(service = %name, count = spawned.len(), "Rolled back partial start");
    } else {
        warn!(service = %name, "Rollback incomplete: {}", errors.join("; "));
    }
    errors
}
