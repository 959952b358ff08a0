//! Shared registry of supervised services.
//!
//! The registry is the only shared mutable state in the supervisor. Every
//! read-modify-write runs under one mutex; callers only ever receive owned
//! snapshots.

use crate::cancel::CancellationToken;
use crate::error::StartError;
use crate::monitor::LifecycleState;
use crate::process::ManagedProcess;
use crate::status::StatusSender;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// One process belonging to a service.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub command: String,
    pub service: String,
    pub process: Arc<dyn ManagedProcess>,
}

impl ProcessRecord {
    pub fn new(service: &str, process: Arc<dyn ManagedProcess>) -> Self {
        Self {
            command: process.command().to_string(),
            service: service.to_string(),
            process,
        }
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }
}

/// Point-in-time copy of a registered service.
#[derive(Debug, Clone)]
pub struct ServiceRecord {
    pub name: String,
    pub instance_id: Uuid,
    /// In registration order.
    pub processes: Vec<ProcessRecord>,
    pub created_at: Instant,
    pub started_at: DateTime<Utc>,
    pub min_uptime: Duration,
    pub state: LifecycleState,
}

impl ServiceRecord {
    /// Serializable view for display.
    pub fn snapshot(&self) -> ServiceSnapshot {
        ServiceSnapshot {
            name: self.name.clone(),
            instance_id: self.instance_id,
            state: self.state,
            started_at: self.started_at,
            uptime_secs: self.created_at.elapsed().as_secs(),
            min_uptime_secs: self.min_uptime.as_secs(),
            processes: self
                .processes
                .iter()
                .map(|record| ProcessSnapshot {
                    command: record.command.clone(),
                    pid: record.pid(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessSnapshot {
    pub command: String,
    pub pid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub instance_id: Uuid,
    pub state: LifecycleState,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
    pub min_uptime_secs: u64,
    pub processes: Vec<ProcessSnapshot>,
}

struct ServiceEntry {
    instance_id: Uuid,
    processes: Vec<ProcessRecord>,
    created_at: Instant,
    started_at: DateTime<Utc>,
    min_uptime: Duration,
    state: LifecycleState,
    stop: CancellationToken,
    status: StatusSender,
}

impl ServiceEntry {
    fn record(&self, name: &str) -> ServiceRecord {
        ServiceRecord {
            name: name.to_string(),
            instance_id: self.instance_id,
            processes: self.processes.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            min_uptime: self.min_uptime,
            state: self.state,
        }
    }
}

#[derive(Default)]
struct Inner {
    services: HashMap<String, ServiceEntry>,
    /// Command lines being started but not yet registered, per service.
    reservations: HashMap<String, Vec<String>>,
}

impl Inner {
    fn distinct_names(&self) -> HashSet<&str> {
        self.services
            .keys()
            .chain(self.reservations.keys())
            .map(String::as_str)
            .collect()
    }
}

/// Result of registering started processes.
#[derive(Debug)]
pub enum Registration {
    /// A new record was created; a monitor must be started for it.
    Created {
        instance_id: Uuid,
        stop: CancellationToken,
    },
    /// The processes were appended to an existing record.
    Extended { instance_id: Uuid },
    /// The existing record left `MONITORING` while the processes were starting.
    Rejected { state: LifecycleState },
}

/// Outcome of a stop request, decided under the registry lock.
#[derive(Debug)]
pub enum StopRequest {
    NotRegistered,
    AlreadyStopping,
    Failed,
    TooSoon { remaining: Duration },
    /// The service is now `STOPPING`; cancel `stop` to wake its monitor.
    Accepted {
        instance_id: Uuid,
        status: StatusSender,
        stop: CancellationToken,
    },
}

/// Thread-safe map from service name to its processes and bookkeeping.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: Mutex<Inner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check the start guards and reserve `commands` under `name`.
    ///
    /// Guards, in order: more than one distinct name present, a different
    /// name present, the service is tearing down, a command already running
    /// or reserved under the service (or repeated within the request).
    pub fn reserve(
        self: &Arc<Self>,
        name: &str,
        commands: &[String],
    ) -> Result<Reservation, StartError> {
        let mut inner = self.lock();

        let names = inner.distinct_names();
        if names.len() >= 2 {
            return Err(StartError::TooManyServices { count: names.len() });
        }
        if let Some(running) = names.iter().find(|running| **running != name) {
            return Err(StartError::DifferentServiceRunning {
                running: running.to_string(),
            });
        }

        let mut taken: HashSet<&str> = HashSet::new();
        if let Some(entry) = inner.services.get(name) {
            if entry.state != LifecycleState::Monitoring {
                return Err(StartError::ServiceStopping {
                    service: name.to_string(),
                    state: entry.state,
                    rollback_errors: Vec::new(),
                });
            }
            taken.extend(entry.processes.iter().map(|p| p.command.as_str()));
        }
        if let Some(pending) = inner.reservations.get(name) {
            taken.extend(pending.iter().map(String::as_str));
        }
        for command in commands {
            if !taken.insert(command.as_str()) {
                return Err(StartError::AlreadyRunning {
                    service: name.to_string(),
                    command: command.clone(),
                });
            }
        }

        inner
            .reservations
            .entry(name.to_string())
            .or_default()
            .extend(commands.iter().cloned());
        debug!(service = %name, count = commands.len(), "Reserved command lines");

        Ok(Reservation {
            registry: Arc::clone(self),
            name: name.to_string(),
            commands: commands.to_vec(),
            released: false,
        })
    }

    fn release(&self, name: &str, commands: &[String]) {
        let mut inner = self.lock();
        release_locked(&mut inner, name, commands);
    }

    /// Register started processes, consuming the reservation.
    pub fn register(
        &self,
        mut reservation: Reservation,
        processes: Vec<ProcessRecord>,
        min_uptime: Duration,
        status: StatusSender,
    ) -> Registration {
        let mut inner = self.lock();
        release_locked(&mut inner, &reservation.name, &reservation.commands);
        reservation.released = true;

        if let Some(entry) = inner.services.get_mut(&reservation.name) {
            if entry.state != LifecycleState::Monitoring {
                return Registration::Rejected { state: entry.state };
            }
            entry.processes.extend(processes);
            return Registration::Extended {
                instance_id: entry.instance_id,
            };
        }

        let instance_id = Uuid::new_v4();
        let stop = CancellationToken::new();
        inner.services.insert(
            reservation.name.clone(),
            ServiceEntry {
                instance_id,
                processes,
                created_at: Instant::now(),
                started_at: Utc::now(),
                min_uptime,
                state: LifecycleState::Monitoring,
                stop: stop.clone(),
                status,
            },
        );
        Registration::Created { instance_id, stop }
    }

    /// Add a fully formed record directly.
    pub fn add(
        &self,
        name: &str,
        processes: Vec<ProcessRecord>,
        min_uptime: Duration,
        status: StatusSender,
    ) -> Option<CancellationToken> {
        let mut inner = self.lock();
        if inner.services.contains_key(name) {
            return None;
        }
        let stop = CancellationToken::new();
        inner.services.insert(
            name.to_string(),
            ServiceEntry {
                instance_id: Uuid::new_v4(),
                processes,
                created_at: Instant::now(),
                started_at: Utc::now(),
                min_uptime,
                state: LifecycleState::Monitoring,
                stop: stop.clone(),
                status,
            },
        );
        Some(stop)
    }

    /// Remove a service and return its last state.
    pub fn remove(&self, name: &str) -> Option<ServiceRecord> {
        let mut inner = self.lock();
        inner.services.remove(name).map(|entry| entry.record(name))
    }

    pub fn get(&self, name: &str) -> Option<ServiceRecord> {
        self.lock().services.get(name).map(|entry| entry.record(name))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.lock().services.contains_key(name)
    }

    pub fn list_service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().services.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn records(&self) -> Vec<ServiceRecord> {
        let inner = self.lock();
        let mut records: Vec<ServiceRecord> = inner
            .services
            .iter()
            .map(|(name, entry)| entry.record(name))
            .collect();
        records.sort_by(|a, b| a.name.cmp(&b.name));
        records
    }

    pub fn is_empty(&self) -> bool {
        self.lock().services.is_empty()
    }

    /// Names of services still monitored or tearing down.
    pub fn active_service_names(&self) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .services
            .iter()
            .filter(|(_, entry)| entry.state.is_active())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Snapshot of a service's processes, in registration order.
    pub fn processes(&self, name: &str) -> Option<Vec<ProcessRecord>> {
        self.lock()
            .services
            .get(name)
            .map(|entry| entry.processes.clone())
    }

    pub fn state(&self, name: &str) -> Option<LifecycleState> {
        self.lock().services.get(name).map(|entry| entry.state)
    }

    pub fn set_state(&self, name: &str, state: LifecycleState) {
        if let Some(entry) = self.lock().services.get_mut(name) {
            entry.state = state;
        }
    }

    /// Forget a process whose exit was confirmed.
    ///
    /// Removes the whole record in the same critical section when that was
    /// its last process; returns `true` in that case.
    pub fn retire_process(&self, name: &str, pid: u32) -> bool {
        let mut inner = self.lock();
        let Some(entry) = inner.services.get_mut(name) else {
            return false;
        };
        entry.processes.retain(|record| record.pid() != pid);
        if entry.processes.is_empty() {
            inner.services.remove(name);
            debug!(service = %name, "Last process retired; service removed");
            return true;
        }
        false
    }

    /// Decide a stop request against `now`, marking the service `STOPPING`
    /// when accepted.
    pub fn request_stop(&self, name: &str, now: Instant, honor_min_uptime: bool) -> StopRequest {
        let mut inner = self.lock();
        let Some(entry) = inner.services.get_mut(name) else {
            return StopRequest::NotRegistered;
        };

        match entry.state {
            LifecycleState::Failed => return StopRequest::Failed,
            LifecycleState::Stopping | LifecycleState::Stopped => {
                return StopRequest::AlreadyStopping
            }
            LifecycleState::Monitoring => {}
        }

        if honor_min_uptime {
            let elapsed = now.saturating_duration_since(entry.created_at);
            if elapsed < entry.min_uptime {
                return StopRequest::TooSoon {
                    remaining: entry.min_uptime - elapsed,
                };
            }
        }

        entry.state = LifecycleState::Stopping;
        StopRequest::Accepted {
            instance_id: entry.instance_id,
            status: entry.status.clone(),
            stop: entry.stop.clone(),
        }
    }

    /// Drop a record held in `FAILED`.
    pub fn acknowledge_failure(&self, name: &str) -> Option<ServiceRecord> {
        let mut inner = self.lock();
        let failed = matches!(
            inner.services.get(name),
            Some(entry) if entry.state == LifecycleState::Failed
        );
        if !failed {
            return None;
        }
        inner.services.remove(name).map(|entry| entry.record(name))
    }
}

fn release_locked(inner: &mut Inner, name: &str, commands: &[String]) {
    if let Some(pending) = inner.reservations.get_mut(name) {
        for command in commands {
            if let Some(pos) = pending.iter().position(|p| p == command) {
                pending.remove(pos);
            }
        }
        if pending.is_empty() {
            inner.reservations.remove(name);
        }
    }
}

/// Claim on command lines that are being started.
///
/// Released on drop unless consumed by `ServiceRegistry::register`.
pub struct Reservation {
    registry: Arc<ServiceRegistry>,
    name: String,
    commands: Vec<String>,
    released: bool,
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("name", &self.name)
            .field("commands", &self.commands)
            .field("released", &self.released)
            .finish()
    }
}

impl Reservation {
    pub fn commands(&self) -> &[String] {
        &self.commands
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.released {
            self.registry.release(&self.name, &self.commands);
        }
    }
}
