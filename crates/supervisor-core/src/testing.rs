//! In-memory process backend for unit tests.

use crate::error::{Result, SupervisorError};
use crate::process::{LaunchPolicy, ManagedProcess, ProcessSpawner};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted behavior for one command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeBehavior {
    pub fail_spawn: bool,
    /// The process is already dead by the time anyone looks.
    pub exit_on_start: bool,
    /// Number of termination attempts to refuse; `u32::MAX` refuses forever.
    pub refuse_terminations: u32,
}

#[derive(Debug)]
pub struct FakeProcess {
    command: String,
    pid: u32,
    alive: AtomicBool,
    refusals_left: AtomicU32,
    terminations: Arc<Mutex<Vec<String>>>,
}

impl FakeProcess {
    /// Simulate the process dying on its own.
    pub fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ManagedProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn is_alive(&self) -> bool {
        self.alive()
    }

    async fn terminate(&self) -> Result<bool> {
        self.terminations.lock().unwrap().push(self.command.clone());
        if !self.alive() {
            return Ok(true);
        }
        let refusals = self.refusals_left.load(Ordering::SeqCst);
        if refusals > 0 {
            if refusals != u32::MAX {
                self.refusals_left.store(refusals - 1, Ordering::SeqCst);
            }
            return Ok(false);
        }
        self.kill();
        Ok(true)
    }
}

/// Spawner producing `FakeProcess`es and recording termination order.
#[derive(Default)]
pub struct FakeSpawner {
    next_pid: AtomicU32,
    behaviors: Mutex<HashMap<String, FakeBehavior>>,
    spawned: Mutex<HashMap<String, Arc<FakeProcess>>>,
    terminations: Arc<Mutex<Vec<String>>>,
}

impl FakeSpawner {
    pub fn new() -> Self {
        Self {
            next_pid: AtomicU32::new(1000),
            ..Self::default()
        }
    }

    pub fn with_behavior(self, command: &str, behavior: FakeBehavior) -> Self {
        self.behaviors
            .lock()
            .unwrap()
            .insert(command.to_string(), behavior);
        self
    }

    /// The most recent process spawned for `command`.
    pub fn process(&self, command: &str) -> Arc<FakeProcess> {
        self.spawned.lock().unwrap()[command].clone()
    }

    /// Number of processes spawned so far.
    pub fn spawned_count(&self) -> usize {
        (self.next_pid.load(Ordering::SeqCst) - 1000) as usize
    }

    /// Commands in the order termination was attempted.
    pub fn terminations(&self) -> Vec<String> {
        self.terminations.lock().unwrap().clone()
    }
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(
        &self,
        _service: &str,
        command: &str,
        _policy: LaunchPolicy,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let behavior = self
            .behaviors
            .lock()
            .unwrap()
            .get(command)
            .copied()
            .unwrap_or_default();

        if behavior.fail_spawn {
            return Err(SupervisorError::Spawn {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such program"),
            });
        }

        let process = Arc::new(FakeProcess {
            command: command.to_string(),
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            alive: AtomicBool::new(!behavior.exit_on_start),
            refusals_left: AtomicU32::new(behavior.refuse_terminations),
            terminations: Arc::clone(&self.terminations),
        });
        self.spawned
            .lock()
            .unwrap()
            .insert(command.to_string(), Arc::clone(&process));
        Ok(process)
    }
}
