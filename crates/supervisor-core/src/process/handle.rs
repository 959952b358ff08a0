//! Handles to individual supervised processes.

use crate::config::{LivenessCheck, SupervisorConfig, TimingConfig};
use crate::error::{Result, SupervisorError};
use crate::platform;
use async_trait::async_trait;
use std::fmt;
use std::io::Write;
use std::process::{Child, ChildStdin};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One OS process owned by a service.
#[async_trait]
pub trait ManagedProcess: Send + Sync + fmt::Debug {
    /// OS process ID.
    fn pid(&self) -> u32;

    /// The command line this process was started from.
    fn command(&self) -> &str;

    /// Whether the process still counts as running.
    async fn is_alive(&self) -> bool;

    /// Ask the process (and its group or tree) to exit and wait for it.
    ///
    /// Returns `true` once the OS confirms the process is gone, including
    /// when it was already gone. Returns `false` if it outlived the grace
    /// period.
    async fn terminate(&self) -> Result<bool>;

    /// Write to the process's stdin pipe.
    fn write_input(&self, _data: &[u8]) -> Result<()> {
        Err(SupervisorError::Unsupported(format!(
            "`{}` was not started with a writable input stream",
            self.command()
        )))
    }
}

/// Teardown parameters for an `OsProcess`.
#[derive(Debug, Clone)]
pub struct TerminateOptions {
    pub grace: Duration,
    pub poll_interval: Duration,
    #[cfg(unix)]
    pub signal: nix::sys::signal::Signal,
}

impl TerminateOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            grace: config.terminate_grace,
            poll_interval: TimingConfig::TERMINATE_POLL_INTERVAL,
            #[cfg(unix)]
            signal: config.termination_signal,
        }
    }
}

/// A process spawned through `std::process`.
pub struct OsProcess {
    service: String,
    command: String,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    liveness: LivenessCheck,
    terminate: TerminateOptions,
}

impl fmt::Debug for OsProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OsProcess")
            .field("service", &self.service)
            .field("command", &self.command)
            .field("pid", &self.pid)
            .field("liveness", &self.liveness)
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl OsProcess {
    /// Wrap a freshly spawned child. Captured output pipes are drained into the log.
    pub fn new(
        service: &str,
        command: &str,
        mut child: Child,
        liveness: LivenessCheck,
        terminate: TerminateOptions,
    ) -> Self {
        let pid = child.id();
        capture_output(service, pid, &mut child);
        let stdin = child.stdin.take();

        Self {
            service: service.to_string(),
            command: command.to_string(),
            pid,
            child: Mutex::new(child),
            stdin: Mutex::new(stdin),
            liveness,
            terminate,
        }
    }

    /// Reap the child if it has exited. Returns `true` if it is gone.
    fn has_exited(&self) -> bool {
        let mut child = lock(&self.child);
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(service = %self.service, pid = self.pid, %status, "Process exited");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(service = %self.service, pid = self.pid, "try_wait failed: {}", e);
                !platform::is_process_alive(self.pid)
            }
        }
    }

    fn send_termination(&self) -> Result<()> {
        #[cfg(unix)]
        {
            // Spawned with process_group(0), so the group id is the pid.
            if !platform::signal_process_group(self.pid, self.terminate.signal)? {
                debug!(pid = self.pid, "Process group already gone");
            }
        }

        #[cfg(windows)]
        {
            if !platform::terminate_tree(self.pid)? {
                warn!(pid = self.pid, "Some processes in the tree could not be terminated");
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ManagedProcess for OsProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn command(&self) -> &str {
        &self.command
    }

    async fn is_alive(&self) -> bool {
        if self.has_exited() {
            return false;
        }

        match self.liveness {
            LivenessCheck::ProcessExists => true,
            LivenessCheck::HasChildren => {
                let pid = self.pid;
                tokio::task::spawn_blocking(move || platform::has_children(pid))
                    .await
                    .unwrap_or(false)
            }
        }
    }

    async fn terminate(&self) -> Result<bool> {
        if self.has_exited() {
            return Ok(true);
        }

        info!(service = %self.service, pid = self.pid, "Terminating `{}`", self.command);
        self.send_termination()?;

        let deadline = Instant::now() + self.terminate.grace;
        loop {
            if self.has_exited() {
                debug!(service = %self.service, pid = self.pid, "Process terminated");
                return Ok(true);
            }
            if Instant::now() >= deadline {
                warn!(
                    service = %self.service,
                    pid = self.pid,
                    "Process still running after {:?}",
                    self.terminate.grace
                );
                return Ok(false);
            }
            tokio::time::sleep(self.terminate.poll_interval).await;
        }
    }

    fn write_input(&self, data: &[u8]) -> Result<()> {
        let mut stdin = lock(&self.stdin);
        let pipe = stdin.as_mut().ok_or_else(|| {
            SupervisorError::Unsupported(format!(
                "`{}` was not started with a writable input stream",
                self.command
            ))
        })?;
        pipe.write_all(data)?;
        pipe.flush()?;
        Ok(())
    }
}

/// Hand captured stdout/stderr pipes to tokio and log them line by line.
fn capture_output(service: &str, pid: u32, child: &mut Child) {
    if child.stdout.is_none() && child.stderr.is_none() {
        return;
    }
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(service = %service, pid, "No tokio runtime; captured output is not forwarded");
        return;
    };
    // Pipe registration needs the runtime's reactor.
    let _guard = runtime.enter();

    if let Some(stdout) = child.stdout.take() {
        match tokio::process::ChildStdout::from_std(stdout) {
            Ok(pipe) => forward_output(service, pid, "stdout", pipe),
            Err(e) => warn!(service = %service, pid, "Cannot forward stdout: {}", e),
        }
    }
    if let Some(stderr) = child.stderr.take() {
        match tokio::process::ChildStderr::from_std(stderr) {
            Ok(pipe) => forward_output(service, pid, "stderr", pipe),
            Err(e) => warn!(service = %service, pid, "Cannot forward stderr: {}", e),
        }
    }
}

fn forward_output<R>(service: &str, pid: u32, stream: &'static str, pipe: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let service = service.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => info!(
                    target: "service_supervisor::output",
                    service = %service,
                    pid,
                    stream,
                    "{}",
                    line
                ),
                Ok(None) => break,
                Err(e) => {
                    warn!(service = %service, pid, stream, "Error reading output: {}", e);
                    break;
                }
            }
        }
        debug!(service = %service, pid, stream, "Output stream closed");
    });
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::launcher::{LaunchPolicy, OsSpawner, ProcessSpawner};

    fn spawner() -> OsSpawner {
        OsSpawner::from_config(&SupervisorConfig::fast())
    }

    #[tokio::test]
    async fn test_sleep_process_is_alive_then_terminates() {
        let process = spawner()
            .spawn("test", "sleep 30", LaunchPolicy::Default)
            .unwrap();
        assert!(process.is_alive().await);

        assert!(process.terminate().await.unwrap());
        assert!(!process.is_alive().await);
        assert!(!platform::is_process_alive(process.pid()));
    }

    #[tokio::test]
    async fn test_terminate_already_exited_is_noop_success() {
        let process = spawner().spawn("test", "true", LaunchPolicy::Default).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(!process.is_alive().await);
        assert!(process.terminate().await.unwrap());
    }

    #[tokio::test]
    async fn test_shell_group_teardown_reaches_grandchildren() {
        let process = spawner()
            .spawn("test", "sleep 30 & sleep 30; wait", LaunchPolicy::Shell)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        let children = platform::child_pids(process.pid());
        assert!(!children.is_empty());

        assert!(process.terminate().await.unwrap());
        tokio::time::sleep(Duration::from_millis(100)).await;
        for child in children {
            assert!(!platform::is_process_alive(child), "child {} survived", child);
        }
    }

    #[tokio::test]
    async fn test_ignored_signal_reports_failure() {
        let process = spawner()
            .spawn("test", "trap '' TERM; sleep 30 & wait", LaunchPolicy::Shell)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The trap is inherited by the backgrounded sleep, so nothing exits.
        assert!(!process.terminate().await.unwrap());
        assert!(process.is_alive().await);

        platform::signal_process_group(process.pid(), nix::sys::signal::Signal::SIGKILL).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!process.is_alive().await);
    }

    #[tokio::test]
    async fn test_has_children_liveness() {
        let config = SupervisorConfig::fast().with_liveness(LivenessCheck::HasChildren);
        let spawner = OsSpawner::from_config(&config);

        let wrapper = spawner
            .spawn("test", "sleep 30 & wait", LaunchPolicy::Shell)
            .unwrap();
        let leaf = spawner.spawn("test", "sleep 30", LaunchPolicy::Default).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(wrapper.is_alive().await);
        // A leaf workload without children counts as dead under this check.
        assert!(!leaf.is_alive().await);

        wrapper.terminate().await.unwrap();
        leaf.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_captured_output_is_drained() {
        // More output than a pipe buffer holds; the writer only finishes if
        // something keeps reading.
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("done");
        let line = format!(
            "yes | head -n 100000; touch '{}'; exec sleep 30",
            marker.display()
        );
        let process = spawner()
            .spawn("test", &line, LaunchPolicy::ShellWithCapturedOutput)
            .unwrap();

        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while !marker.exists() {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert!(drained.is_ok(), "child blocked on a full output pipe");

        process.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn test_write_input() {
        let process = spawner()
            .spawn("test", "read line; sleep 30", LaunchPolicy::ShellWithStdin)
            .unwrap();
        process.write_input(b"hello\n").unwrap();
        process.terminate().await.unwrap();

        let plain = spawner().spawn("test", "sleep 30", LaunchPolicy::Default).unwrap();
        assert!(matches!(
            plain.write_input(b"x"),
            Err(SupervisorError::Unsupported(_))
        ));
        plain.terminate().await.unwrap();
    }
}
