//! Launch policies and process spawning.

use super::handle::{ManagedProcess, OsProcess, TerminateOptions};
use crate::config::{LivenessCheck, SupervisorConfig};
use crate::error::{Result, SupervisorError};
use serde::{Deserialize, Serialize};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(unix)]
use std::os::unix::process::CommandExt;

#[cfg(windows)]
use std::os::windows::process::CommandExt;

/// How a command line is handed to the OS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchPolicy {
    /// Split on whitespace and exec directly.
    #[default]
    Default,
    /// Run through the platform shell.
    Shell,
    /// Shell, with a writable stdin pipe.
    ShellWithStdin,
    /// Shell, with stdout/stderr captured and forwarded to the log.
    ShellWithCapturedOutput,
}

/// Concrete spawn parameters resolved from a `LaunchPolicy` for this platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnOptions {
    pub shell: bool,
    pub pipe_stdin: bool,
    pub capture_output: bool,
    pub new_process_group: bool,
}

impl SpawnOptions {
    /// Resolve a policy for the current platform.
    pub fn resolve(policy: LaunchPolicy) -> Self {
        let shell = !matches!(policy, LaunchPolicy::Default);
        Self {
            shell,
            pipe_stdin: matches!(policy, LaunchPolicy::ShellWithStdin),
            capture_output: matches!(policy, LaunchPolicy::ShellWithCapturedOutput),
            new_process_group: true,
        }
    }

    /// Build the `Command` for a command line under these options.
    pub fn build_command(&self, command_line: &str) -> Result<Command> {
        let mut cmd = if self.shell {
            shell_command(command_line)
        } else {
            let mut parts = command_line.split_whitespace();
            let program = parts
                .next()
                .ok_or_else(|| SupervisorError::Other("Empty command line".to_string()))?;
            let mut cmd = Command::new(program);
            cmd.args(parts);
            cmd
        };

        cmd.stdin(if self.pipe_stdin {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        if self.capture_output {
            cmd.stdout(Stdio::piped());
            cmd.stderr(Stdio::piped());
        } else {
            cmd.stdout(Stdio::inherit());
            cmd.stderr(Stdio::inherit());
        }

        if self.new_process_group {
            // Own process group so teardown can signal the whole group.
            #[cfg(unix)]
            cmd.process_group(0);

            #[cfg(windows)]
            {
                const CREATE_NEW_PROCESS_GROUP: u32 = 0x00000200;
                cmd.creation_flags(CREATE_NEW_PROCESS_GROUP);
            }
        }

        Ok(cmd)
    }
}

#[cfg(unix)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line);
    cmd
}

#[cfg(windows)]
fn shell_command(command_line: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command_line);
    cmd
}

/// Starts OS processes on behalf of the supervisor.
pub trait ProcessSpawner: Send + Sync {
    /// Start one command line for a service.
    fn spawn(
        &self,
        service: &str,
        command: &str,
        policy: LaunchPolicy,
    ) -> Result<Arc<dyn ManagedProcess>>;
}

/// Spawner backed by real OS processes.
#[derive(Debug, Clone)]
pub struct OsSpawner {
    liveness: LivenessCheck,
    terminate: TerminateOptions,
}

impl OsSpawner {
    /// Create a spawner using the liveness and teardown settings of `config`.
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            liveness: config.liveness,
            terminate: TerminateOptions::from_config(config),
        }
    }
}

impl Default for OsSpawner {
    fn default() -> Self {
        Self::from_config(&SupervisorConfig::default())
    }
}

impl ProcessSpawner for OsSpawner {
    fn spawn(
        &self,
        service: &str,
        command: &str,
        policy: LaunchPolicy,
    ) -> Result<Arc<dyn ManagedProcess>> {
        let options = SpawnOptions::resolve(policy);
        debug!(service = %service, ?options, "Resolved spawn options for `{}`", command);

        let mut cmd = options.build_command(command)?;
        let child = cmd.spawn().map_err(|source| SupervisorError::Spawn {
            command: command.to_string(),
            source,
        })?;

        info!(service = %service, pid = child.id(), "Launched `{}`", command);

        Ok(Arc::new(OsProcess::new(
            service,
            command,
            child,
            self.liveness,
            self.terminate.clone(),
        )))
    }
}
