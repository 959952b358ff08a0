//! Process launching and control.
//!
//! A service is a group of command lines. Each one is started through a
//! `ProcessSpawner` according to a `LaunchPolicy` and yields a
//! `ManagedProcess` handle that the registry owns until teardown.
//!
//! # Example
//!
//! ```rust,no_run
//! use service_supervisor::process::{LaunchPolicy, OsSpawner, ProcessSpawner};
//!
//! # async fn demo() -> service_supervisor::Result<()> {
//! let spawner = OsSpawner::default();
//! let process = spawner.spawn("relay", "relay-server --port 9000", LaunchPolicy::Shell)?;
//! if process.is_alive().await {
//!     println!("PID {} is up", process.pid());
//! }
//! process.terminate().await?;
//! # Ok(())
//! # }
//! ```

mod handle;
mod launcher;

pub use handle::{ManagedProcess, OsProcess, TerminateOptions};
pub use launcher::{LaunchPolicy, OsSpawner, ProcessSpawner, SpawnOptions};
