//! Service Supervisor - launches, monitors and tears down groups of
//! long-running backend processes.
//!
//! A *service* is a named group of command lines started together. The
//! supervisor verifies they came up, polls their liveness from a background
//! task, and tears them down in reverse start order when asked to stop or
//! when one of them dies. Status is delivered over a channel, never through
//! callbacks into caller code.
//!
//! # Example
//!
//! ```rust,no_run
//! use service_supervisor::{status_channel, LaunchPolicy, ServiceSupervisor, SupervisorConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let supervisor = ServiceSupervisor::new(SupervisorConfig::default());
//!     let (tx, mut rx) = status_channel();
//!
//!     supervisor
//!         .start_service(
//!             "ui",
//!             ["ui-recognizer --port 7000", "ui-client --port 7000"],
//!             LaunchPolicy::Shell,
//!             tx,
//!             None,
//!         )
//!         .await?;
//!
//!     if let Some(event) = rx.recv().await {
//!         println!("{} is {}", event.service, event.kind);
//!     }
//!
//!     supervisor.shutdown_all().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod monitor;
pub mod platform;
pub mod process;
pub mod registry;
pub mod status;
pub mod supervisor;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use cancel::CancellationToken;
pub use config::{LivenessCheck, SupervisorConfig, TimingConfig};
pub use error::{Result, StartError, StopError, SupervisorError};
pub use monitor::{HealthMonitor, LifecycleState};
pub use process::{LaunchPolicy, ManagedProcess, OsSpawner, ProcessSpawner};
pub use registry::{ProcessRecord, ServiceRecord, ServiceRegistry, ServiceSnapshot};
pub use status::{status_channel, StatusEvent, StatusKind, StatusReceiver, StatusSender};
pub use supervisor::ServiceSupervisor;
