//! Status notifications from health monitors.
//!
//! Monitors never call into caller code. They push `StatusEvent`s into an
//! unbounded channel; the caller drains the receiver on whatever thread or
//! task suits it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Kind of a status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StatusKind {
    /// Every process of the service passed the last liveness poll.
    Running,
    /// Something went wrong: a process died, or teardown gave up.
    Exception,
    /// A stop was accepted, or teardown completed.
    Over,
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusKind::Running => write!(f, "RUNNING"),
            StatusKind::Exception => write!(f, "EXCEPTION"),
            StatusKind::Over => write!(f, "OVER"),
        }
    }
}

/// One notification about a supervised service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub service: String,
    /// Distinguishes successive runs of the same service name.
    pub instance_id: Uuid,
    pub kind: StatusKind,
    pub description: String,
    /// The command line concerned, if the event is about one process.
    pub command: Option<String>,
    pub pid: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        service: impl Into<String>,
        instance_id: Uuid,
        kind: StatusKind,
        description: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            instance_id,
            kind,
            description: description.into(),
            command: None,
            pid: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach the process this event is about.
    pub fn with_process(mut self, command: impl Into<String>, pid: u32) -> Self {
        self.command = Some(command.into());
        self.pid = Some(pid);
        self
    }

    /// Serialize for handing across a process or language boundary.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

pub type StatusSender = mpsc::UnboundedSender<StatusEvent>;
pub type StatusReceiver = mpsc::UnboundedReceiver<StatusEvent>;

/// Create a status channel for `start_service`.
pub fn status_channel() -> (StatusSender, StatusReceiver) {
    mpsc::unbounded_channel()
}

/// Send an event, tolerating a caller that stopped listening.
pub(crate) fn publish(sender: &StatusSender, event: StatusEvent) {
    debug!(
        service = %event.service,
        kind = %event.kind,
        "{}",
        event.description
    );
    if sender.send(event).is_err() {
        debug!("Status receiver dropped; event discarded");
    }
}
