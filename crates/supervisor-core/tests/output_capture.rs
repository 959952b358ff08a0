//! Captured process output is forwarded to `tracing`.
//!
//! Kept in its own test binary: it installs a global subscriber.

#![cfg(unix)]

use service_supervisor::{status_channel, LaunchPolicy, ServiceSupervisor, SupervisorConfig};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

#[tokio::test]
async fn test_captured_output_is_logged() {
    let logs = SharedBuf::default();
    let writer = logs.clone();
    tracing_subscriber::fmt()
        .with_env_filter("service_supervisor::output=info")
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .init();

    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("recognizer.sh");
    std::fs::write(
        &script,
        "echo 'recognizer ready'\necho 'calibration warning' >&2\nexec sleep 30\n",
    )
    .unwrap();

    let supervisor = ServiceSupervisor::new(SupervisorConfig::fast());
    let (tx, _rx) = status_channel();
    supervisor
        .start_service(
            "ui",
            [format!("sh '{}'", script.display())],
            LaunchPolicy::ShellWithCapturedOutput,
            tx,
            None,
        )
        .await
        .unwrap();

    let forwarded = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let text = logs.contents();
            if text.contains("recognizer ready") && text.contains("calibration warning") {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();

    assert!(forwarded.contains("stdout"));
    assert!(forwarded.contains("stderr"));
    assert!(forwarded.contains("service_supervisor::output"));

    assert!(supervisor.shutdown_all().await);
}
