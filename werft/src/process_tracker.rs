use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;
use tokio::sync::oneshot;

use crate::error::{to_common_error, ContainerizerError};

const DEFAULT_PIDFILE_POLL_INTERVAL: Duration = Duration::from_millis(100);
const DEFAULT_PIDFILE_POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// A live entry in the tracker's registry (spec §4.7: "stores a map from
/// process id -> process record").
struct TrackedEntry {
    in_container_pid: i32,
    exit_rx: Option<oneshot::Receiver<Option<i32>>>,
}

/// Goroutine-style process supervision (spec §4.7/§9 "Goroutine-style
/// concurrency"): one task per stdio pump, plus one task per `Wait`. The
/// "supervisor child" is whatever binary was launched to hold the
/// terminal/pipes open across attach/reattach (`iodaemon` in the source
/// system); this tracker only ever deals with it through its stdio and
/// exit status, never its internals.
pub struct ProcessTracker {
    entries: Arc<Mutex<HashMap<String, TrackedEntry>>>,
    pidfile_poll_interval: Duration,
    pidfile_poll_timeout: Duration,
}

impl Default for ProcessTracker {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            pidfile_poll_interval: DEFAULT_PIDFILE_POLL_INTERVAL,
            pidfile_poll_timeout: DEFAULT_PIDFILE_POLL_TIMEOUT,
        }
    }
}

impl ProcessTracker {
    pub fn new(pidfile_poll_interval: Duration, pidfile_poll_timeout: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            pidfile_poll_interval,
            pidfile_poll_timeout,
        }
    }

    /// Spawns the supervisor child, plumbs its stdio through pump tasks,
    /// polls the pidfile until populated, and registers a deferred
    /// cleanup that fires once the child exits (spec §4.2 "Run": "Cleanup
    /// of the process.json + pidfile is deferred until the spawned
    /// process exits").
    pub async fn track(
        &self,
        exec_id: impl Into<String>,
        mut command: Command,
        pidfile: PathBuf,
        process_json: PathBuf,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout_sink: Box<dyn AsyncWrite + Send + Unpin>,
        stderr_sink: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<i32, Error> {
        let exec_id = exec_id.into();

        command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| to_common_error(ContainerizerError::RuntimeFailed(format!("failed to spawn supervisor: {}", e))))?;

        if let (Some(mut child_stdin), Some(mut source)) = (child.stdin.take(), stdin) {
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut source, &mut child_stdin).await;
            });
        }
        if let Some(mut child_stdout) = child.stdout.take() {
            let mut sink = stdout_sink;
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut child_stdout, &mut sink).await;
            });
        }
        if let Some(mut child_stderr) = child.stderr.take() {
            let mut sink = stderr_sink;
            tokio::spawn(async move {
                let _ = tokio::io::copy(&mut child_stderr, &mut sink).await;
            });
        }

        let in_container_pid = poll_pidfile(&pidfile, self.pidfile_poll_interval, self.pidfile_poll_timeout).await?;

        let (exit_tx, exit_rx) = oneshot::channel();
        let cleanup_process_json = process_json;
        let cleanup_pidfile = pidfile;
        tokio::spawn(async move {
            let status = child.wait().await.ok().and_then(|s| s.code());
            let _ = std::fs::remove_file(&cleanup_process_json);
            let _ = std::fs::remove_file(&cleanup_pidfile);
            let _ = exit_tx.send(status);
        });

        self.entries.lock().expect("lock poisoned").insert(
            exec_id,
            TrackedEntry { in_container_pid, exit_rx: Some(exit_rx) },
        );

        Ok(in_container_pid)
    }

    /// Blocks until the supervisor reports exit; returns the exit code
    /// (spec §4.7: "`Wait()` blocks until the supervisor reports exit").
    pub async fn wait(&self, exec_id: &str) -> Result<Option<i32>, Error> {
        let rx = {
            let mut entries = self.entries.lock().expect("lock poisoned");
            let entry = entries
                .get_mut(exec_id)
                .ok_or_else(|| to_common_error(ContainerizerError::NoSuchContainer(exec_id.to_string())))?;
            entry.exit_rx.take()
        };

        match rx {
            Some(rx) => Ok(rx.await.unwrap_or(None)),
            None => Err(to_common_error(ContainerizerError::InvalidProcessState(format!(
                "process '{}' is already being waited on",
                exec_id
            )))),
        }
    }

    pub fn in_container_pid(&self, exec_id: &str) -> Result<i32, Error> {
        self.entries
            .lock()
            .expect("lock poisoned")
            .get(exec_id)
            .map(|entry| entry.in_container_pid)
            .ok_or_else(|| to_common_error(ContainerizerError::NoSuchContainer(exec_id.to_string())))
    }

    pub fn forget(&self, exec_id: &str) {
        self.entries.lock().expect("lock poisoned").remove(exec_id);
    }
}

#[fehler::throws(Error)]
async fn poll_pidfile(path: &std::path::Path, interval: Duration, timeout: Duration) -> i32 {
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Ok(contents) = tokio::fs::read_to_string(path).await {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return trimmed.parse().map_err(|_| {
                    to_common_error(ContainerizerError::PidfileTimeout(format!(
                        "pidfile '{}' contains non-numeric pid",
                        path.display()
                    )))
                })?;
            }
        }

        if tokio::time::Instant::now() >= deadline {
            fehler::throw!(to_common_error(ContainerizerError::PidfileTimeout(path.display().to_string())));
        }

        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn poll_pidfile_returns_once_populated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.pid");

        let write_path = path.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(&write_path, "4321").await.unwrap();
        });

        let pid = poll_pidfile(&path, Duration::from_millis(5), Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(pid, 4321);
    }

    #[tokio::test]
    async fn poll_pidfile_times_out_when_never_populated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.pid");

        let result = poll_pidfile(&path, Duration::from_millis(5), Duration::from_millis(30)).await;

        assert!(result.is_err());
    }
}
