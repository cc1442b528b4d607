use std::process::Output;
use std::time::Duration;

use common::{CommandRunner, Invocation};
use serde::Deserialize;

use crate::error::ContainerizerError;

/// `runtime state <id>` response (spec §6: "Runtime binary CLI consumed").
#[derive(Deserialize, Debug)]
pub struct RuntimeState {
    pub init_process_pid: i32,
}

/// The constant-backoff retrier `Destroy` uses around `runtime delete`
/// (spec §4.2: "a short constant-backoff retrier (≈20×100ms) to tolerate
/// races with its own teardown").
const DELETE_RETRIES: u32 = 20;
const DELETE_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Thin driver over the low-level OCI runtime binary's CLI. Every method
/// is a single `CommandRunner::run` call plus error-shape translation;
/// implementing the runtime itself is a non-goal (spec §1), this crate
/// only ever invokes one.
pub struct RuntimeDriver<R: CommandRunner> {
    runner: R,
    binary: String,
}

impl<R: CommandRunner> RuntimeDriver<R> {
    pub fn new(runner: R, binary: impl Into<String>) -> Self {
        Self { runner, binary: binary.into() }
    }

    /// Invokes `runtime run <id> --detach` and returns the captured
    /// output so the caller can look for the init process's start token
    /// on stdout (spec §4.2's "start check").
    pub fn run(&self, handle: &str, bundle_dir: &str) -> Result<Output, ContainerizerError> {
        self.runner
            .run(&Invocation::new(
                self.binary.clone(),
                vec!["run".to_string(), "--bundle".to_string(), bundle_dir.to_string(), "--detach".to_string(), handle.to_string()],
            ))
            .map_err(|e| ContainerizerError::RuntimeFailed(e.to_string()))
    }

    pub fn exec(
        &self,
        handle: &str,
        process_json: &str,
        pidfile: &str,
    ) -> Result<(), ContainerizerError> {
        self.invoke(vec![
            "exec".into(),
            handle.into(),
            process_json.into(),
            "--pid-file".into(),
            pidfile.into(),
            "--detach".into(),
        ])
    }

    pub fn delete(&self, handle: &str) -> Result<(), ContainerizerError> {
        let mut last_err = None;

        for attempt in 0..DELETE_RETRIES {
            match self.invoke(vec!["delete".into(), handle.into()]) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    last_err = Some(err);
                    if attempt + 1 < DELETE_RETRIES {
                        std::thread::sleep(DELETE_RETRY_INTERVAL);
                    }
                }
            }
        }

        Err(last_err.expect("loop runs at least once"))
    }

    pub fn state(&self, handle: &str) -> Result<RuntimeState, ContainerizerError> {
        let output = self
            .runner
            .run(&Invocation::new(self.binary.clone(), vec!["state".to_string(), handle.to_string()]))
            .map_err(|e| ContainerizerError::RuntimeFailed(e.to_string()))?;

        serde_json::from_slice(&output.stdout)
            .map_err(|e| ContainerizerError::RuntimeFailed(format!("unparseable state output: {}", e)))
    }

    fn invoke(&self, args: Vec<String>) -> Result<(), ContainerizerError> {
        self.runner
            .run(&Invocation::new(self.binary.clone(), args))
            .map(|_| ())
            .map_err(|e| ContainerizerError::RuntimeFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::FakeCommandRunner;

    #[test]
    fn run_invokes_the_runtime_binary_with_the_bundle() {
        let runner = FakeCommandRunner::new();
        let driver = RuntimeDriver::new(runner.clone(), "/usr/bin/runtime");

        driver.run("handle-a", "/depot/handle-a").unwrap();

        let invocations = runner.invocations();
        assert_eq!(invocations[0].program, "/usr/bin/runtime");
        assert!(invocations[0].args.contains(&"/depot/handle-a".to_string()));
    }

    #[test]
    fn delete_retries_until_the_runtime_succeeds() {
        let runner = FakeCommandRunner::new();
        runner.fail_next("/usr/bin/runtime", "container busy");
        let driver = RuntimeDriver::new(runner.clone(), "/usr/bin/runtime");

        driver.delete("handle-a").unwrap();

        assert_eq!(runner.invocations().len(), 2);
    }

    #[test]
    fn state_parses_the_runtime_json_response() {
        let runner = FakeCommandRunner::new();
        runner.queue_stdout("/usr/bin/runtime", br#"{"init_process_pid": 42}"#.to_vec());
        let driver = RuntimeDriver::new(runner, "/usr/bin/runtime");

        let state = driver.state("handle-a").unwrap();

        assert_eq!(state.init_process_pid, 42);
    }
}
