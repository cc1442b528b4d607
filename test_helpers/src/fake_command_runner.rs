use std::{
    collections::HashMap,
    os::unix::process::ExitStatusExt,
    process::{ExitStatus, Output},
    sync::{Arc, Mutex},
};

use common::{CommandRunner, Error, Invocation};

/// Records every `CommandRunner::run` invocation instead of actually
/// spawning a process, so Networker/Containerizer tests can assert on the
/// exact `ip`/`iptables`/runtime-binary argv without a kernel. Grounded on
/// `original_source`'s `fake_command_runner`, used throughout
/// `kawasaki`/`rundmc`'s Go test suites the same way.
#[derive(Clone, Default)]
pub struct FakeCommandRunner {
    invocations: Arc<Mutex<Vec<Invocation>>>,
    failures: Arc<Mutex<HashMap<String, String>>>,
    stdout_queue: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl FakeCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().expect("lock poisoned").clone()
    }

    /// Makes the next invocation of `program` fail with `message` on
    /// stderr, once.
    pub fn fail_next(&self, program: impl Into<String>, message: impl Into<String>) {
        self.failures
            .lock()
            .expect("lock poisoned")
            .insert(program.into(), message.into());
    }

    /// Makes the next successful invocation of `program` return `stdout`,
    /// once.
    pub fn queue_stdout(&self, program: impl Into<String>, stdout: Vec<u8>) {
        self.stdout_queue
            .lock()
            .expect("lock poisoned")
            .insert(program.into(), stdout);
    }
}

impl CommandRunner for FakeCommandRunner {
    fn run(&self, invocation: &Invocation) -> Result<Output, Error> {
        self.invocations
            .lock()
            .expect("lock poisoned")
            .push(invocation.clone());

        if let Some(message) = self
            .failures
            .lock()
            .expect("lock poisoned")
            .remove(&invocation.program)
        {
            return Err(Error::Runtime(anyhow::anyhow!(
                "{}: {}",
                invocation.program,
                message
            )));
        }

        let stdout = self
            .stdout_queue
            .lock()
            .expect("lock poisoned")
            .remove(&invocation.program)
            .unwrap_or_default();

        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout,
            stderr: Vec::new(),
        })
    }
}
