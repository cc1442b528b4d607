use std::process::{Command, Output};

use fehler::throw;

use crate::Error;

/// A single invocation: program plus argv, independent of how it's run.
/// Carried as plain data (rather than `std::process::Command`, which
/// can't be inspected or cloned) so that a test double can record and
/// assert on exactly what the Networker/Containerizer tried to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Narrow seam around process spawning, so `ip`/`iptables`/runtime-binary
/// invocations (netzwerk, werft) can be exercised in tests without a
/// kernel. One production implementation (`SystemCommandRunner`), one test
/// double (`test_helpers::FakeCommandRunner`) — no further polymorphism.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> Result<Output, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    #[fehler::throws(Error)]
    fn run(&self, invocation: &Invocation) -> Output {
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .map_err(|e| Error::Io(e.into()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);

            throw!(Error::Runtime(anyhow::anyhow!(
                "{}: {} (exit {:?})",
                invocation.program,
                stderr.trim(),
                output.status.code()
            )));
        }

        output
    }
}
