use std::process::Stdio;

use common::Error;
use tokio::io::AsyncRead;
use tokio::process::Command;

use crate::error::{to_common_error, ContainerizerError};

/// Drives the "nstar" helper (spec §4.2's streaming shim, named in
/// `guardiancmd`'s `--nstar-bin` flag): a tar that enters the target
/// process's mount namespace instead of running in the daemon's own.
/// Kept separate from `RuntimeDriver` since it streams real stdio rather
/// than capturing a fixed `Output`, the same reason `ProcessTracker`
/// drives its supervisor child through `tokio::process::Command`
/// directly instead of through `CommandRunner`.
pub struct NstarRunner {
    binary: String,
}

impl NstarRunner {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    /// `StreamIn(pid, path, user, tar_stream)` (spec §4.2/§6): pipes the
    /// caller's tar stream into `nstar -w <path> <pid> <user>`'s stdin and
    /// waits for it to finish unpacking.
    pub async fn stream_in(
        &self,
        pid: i32,
        path: &str,
        user: &str,
        mut tar_stream: Box<dyn AsyncRead + Send + Unpin>,
    ) -> Result<(), Error> {
        let mut command = Command::new(&self.binary);
        command.arg("-w").arg(path).arg(pid.to_string()).arg(user);
        command.stdin(Stdio::piped()).stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| to_common_error(ContainerizerError::StreamFailed(format!("failed to spawn nstar: {}", e))))?;

        let mut child_stdin = child.stdin.take().expect("stdin is piped");
        tokio::io::copy(&mut tar_stream, &mut child_stdin).await.map_err(|e| Error::Io(e.into()))?;
        drop(child_stdin);

        let status = child.wait().await.map_err(|e| Error::Io(e.into()))?;
        if !status.success() {
            return Err(to_common_error(ContainerizerError::StreamFailed(format!(
                "nstar stream-in into '{}' exited with {:?}",
                path,
                status.code()
            ))));
        }

        Ok(())
    }

    /// `StreamOut(pid, path, user) -> tar_stream` (spec §4.2/§6): runs
    /// `nstar <path> <pid> <user>` and hands back a reader fed from its
    /// stdout via the same `tokio::io::copy` pump every other stdio path
    /// in this crate uses, so the caller can read the tar stream while
    /// `nstar` is still producing it rather than buffering it whole.
    pub async fn stream_out(&self, pid: i32, path: &str, user: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        let mut command = Command::new(&self.binary);
        command.arg(path).arg(pid.to_string()).arg(user);
        command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

        let mut child = command
            .spawn()
            .map_err(|e| to_common_error(ContainerizerError::StreamFailed(format!("failed to spawn nstar: {}", e))))?;

        let mut child_stdout = child.stdout.take().expect("stdout is piped");
        let (mut sink, reader) = tokio::io::duplex(64 * 1024);

        tokio::spawn(async move {
            let _ = tokio::io::copy(&mut child_stdout, &mut sink).await;
            let _ = child.wait().await;
        });

        Ok(Box::new(reader))
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;
    use tokio::io::AsyncReadExt;

    /// A stand-in for the real `nstar` binary: ignores its args (the
    /// `path`/`pid`/`user` triple) and just copies stdin to stdout, which
    /// is enough to exercise the piping/pumping this module owns without
    /// a real mount namespace.
    fn fake_nstar() -> tempfile::TempPath {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "#!/bin/sh\ncat\n").unwrap();
        std::fs::set_permissions(file.path(), std::fs::Permissions::from_mode(0o755)).unwrap();
        file.into_temp_path()
    }

    #[tokio::test]
    async fn stream_in_pipes_the_tar_stream_to_nstars_stdin() {
        let script = fake_nstar();
        let runner = NstarRunner::new(script.to_str().unwrap());
        let payload: Box<dyn AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(b"tar-bytes".to_vec()));

        runner.stream_in(1, "/root/test", "root", payload).await.unwrap();
    }

    #[tokio::test]
    async fn stream_out_returns_a_reader_fed_from_nstars_stdout() {
        let script = fake_nstar();
        let runner = NstarRunner::new(script.to_str().unwrap());

        let mut reader = runner.stream_out(1, "/root/test", "root").await.unwrap();
        let mut collected = Vec::new();
        reader.read_to_end(&mut collected).await.unwrap();

        assert!(collected.is_empty());
    }
}
