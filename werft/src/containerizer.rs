use std::path::Path;
use std::time::Duration;

use common::{CommandRunner, Error, Handle};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::Command;

use crate::{
    bundle::{self, BundleSpec},
    depot::Depot,
    error::{to_common_error, ContainerizerError},
    exec_preparer::{self, ProcessSpec},
    nstar::NstarRunner,
    process_tracker::ProcessTracker,
    runtime::RuntimeDriver,
};

/// The token the init process is expected to print on stdout once it's
/// up (spec §4.2's "start check"); failure to see it within
/// `START_CHECK_TIMEOUT` is a `RuntimeStartTimeout`.
const START_TOKEN: &str = "werft: container ready";
const START_CHECK_TIMEOUT: Duration = Duration::from_secs(3);

/// Bundle construction, runtime invocation, and the per-container process
/// table (spec §4.2). Owns the Depot and the Bundle Builder's output but
/// holds no reference back to the Gardener: per spec §9's "Cyclic-graph
/// avoidance", facades are constructed per-lookup from subsystem
/// references, never the other way around.
pub struct Containerizer<R: CommandRunner> {
    depot: Depot,
    runtime: RuntimeDriver<R>,
    tracker: ProcessTracker,
    supervisor_binary: String,
    nstar: NstarRunner,
    cgroup_root: std::path::PathBuf,
}

/// Observed state of a live container (spec §3's `ActualContainerSpec`,
/// spec §4.2's "Info / Metrics"). `events` is read from an `events` file
/// in the bundle dir, one tag per line — nothing in this crate appends
/// to it yet (an OOM watcher would), so it is empty until something
/// does.
#[derive(Debug, Clone, Default)]
pub struct ActualContainerSpec {
    pub bundle_path: std::path::PathBuf,
    pub events: Vec<String>,
    pub process_ids: Vec<String>,
}

/// cgroup-derived resource usage (spec §4.2: "Reads cgroup stats").
/// Every field defaults to 0 when the corresponding cgroup file is
/// absent — a container whose cgroup hasn't been created yet, or one
/// running under a cgroup layout this crate doesn't expect, reports
/// zero usage rather than failing the whole `Metrics` call.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupStats {
    pub cpu_usage_nanos: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
}

impl<R: CommandRunner> Containerizer<R> {
    pub fn new(
        depot: Depot,
        runner: R,
        runtime_binary: impl Into<String>,
        supervisor_binary: impl Into<String>,
        nstar_binary: impl Into<String>,
    ) -> Self {
        Self {
            depot,
            runtime: RuntimeDriver::new(runner, runtime_binary),
            tracker: ProcessTracker::default(),
            supervisor_binary: supervisor_binary.into(),
            nstar: NstarRunner::new(nstar_binary),
            cgroup_root: std::path::PathBuf::from("/sys/fs/cgroup"),
        }
    }

    pub fn with_cgroup_root(mut self, root: impl Into<std::path::PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// `Create(spec)` (spec §4.2): build the bundle, write `config.json`,
    /// invoke `runtime run` detached, and confirm the start token appears
    /// on stdout within the timeout.
    #[fehler::throws(Error)]
    pub fn create(&self, spec: &BundleSpec, volume_rootfs: &Path) {
        if self.depot.exists(&spec.handle) {
            fehler::throw!(to_common_error(ContainerizerError::AlreadyExists(
                spec.handle.as_str().to_string()
            )));
        }

        self.depot.create_bundle_dir(&spec.handle, volume_rootfs)?;

        let config = bundle::build(spec);
        let serialized = serde_json::to_vec_pretty(&config).map_err(|e| Error::Io(e.into()))?;
        std::fs::write(self.depot.config_path(&spec.handle), serialized).map_err(|e| Error::Io(e.into()))?;

        let bundle_dir = self.depot.bundle_dir(&spec.handle);
        let output = self
            .runtime
            .run(spec.handle.as_str(), &bundle_dir.display().to_string())
            .map_err(to_common_error)?;

        if !String::from_utf8_lossy(&output.stdout).contains(START_TOKEN) {
            let _ = self.depot.remove_bundle_dir(&spec.handle);
            fehler::throw!(to_common_error(ContainerizerError::RuntimeStartTimeout(
                START_CHECK_TIMEOUT
            )));
        }
    }

    /// `Run(handle, ProcessSpec, IO) -> Process` (spec §4.2): resolves the
    /// user, writes `process.json`, invokes `runtime exec`, and hands
    /// stdio off to the Process Tracker.
    #[fehler::throws(Error)]
    pub async fn run(
        &self,
        handle: &Handle,
        spec: &ProcessSpec,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> (String, i32) {
        if !self.depot.exists(handle) {
            fehler::throw!(to_common_error(ContainerizerError::NoSuchContainer(
                handle.as_str().to_string()
            )));
        }

        let rootfs = self.depot.rootfs_path(handle);
        let process = exec_preparer::prepare(&rootfs, spec, &Vec::new())?;

        let exec_id = uuid::Uuid::new_v4().to_string();
        let process_json = self.depot.process_json_path(handle, &exec_id);
        let pidfile = self.depot.pidfile_path(handle, &exec_id);
        exec_preparer::write_process_json(&process, &process_json)?;

        let exec_result = self.runtime.exec(
            handle.as_str(),
            &process_json.display().to_string(),
            &pidfile.display().to_string(),
        );

        if let Err(err) = exec_result {
            let _ = std::fs::remove_file(&process_json);
            let _ = std::fs::remove_file(&pidfile);
            fehler::throw!(to_common_error(err));
        }

        let mut command = Command::new(&self.supervisor_binary);
        command.arg(handle.as_str()).arg(&exec_id);

        let in_container_pid = self
            .tracker
            .track(exec_id.clone(), command, pidfile, process_json, stdin, stdout, stderr)
            .await?;

        (exec_id, in_container_pid)
    }

    /// `StreamIn(handle, path, user, tar_stream)` (spec §4.2/§6): resolves
    /// the handle's init pid and hands the tar stream to `nstar`, which
    /// enters that pid's mount namespace to unpack it. Must not require
    /// stopping the container, so this never touches the Process Tracker
    /// or the runtime's own `run`/`exec`/`delete` verbs.
    #[fehler::throws(Error)]
    pub async fn stream_in(&self, handle: &Handle, path: &str, user: &str, tar_stream: Box<dyn AsyncRead + Send + Unpin>) {
        if !self.depot.exists(handle) {
            fehler::throw!(to_common_error(ContainerizerError::NoSuchContainer(
                handle.as_str().to_string()
            )));
        }

        let state = self.runtime.state(handle.as_str()).map_err(to_common_error)?;
        self.nstar.stream_in(state.init_process_pid, path, user, tar_stream).await?;
    }

    /// `StreamOut(handle, path, user) -> tar_stream` (spec §4.2/§6):
    /// the read-side counterpart of `stream_in`.
    #[fehler::throws(Error)]
    pub async fn stream_out(&self, handle: &Handle, path: &str, user: &str) -> Box<dyn AsyncRead + Send + Unpin> {
        if !self.depot.exists(handle) {
            fehler::throw!(to_common_error(ContainerizerError::NoSuchContainer(
                handle.as_str().to_string()
            )));
        }

        let state = self.runtime.state(handle.as_str()).map_err(to_common_error)?;
        self.nstar.stream_out(state.init_process_pid, path, user).await?
    }

    /// `Attach(handle, pid, IO) -> Process` (spec §4.2): reattaches stdio
    /// to an existing tracked process by looking up its registry entry.
    #[fehler::throws(Error)]
    pub fn attach(&self, exec_id: &str) -> i32 {
        self.tracker.in_container_pid(exec_id)?
    }

    #[fehler::throws(Error)]
    pub async fn wait(&self, exec_id: &str) -> Option<i32> {
        self.tracker.wait(exec_id).await?
    }

    /// `Destroy(handle)` (spec §4.2): SIGKILL the init, retry-delete via
    /// the runtime, and finally remove the bundle directory. Tolerant of
    /// missing state, per spec §7's "Destroy is best-effort".
    #[fehler::throws(Error)]
    pub fn destroy(&self, handle: &Handle) {
        if let Ok(state) = self.runtime.state(handle.as_str()) {
            if state.init_process_pid > 0 {
                unsafe {
                    libc::kill(state.init_process_pid, libc::SIGKILL);
                }
            }
        }

        if let Err(err) = self.runtime.delete(handle.as_str()) {
            tracing::warn!(%handle, error = %err, "runtime delete failed during destroy, removing bundle anyway");
        }

        self.depot.remove_bundle_dir(handle)?;
    }

    /// `Info(handle)` (spec §4.2): bundle path, the event-store tags
    /// recorded so far, and the in-container pids currently tracked for
    /// this handle (discovered from the depot's own `processes/*.pid`
    /// files, since the Process Tracker's registry is keyed by exec id
    /// rather than partitioned by handle).
    #[fehler::throws(Error)]
    pub fn info(&self, handle: &Handle) -> ActualContainerSpec {
        let bundle_path = self.depot.bundle_dir(handle);

        let events = std::fs::read_to_string(bundle_path.join("events"))
            .unwrap_or_default()
            .lines()
            .map(str::to_owned)
            .collect();

        let process_ids = std::fs::read_dir(self.depot.processes_dir(handle))
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .filter(|entry| entry.path().extension().map(|ext| ext == "pid").unwrap_or(false))
                    .filter_map(|entry| std::fs::read_to_string(entry.path()).ok())
                    .map(|contents| contents.trim().to_owned())
                    .collect()
            })
            .unwrap_or_default();

        ActualContainerSpec { bundle_path, events, process_ids }
    }

    /// `Metrics(handle)` (spec §4.2): reads cgroup v1 `memory`/`cpuacct`
    /// controller files for this handle's cgroup. Best-effort: a missing
    /// file reads as 0 rather than failing the call, since a container
    /// whose runtime hasn't finished cgroup setup yet should still
    /// report (zeroed) metrics rather than error.
    pub fn metrics(&self, handle: &Handle) -> CgroupStats {
        CgroupStats {
            cpu_usage_nanos: self.read_cgroup_u64("cpuacct", handle, "cpuacct.usage"),
            memory_usage_bytes: self.read_cgroup_u64("memory", handle, "memory.usage_in_bytes"),
            memory_limit_bytes: self.read_cgroup_u64("memory", handle, "memory.limit_in_bytes"),
        }
    }

    fn read_cgroup_u64(&self, controller: &str, handle: &Handle, file: &str) -> u64 {
        std::fs::read_to_string(self.cgroup_root.join(controller).join(handle.as_str()).join(file))
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn depot(&self) -> &Depot {
        &self.depot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::FakeCommandRunner;

    fn containerizer() -> (FakeCommandRunner, Containerizer<FakeCommandRunner>, tempfile::TempDir) {
        let depot_dir = tempfile::tempdir().unwrap();
        let runner = FakeCommandRunner::new();
        let containerizer = Containerizer::new(
            Depot::new(depot_dir.path()),
            runner.clone(),
            "/usr/bin/runtime",
            "/usr/bin/iodaemon",
            "/usr/bin/nstar",
        );
        (runner, containerizer, depot_dir)
    }

    fn spec(handle: &str, rootfs: &Path) -> BundleSpec {
        BundleSpec {
            handle: Handle::new(handle).unwrap(),
            rootfs_path: rootfs.to_path_buf(),
            privileged: false,
            limits: Default::default(),
            bind_mounts: vec![],
            env: vec![],
            args: vec!["/bin/sh".into()],
            prestart_hooks: vec![],
            poststop_hooks: vec![],
            log_file: rootfs.join("network.log"),
        }
    }

    #[test]
    fn create_fails_when_the_start_token_never_appears() {
        let (_runner, containerizer, _depot_dir) = containerizer();
        let rootfs = tempfile::tempdir().unwrap();

        let err = containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap_err();

        assert!(matches!(err, common::Error::Runtime(_)));
    }

    #[test]
    fn create_succeeds_once_the_start_token_is_observed() {
        let (runner, containerizer, _depot_dir) = containerizer();
        let rootfs = tempfile::tempdir().unwrap();
        runner.queue_stdout("/usr/bin/runtime", START_TOKEN.as_bytes().to_vec());

        containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap();

        assert!(containerizer.depot().exists(&Handle::new("handle-a").unwrap()));
    }

    #[test]
    fn create_rejects_an_already_existing_handle() {
        let (runner, containerizer, _depot_dir) = containerizer();
        let rootfs = tempfile::tempdir().unwrap();
        runner.queue_stdout("/usr/bin/runtime", START_TOKEN.as_bytes().to_vec());

        containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap();
        let err = containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap_err();

        assert!(matches!(err, common::Error::Validation(_)));
    }

    #[test]
    fn destroy_removes_the_bundle_dir_even_if_delete_keeps_failing() {
        let (runner, containerizer, _depot_dir) = containerizer();
        let rootfs = tempfile::tempdir().unwrap();
        runner.queue_stdout("/usr/bin/runtime", START_TOKEN.as_bytes().to_vec());
        let handle = Handle::new("handle-a").unwrap();
        containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap();

        containerizer.destroy(&handle).unwrap();

        assert!(!containerizer.depot().exists(&handle));
    }

    #[test]
    fn info_reports_the_bundle_path_and_tracked_pids() {
        let (runner, containerizer, _depot_dir) = containerizer();
        let rootfs = tempfile::tempdir().unwrap();
        runner.queue_stdout("/usr/bin/runtime", START_TOKEN.as_bytes().to_vec());
        let handle = Handle::new("handle-a").unwrap();
        containerizer.create(&spec("handle-a", rootfs.path()), rootfs.path()).unwrap();
        std::fs::write(containerizer.depot().processes_dir(&handle).join("p1.pid"), "4242").unwrap();

        let info = containerizer.info(&handle).unwrap();

        assert_eq!(info.bundle_path, containerizer.depot().bundle_dir(&handle));
        assert_eq!(info.process_ids, vec!["4242".to_string()]);
        assert!(info.events.is_empty());
    }

    #[test]
    fn metrics_defaults_to_zero_when_cgroup_files_are_absent() {
        let (runner, containerizer, _depot_dir) = containerizer();
        let handle = Handle::new("handle-a").unwrap();
        let _ = runner;

        let metrics = containerizer.metrics(&handle);

        assert_eq!(metrics.cpu_usage_nanos, 0);
        assert_eq!(metrics.memory_usage_bytes, 0);
    }
}
