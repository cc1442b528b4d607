use std::sync::Arc;
use std::time::Duration;

use common::{CommandRunner, Error, Handle};
use netzwerk::{NetOutRule, Networker};
use storage::{PropertyStore, Storage, StorageEngine};
use tokio::io::{AsyncRead, AsyncWrite};
use werft::{ActualContainerSpec, CgroupStats, Containerizer, ProcessSpec};

use crate::{
    activity::ActivityTracker,
    spec::{ContainerInfo, ContainerMetrics, Process},
    volume_creator::VolumeCreator,
};

const GRACE_TIME_KEY: &str = "garden.grace-time";
const MAPPED_PORTS_KEY: &str = "garden.mapped-ports";

/// A thin facade bound to `(handle, Containerizer, Networker,
/// VolumeCreator, PropertyStore)` (spec §4.1 `Lookup`), constructed
/// fresh on every `Gardener::lookup` rather than held onto by the
/// Gardener — per spec §9's "never let a Container facade hold direct
/// references back to the Gardener" note, this holds the three
/// subsystem references directly instead.
pub struct Container<T: StorageEngine, R: CommandRunner, V: VolumeCreator> {
    handle: Handle,
    containerizer: Arc<Containerizer<R>>,
    networker: Arc<Networker<R>>,
    volume_creator: Arc<V>,
    storage: Arc<Storage<T>>,
    activity: Arc<ActivityTracker>,
}

impl<T: StorageEngine, R: CommandRunner, V: VolumeCreator> std::fmt::Debug for Container<T, R, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container").field("handle", &self.handle).finish()
    }
}

impl<T: StorageEngine, R: CommandRunner, V: VolumeCreator> Container<T, R, V> {
    pub(crate) fn new(
        handle: Handle,
        containerizer: Arc<Containerizer<R>>,
        networker: Arc<Networker<R>>,
        volume_creator: Arc<V>,
        storage: Arc<Storage<T>>,
        activity: Arc<ActivityTracker>,
    ) -> Self {
        Self { handle, containerizer, networker, volume_creator, storage, activity }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    fn properties(&self) -> PropertyStore<'_, T> {
        PropertyStore::new(&self.storage)
    }

    /// `Run(handle, ProcessSpec, IO) -> Process` (spec §4.2/§6).
    pub async fn run(
        &self,
        spec: &ProcessSpec,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stdout: Box<dyn AsyncWrite + Send + Unpin>,
        stderr: Box<dyn AsyncWrite + Send + Unpin>,
    ) -> Result<Process, Error> {
        self.activity.touch(self.handle.as_str());
        let (exec_id, pid) = self.containerizer.run(&self.handle, spec, stdin, stdout, stderr).await?;
        Ok(Process { exec_id, pid })
    }

    /// `Attach(handle, pid, IO) -> Process` (spec §4.2/§6).
    pub fn attach(&self, exec_id: &str) -> Result<Process, Error> {
        self.activity.touch(self.handle.as_str());
        let pid = self.containerizer.attach(exec_id)?;
        Ok(Process { exec_id: exec_id.to_owned(), pid })
    }

    pub async fn wait(&self, exec_id: &str) -> Result<Option<i32>, Error> {
        self.containerizer.wait(exec_id).await
    }

    /// `StreamIn(handle, path, user, tar_stream)` (spec §4.2/§6), delegated
    /// straight to the Containerizer the way `container.go`'s `StreamIn`
    /// delegates to its own containerizer collaborator.
    pub async fn stream_in(&self, path: &str, user: &str, tar_stream: Box<dyn AsyncRead + Send + Unpin>) -> Result<(), Error> {
        self.containerizer.stream_in(&self.handle, path, user, tar_stream).await
    }

    /// `StreamOut(handle, path, user) -> tar_stream` (spec §4.2/§6).
    pub async fn stream_out(&self, path: &str, user: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        self.containerizer.stream_out(&self.handle, path, user).await
    }

    /// `NetIn(handle, host_port, container_port)` (spec §4.4/§6).
    pub fn net_in(&self, host_port: u16, container_port: u16) -> Result<(u16, u16), Error> {
        self.networker.net_in(&self.handle, host_port, container_port, &self.properties())
    }

    /// `NetOut(handle, rule)` (spec §4.4/§6).
    pub fn net_out(&self, rule: &NetOutRule) -> Result<(), Error> {
        self.networker.net_out(&self.handle, rule, &self.properties())
    }

    pub fn set_property(&self, name: impl Into<String>, value: impl Into<String>) -> Result<(), Error> {
        self.properties().set(&self.handle, name, value)
    }

    pub fn property(&self, name: &str) -> Result<String, Error> {
        self.properties().get(&self.handle, name)
    }

    pub fn properties_all(&self) -> Result<std::collections::BTreeMap<String, String>, Error> {
        self.properties().all(&self.handle)
    }

    pub fn remove_property(&self, name: &str) -> Result<(), Error> {
        self.properties().remove(&self.handle, name)
    }

    /// `SetGraceTime(t)` (spec §4.1's `Container` surface, via
    /// `container.go`'s `SetGraceTime`): recorded as a property so it
    /// survives a `Lookup` reconstructing this facade, the same way
    /// `container.go` does it.
    pub fn set_grace_time(&self, grace_time: Duration) -> Result<(), Error> {
        self.properties().set(&self.handle, GRACE_TIME_KEY, grace_time.as_secs().to_string())
    }

    /// `Info(handle)` (spec §4.2/§9 supplement): joins `NetworkConfig`'s
    /// IPs, the Containerizer's `ActualContainerSpec`, and the full
    /// property map.
    pub fn info(&self) -> Result<ContainerInfo, Error> {
        let properties = self.properties();
        let ActualContainerSpec { bundle_path, events, .. } = self.containerizer.info(&self.handle)?;
        let all_properties = properties.all(&self.handle)?;

        let (container_ip, host_ip, external_ip) = match properties.load_network_config(&self.handle) {
            Ok(config) => (config.container_ip.to_string(), config.bridge_ip.to_string(), config.external_ip.to_string()),
            Err(_) => (String::new(), String::new(), String::new()),
        };

        let mapped_ports = properties
            .get(&self.handle, MAPPED_PORTS_KEY)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Ok(ContainerInfo {
            state: "active".into(),
            container_ip,
            host_ip,
            external_ip,
            container_path: bundle_path,
            events,
            properties: all_properties,
            mapped_ports,
        })
    }

    /// `Metrics(handle)` (spec §4.2/§9 supplement): Containerizer cgroup
    /// stats joined with VolumeCreator disk usage.
    pub fn metrics(&self) -> Result<ContainerMetrics, Error> {
        let CgroupStats { cpu_usage_nanos, memory_usage_bytes, memory_limit_bytes } = self.containerizer.metrics(&self.handle);
        let disk = self.volume_creator.metrics(&self.handle)?;

        Ok(ContainerMetrics {
            cpu_usage_nanos,
            memory_usage_bytes,
            memory_limit_bytes,
            disk_bytes_used: disk.bytes_used,
            disk_inodes_used: disk.inodes_used,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use storage::TestStorage;
    use test_helpers::FakeCommandRunner;
    use werft::Depot;

    use super::*;
    use crate::volume_creator::LocalPathVolumeCreator;

    fn container(dir: &tempfile::TempDir) -> Container<storage::Connection, FakeCommandRunner, LocalPathVolumeCreator> {
        let storage = Arc::new(TestStorage::new(dir.path()).unwrap());
        let runner = FakeCommandRunner::new();

        let networker = Arc::new(Networker::new(
            "/usr/local/bin/hook",
            ipnetwork::Ipv4Network::try_from("10.254.0.0/24").unwrap(),
            30,
            60000,
            100,
            runner.clone(),
            "w",
            "10.0.0.1".parse().unwrap(),
            vec![],
            1500,
        ));

        let containerizer = Arc::new(Containerizer::new(
            Depot::new(dir.path().join("depot")),
            runner,
            "/usr/bin/runtime",
            "/usr/bin/iodaemon",
            "/usr/bin/nstar",
        ));

        let handle = Handle::new("handle-a").unwrap();
        PropertyStore::new(&storage).register(&handle, Default::default()).unwrap();

        Container::new(handle, containerizer, networker, Arc::new(LocalPathVolumeCreator), storage, Arc::new(ActivityTracker::new()))
    }

    #[test]
    fn property_roundtrips_through_set_get_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(&dir);

        container.set_property("role", "web").unwrap();
        assert_eq!(container.property("role").unwrap(), "web");

        container.remove_property("role").unwrap();
        assert!(container.property("role").is_err());
    }

    #[test]
    fn info_reports_an_empty_network_config_when_none_was_ever_saved() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(&dir);

        let info = container.info().unwrap();

        assert!(info.container_ip.is_empty());
        assert!(info.events.is_empty());
    }

    #[test]
    fn metrics_defaults_to_zero_for_a_fresh_container() {
        let dir = tempfile::tempdir().unwrap();
        let container = container(&dir);

        let metrics = container.metrics().unwrap();

        assert_eq!(metrics.cpu_usage_nanos, 0);
        assert_eq!(metrics.disk_bytes_used, 0);
    }
}
