use std::collections::BTreeMap;
use std::path::PathBuf;

use common::EnvList;
use werft::{BindMount, Limits};

/// Input to `Gardener::create` (spec §3 `DesiredContainerSpec`).
/// `network_spec` is passed through to `Networker::hooks` unparsed -
/// empty means a dynamic subnet/IP, `<cidr>` a static subnet with a
/// dynamic IP, `<ip>/<cidr>` both static (spec §4.4 step 1).
#[derive(Debug, Clone)]
pub struct DesiredContainerSpec {
    pub handle: Option<String>,
    pub rootfs_path: String,
    pub network_spec: String,
    pub privileged: bool,
    pub limits: Limits,
    pub bind_mounts: Vec<BindMount>,
    pub env: EnvList,
    pub properties: BTreeMap<String, String>,
    pub grace_time: Option<std::time::Duration>,
    /// The bundle's own init process - the one `Create` starts and
    /// `Destroy` eventually SIGKILLs. Individual `Run` calls exec further
    /// processes into the running container rather than replacing this
    /// one, so it only needs to stay alive; defaults to an idle loop.
    pub args: Vec<String>,
}

impl Default for DesiredContainerSpec {
    fn default() -> Self {
        Self {
            handle: None,
            rootfs_path: String::new(),
            network_spec: String::new(),
            privileged: false,
            limits: Limits::default(),
            bind_mounts: Vec::new(),
            env: EnvList::new(),
            properties: BTreeMap::new(),
            grace_time: None,
            args: vec!["/bin/sh".into(), "-c".into(), "while true; do sleep 86400; done".into()],
        }
    }
}

/// Joined snapshot for `Container::info` (spec §4.1, modeled on
/// `examples/original_source/gardener/container.go`'s `Info`): the
/// Containerizer's bundle path/events, the Networker's recorded IPs, and
/// the Property Store's full property map.
#[derive(Debug, Clone, Default)]
pub struct ContainerInfo {
    pub state: String,
    pub container_ip: String,
    pub host_ip: String,
    pub external_ip: String,
    pub container_path: PathBuf,
    pub events: Vec<String>,
    pub properties: BTreeMap<String, String>,
    pub mapped_ports: Vec<(u16, u16)>,
}

/// A running or attached process inside a container (spec §4.1's
/// `Container.Run`/`Container.Attach` -> `Process`). `exec_id` is the
/// opaque token `Wait` and a later `Attach` key off of; `pid` is the
/// in-container process id, surfaced for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub exec_id: String,
    pub pid: i32,
}

/// Joined snapshot for `Container::metrics`: Containerizer cgroup stats
/// plus VolumeCreator disk usage (spec §4.1 `Metrics`).
#[derive(Debug, Clone, Default)]
pub struct ContainerMetrics {
    pub cpu_usage_nanos: u64,
    pub memory_usage_bytes: u64,
    pub memory_limit_bytes: u64,
    pub disk_bytes_used: u64,
    pub disk_inodes_used: u64,
}
