use std::collections::HashMap;
use std::path::PathBuf;

use common::{EnvList, Handle, Invocation};
use serde::{Deserialize, Serialize};

/// [OCI Container Configuration file](https://github.com/opencontainers/runtime-spec/blob/v1.0.0/config.md),
/// the shape `<depot>/<handle>/config.json` is serialized from.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    #[serde(rename = "ociVersion")]
    pub oci_version: String,
    pub root: Option<Root>,
    pub mounts: Option<Vec<Mount>>,
    pub process: Option<Process>,
    pub hooks: Option<Hooks>,
    pub linux: Option<Linux>,
    pub annotations: Option<HashMap<String, String>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Root {
    pub path: PathBuf,
    pub readonly: Option<bool>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Mount {
    pub destination: String,
    pub source: Option<String>,
    pub options: Option<Vec<String>>,
    pub r#type: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Process {
    pub terminal: Option<bool>,
    pub cwd: String,
    pub env: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    pub rlimits: Option<Vec<Rlimit>>,
    pub user: User,
    pub capabilities: Option<Capabilities>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Rlimit {
    pub r#type: String,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
    pub umask: Option<u32>,
    #[serde(rename = "additionalGids")]
    pub additional_gids: Option<Vec<u32>>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Capabilities {
    pub bounding: Vec<String>,
    pub effective: Vec<String>,
    pub inheritable: Vec<String>,
    pub permitted: Vec<String>,
    pub ambient: Vec<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Hooks {
    pub prestart: Option<Vec<Hook>>,
    pub poststop: Option<Vec<Hook>>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Hook {
    pub path: String,
    pub args: Option<Vec<String>>,
    pub env: Option<Vec<String>>,
    pub timeout: Option<u32>,
}

impl From<Invocation> for Hook {
    fn from(invocation: Invocation) -> Self {
        Self {
            path: invocation.program,
            args: Some(invocation.args),
            env: None,
            timeout: None,
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Linux {
    pub namespaces: Vec<Namespace>,
    #[serde(rename = "uidMappings")]
    pub uid_mappings: Option<Vec<IdMapping>>,
    #[serde(rename = "gidMappings")]
    pub gid_mappings: Option<Vec<IdMapping>>,
    pub resources: Option<Resources>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Namespace {
    pub r#type: String,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct IdMapping {
    #[serde(rename = "containerID")]
    pub container_id: u32,
    #[serde(rename = "hostID")]
    pub host_id: u32,
    pub size: u32,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct Resources {
    pub memory: Option<Memory>,
    pub cpu: Option<Cpu>,
    pub pids: Option<Pids>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Memory {
    pub limit: i64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Cpu {
    pub shares: u64,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Pids {
    pub limit: i64,
}

/// Resource limits a `DesiredContainerSpec` carries (spec §3's
/// `limits` attribute); `None` fields are left untranslated into the
/// bundle rather than defaulted, so a spec that only caps memory doesn't
/// also clamp pids.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub memory_bytes: Option<i64>,
    pub cpu_shares: Option<u64>,
    pub pid_max: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountMode {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone)]
pub struct BindMount {
    pub src: PathBuf,
    pub dst: String,
    pub mode: MountMode,
}

/// Input to the Rules pipeline: everything Containerizer.Create needs to
/// build a bundle, assembled by Gardener from `DesiredContainerSpec` plus
/// the rootfs path `VolumeCreator` returned and the hook commands
/// `Networker.Hooks` returned.
#[derive(Debug, Clone)]
pub struct BundleSpec {
    pub handle: Handle,
    pub rootfs_path: PathBuf,
    pub privileged: bool,
    pub limits: Limits,
    pub bind_mounts: Vec<BindMount>,
    pub env: EnvList,
    pub args: Vec<String>,
    pub prestart_hooks: Vec<Invocation>,
    pub poststop_hooks: Vec<Invocation>,
    pub log_file: PathBuf,
}

/// The fixed 14-element default capability set for unprivileged
/// containers (spec §9 open-question decision: the `guardiancmd`
/// variant, not the duplicate `main.go`/`bundler.go` privileged-only
/// list).
const UNPRIVILEGED_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_FSETID",
    "CAP_FOWNER",
    "CAP_MKNOD",
    "CAP_NET_RAW",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETFCAP",
    "CAP_SETPCAP",
    "CAP_NET_BIND_SERVICE",
    "CAP_SYS_CHROOT",
    "CAP_KILL",
    "CAP_AUDIT_WRITE",
];

const PRIVILEGED_CAPABILITIES: &[&str] = &[
    "CAP_CHOWN",
    "CAP_DAC_OVERRIDE",
    "CAP_DAC_READ_SEARCH",
    "CAP_FOWNER",
    "CAP_FSETID",
    "CAP_KILL",
    "CAP_SETGID",
    "CAP_SETUID",
    "CAP_SETPCAP",
    "CAP_LINUX_IMMUTABLE",
    "CAP_NET_BIND_SERVICE",
    "CAP_NET_BROADCAST",
    "CAP_NET_ADMIN",
    "CAP_NET_RAW",
    "CAP_IPC_LOCK",
    "CAP_IPC_OWNER",
    "CAP_SYS_MODULE",
    "CAP_SYS_RAWIO",
    "CAP_SYS_CHROOT",
    "CAP_SYS_PTRACE",
    "CAP_SYS_PACCT",
    "CAP_SYS_ADMIN",
    "CAP_SYS_BOOT",
    "CAP_SYS_NICE",
    "CAP_SYS_RESOURCE",
    "CAP_SYS_TIME",
    "CAP_SYS_TTY_CONFIG",
    "CAP_MKNOD",
    "CAP_LEASE",
    "CAP_AUDIT_WRITE",
    "CAP_AUDIT_CONTROL",
    "CAP_SETFCAP",
    "CAP_MAC_OVERRIDE",
    "CAP_MAC_ADMIN",
    "CAP_SYSLOG",
    "CAP_WAKE_ALARM",
    "CAP_BLOCK_SUSPEND",
    "CAP_AUDIT_READ",
];

/// Host slot the mapped container root lands on, reserved out of the
/// subuid range (spec §4.2 rule 1: "container root -> host
/// `max_valid_uid` reserved slot").
const MAPPED_ROOT_HOST_ID: u32 = 65534;
const MAPPED_RANGE_SIZE: u32 = 65536;

/// One step of the ordered Bundle Builder pipeline (spec §4.2). Rules run
/// in a fixed order and each only ever adds to the config the previous
/// rules built up; no rule inspects another rule's output.
trait Rule {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec);
}

struct Base;

impl Rule for Base {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        let mut namespaces = vec![
            Namespace { r#type: "pid".into() },
            Namespace { r#type: "net".into() },
            Namespace { r#type: "uts".into() },
            Namespace { r#type: "ipc".into() },
            Namespace { r#type: "mount".into() },
        ];

        let (uid_mappings, gid_mappings) = if spec.privileged {
            (None, None)
        } else {
            namespaces.push(Namespace { r#type: "user".into() });
            let mapping = vec![
                IdMapping { container_id: 0, host_id: MAPPED_ROOT_HOST_ID, size: 1 },
                IdMapping { container_id: 1, host_id: 1, size: MAPPED_RANGE_SIZE - 1 },
            ];
            (Some(mapping.clone()), Some(mapping))
        };

        config.linux = Some(Linux {
            namespaces,
            uid_mappings,
            gid_mappings,
            resources: None,
        });

        config.annotations = Some(generate_annotations());
    }
}

struct RootFS;

impl Rule for RootFS {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        // AUFS-style rootfs drivers refuse pivot_root without a
        // pre-existing mountpoint directory owned by the mapped root.
        let pivot_root = spec.rootfs_path.join(".pivot_root");
        let _ = std::fs::create_dir_all(&pivot_root);

        config.root = Some(Root {
            path: spec.rootfs_path.clone(),
            readonly: Some(false),
        });
    }
}

struct Limit;

impl Rule for Limit {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        if spec.limits.memory_bytes.is_none()
            && spec.limits.cpu_shares.is_none()
            && spec.limits.pid_max.is_none()
        {
            return;
        }

        let linux = config.linux.get_or_insert_with(Default::default);
        linux.resources = Some(Resources {
            memory: spec.limits.memory_bytes.map(|limit| Memory { limit }),
            cpu: spec.limits.cpu_shares.map(|shares| Cpu { shares }),
            pids: spec.limits.pid_max.map(|limit| Pids { limit }),
        });
    }
}

struct HooksRule;

impl Rule for HooksRule {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        let path_env = format!("PATH={}", std::env::var("PATH").unwrap_or_default());
        let log_env = format!("GARDEN_LOG_FILE={}", spec.log_file.display());

        let with_env = |invocation: &Invocation| Hook {
            path: invocation.program.clone(),
            args: Some(invocation.args.clone()),
            env: Some(vec![path_env.clone(), log_env.clone()]),
            timeout: None,
        };

        let prestart = spec.prestart_hooks.iter().map(with_env).collect();
        // LIFO: the last hook to configure something tears it down first.
        let poststop = spec.poststop_hooks.iter().rev().map(with_env).collect();

        config.hooks = Some(Hooks {
            prestart: Some(prestart),
            poststop: Some(poststop),
        });
    }
}

struct BindMounts;

impl Rule for BindMounts {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        let mut mounts = config.mounts.clone().unwrap_or_default();

        for bind_mount in &spec.bind_mounts {
            let options = match bind_mount.mode {
                MountMode::ReadOnly => vec!["bind".into(), "ro".into()],
                MountMode::ReadWrite => vec!["bind".into(), "rw".into()],
            };

            mounts.push(Mount {
                destination: bind_mount.dst.clone(),
                source: Some(bind_mount.src.display().to_string()),
                options: Some(options),
                r#type: Some("bind".into()),
            });
        }

        config.mounts = Some(mounts);
    }
}

struct Env;

impl Rule for Env {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        let mut env = spec.env.clone();

        if !env.iter().any(|kv| kv.starts_with("USER=")) {
            env.push(format!(
                "USER={}",
                if spec.privileged { "root" } else { "vcap" }
            ));
        }
        if !env.iter().any(|kv| kv.starts_with("PATH=")) {
            let default_path = if spec.privileged {
                "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin"
            } else {
                "/usr/local/bin:/usr/bin:/bin"
            };
            env.push(format!("PATH={}", default_path));
        }

        let process = config.process.get_or_insert_with(|| Process {
            terminal: Some(false),
            cwd: "/".into(),
            env: None,
            args: Some(spec.args.clone()),
            rlimits: None,
            user: User { uid: 0, gid: 0, umask: None, additional_gids: None },
            capabilities: None,
        });
        process.env = Some(env);
    }
}

struct PrivilegedCaps;

impl Rule for PrivilegedCaps {
    fn apply(&self, config: &mut RuntimeConfig, spec: &BundleSpec) {
        let names: Vec<String> = if spec.privileged {
            PRIVILEGED_CAPABILITIES.iter().map(|s| s.to_string()).collect()
        } else {
            UNPRIVILEGED_CAPABILITIES.iter().map(|s| s.to_string()).collect()
        };

        let capabilities = Capabilities {
            bounding: names.clone(),
            effective: names.clone(),
            inheritable: names.clone(),
            permitted: names.clone(),
            ambient: names,
        };

        if let Some(process) = config.process.as_mut() {
            process.capabilities = Some(capabilities);
        }
    }
}

fn generate_annotations() -> HashMap<String, String> {
    let mut annotations = HashMap::new();
    annotations.insert("io.container.manager".into(), "werft".into());
    annotations.insert("org.opencontainers.image.stopSignal".into(), "15".into());
    annotations
}

/// Runs the ordered Rules pipeline (spec §4.2) and returns the finished
/// OCI config. The `Rules[]` composition is authoritative per spec §9's
/// open-question decision; no `BundleTemplate.Bundle(spec)` monolith.
pub fn build(spec: &BundleSpec) -> RuntimeConfig {
    let rules: Vec<Box<dyn Rule>> = vec![
        Box::new(Base),
        Box::new(RootFS),
        Box::new(Limit),
        Box::new(HooksRule),
        Box::new(BindMounts),
        Box::new(Env),
        Box::new(PrivilegedCaps),
    ];

    let mut config = RuntimeConfig {
        oci_version: "1.0.2".into(),
        ..Default::default()
    };

    for rule in rules {
        rule.apply(&mut config, spec);
    }

    config
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> BundleSpec {
        BundleSpec {
            handle: Handle::new("handle-a").unwrap(),
            rootfs_path: "/tmp/handle-a/rootfs".into(),
            privileged: false,
            limits: Limits { memory_bytes: Some(1024), cpu_shares: None, pid_max: None },
            bind_mounts: vec![BindMount {
                src: "/host/data".into(),
                dst: "/data".into(),
                mode: MountMode::ReadOnly,
            }],
            env: vec!["FOO=bar".into()],
            args: vec!["/bin/sh".into()],
            prestart_hooks: vec![Invocation::new("/bin/hook", vec!["--action=create"])],
            poststop_hooks: vec![
                Invocation::new("/bin/hook-a", Vec::<String>::new()),
                Invocation::new("/bin/hook-b", Vec::<String>::new()),
            ],
            log_file: "/tmp/handle-a/network.log".into(),
        }
    }

    #[test]
    fn unprivileged_containers_get_a_user_namespace_and_mapping() {
        let config = build(&spec());
        let linux = config.linux.unwrap();

        assert!(linux.namespaces.iter().any(|ns| ns.r#type == "user"));
        assert_eq!(linux.uid_mappings.unwrap()[0].host_id, MAPPED_ROOT_HOST_ID);
    }

    #[test]
    fn privileged_containers_skip_the_user_namespace() {
        let mut spec = spec();
        spec.privileged = true;

        let config = build(&spec);
        let linux = config.linux.unwrap();

        assert!(!linux.namespaces.iter().any(|ns| ns.r#type == "user"));
        assert!(linux.uid_mappings.is_none());
    }

    #[test]
    fn poststop_hooks_are_reversed() {
        let config = build(&spec());
        let poststop = config.hooks.unwrap().poststop.unwrap();

        assert_eq!(poststop[0].path, "/bin/hook-b");
        assert_eq!(poststop[1].path, "/bin/hook-a");
    }

    #[test]
    fn env_gets_default_user_and_path_when_absent() {
        let config = build(&spec());
        let env = config.process.unwrap().env.unwrap();

        assert!(env.iter().any(|kv| kv == "USER=vcap"));
        assert!(env.iter().any(|kv| kv.starts_with("PATH=")));
    }

    #[test]
    fn unprivileged_caps_are_the_fixed_fourteen() {
        let config = build(&spec());
        let caps = config.process.unwrap().capabilities.unwrap();

        assert_eq!(caps.bounding.len(), 14);
    }

    #[test]
    fn bind_mounts_are_appended_after_base_mounts() {
        let config = build(&spec());
        let mounts = config.mounts.unwrap();

        assert_eq!(mounts[0].destination, "/data");
        assert_eq!(mounts[0].options.as_ref().unwrap()[0], "bind");
    }
}
