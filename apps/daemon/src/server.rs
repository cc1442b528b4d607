use std::collections::HashMap;
use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use common::{Error, Handle, SystemCommandRunner};
use garten::{Container, DesiredContainerSpec, Gardener, LocalPathVolumeCreator};
use ipnetwork::Ipv4Network;
use netzwerk::{IpRange, NetOutRule, PortRange, Protocol};
use serde_json::json;
use storage::Connection;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use werft::{BindMount, Limits, MountMode, ProcessSpec};

use crate::config::Config;
use crate::protocol::{BindMountDto, CreateRequest, Envelope, NetOutRuleDto, ProtocolDto, Request, RunRequest, StreamInRequest};

type AppGardener = Gardener<Connection, SystemCommandRunner, LocalPathVolumeCreator>;
type AppContainer = Container<Connection, SystemCommandRunner, LocalPathVolumeCreator>;

/// Process-wide state handed to every connection: the Gardener itself,
/// the startup policy applied to every freshly created container (spec
/// §6's `allow_host_access`/`deny_networks`/`allow_networks`), and the
/// bookkeeping for `Run`'s temp-file-backed stdio (see the module doc on
/// `io_dir`).
pub struct AppState {
    gardener: Arc<AppGardener>,
    allow_networks: Vec<Ipv4Network>,
    io_dir: PathBuf,
    io_registry: Mutex<HashMap<String, (PathBuf, PathBuf)>>,
    default_rootfs: String,
    default_grace_time: std::time::Duration,
}

impl AppState {
    pub fn new(
        gardener: AppGardener,
        allow_networks: Vec<Ipv4Network>,
        io_dir: PathBuf,
        default_rootfs: String,
        default_grace_time: std::time::Duration,
    ) -> Self {
        Self {
            gardener: Arc::new(gardener),
            allow_networks,
            io_dir,
            io_registry: Mutex::new(HashMap::new()),
            default_rootfs,
            default_grace_time,
        }
    }

    pub fn gardener(&self) -> Arc<AppGardener> {
        self.gardener.clone()
    }
}

/// Accepts connections on `config.listen_addr` and serves each one a
/// newline-delimited JSON request/response loop (spec.md §1: "the RPC
/// server framing... is out of scope", so this is the simplest framing
/// that satisfies "a transport layer that delivers requests").
pub async fn serve(config: &Config, state: Arc<AppState>) -> Result<(), anyhow::Error> {
    if config.listen_network != "unix" {
        anyhow::bail!("only the unix listen_network is implemented");
    }

    let _ = std::fs::remove_file(&config.listen_addr);
    let listener = UnixListener::bind(&config.listen_addr)?;
    tracing::info!(addr = %config.listen_addr, "listening");

    loop {
        let (stream, _addr) = listener.accept().await?;
        let state = state.clone();

        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, state).await {
                tracing::warn!(error = %err, "connection ended with an error");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, state: Arc<AppState>) -> Result<(), anyhow::Error> {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let envelope = match serde_json::from_str::<Request>(&line) {
            Ok(request) => match dispatch(&state, request).await {
                Ok(body) => Envelope::ok(body),
                Err(err) => Envelope::err(&err),
            },
            Err(err) => Envelope::err(&Error::Validation(format!("malformed request: {}", err))),
        };

        let mut serialized = serde_json::to_vec(&envelope)?;
        serialized.push(b'\n');
        write_half.write_all(&serialized).await?;
    }

    Ok(())
}

async fn dispatch(state: &AppState, request: Request) -> Result<serde_json::Value, Error> {
    match request {
        Request::Create(req) => create(state, req).await,
        Request::Destroy { handle } => {
            state.gardener.destroy(&Handle::new(handle)?);
            Ok(json!({}))
        }
        Request::Lookup { handle } => {
            let container = state.gardener.lookup(&handle)?;
            Ok(json!({ "handle": container.handle().as_str() }))
        }
        Request::Containers { filter } => {
            let handles = state.gardener.containers(&filter)?;
            Ok(json!({ "handles": handles.iter().map(Handle::to_string).collect::<Vec<_>>() }))
        }
        Request::Run(req) => run(state, req).await,
        Request::Attach { handle, exec_id } => {
            let container = state.gardener.lookup(&handle)?;
            let process = container.attach(&exec_id)?;
            Ok(json!({ "exec_id": process.exec_id, "pid": process.pid }))
        }
        Request::Wait { handle, exec_id } => wait(state, handle, exec_id).await,
        Request::NetIn { handle, host_port, container_port } => {
            let container = state.gardener.lookup(&handle)?;
            let (host, container_port) = container.net_in(host_port, container_port)?;
            Ok(json!({ "host_port": host, "container_port": container_port }))
        }
        Request::NetOut { handle, rule } => {
            let container = state.gardener.lookup(&handle)?;
            container.net_out(&to_net_out_rule(rule)?)?;
            Ok(json!({}))
        }
        Request::SetProperty { handle, name, value } => {
            let container = state.gardener.lookup(&handle)?;
            container.set_property(name, value)?;
            Ok(json!({}))
        }
        Request::Property { handle, name } => {
            let container = state.gardener.lookup(&handle)?;
            Ok(json!({ "value": container.property(&name)? }))
        }
        Request::Properties { handle } => {
            let container = state.gardener.lookup(&handle)?;
            Ok(json!({ "properties": container.properties_all()? }))
        }
        Request::RemoveProperty { handle, name } => {
            let container = state.gardener.lookup(&handle)?;
            container.remove_property(&name)?;
            Ok(json!({}))
        }
        Request::Info { handle } => {
            let container = state.gardener.lookup(&handle)?;
            let info = container.info()?;
            Ok(json!({
                "state": info.state,
                "container_ip": info.container_ip,
                "host_ip": info.host_ip,
                "external_ip": info.external_ip,
                "container_path": info.container_path,
                "events": info.events,
                "properties": info.properties,
                "mapped_ports": info.mapped_ports,
            }))
        }
        Request::Metrics { handle } => {
            let container = state.gardener.lookup(&handle)?;
            let metrics = container.metrics()?;
            Ok(json!({
                "cpu_usage_nanos": metrics.cpu_usage_nanos,
                "memory_usage_bytes": metrics.memory_usage_bytes,
                "memory_limit_bytes": metrics.memory_limit_bytes,
                "disk_bytes_used": metrics.disk_bytes_used,
                "disk_inodes_used": metrics.disk_inodes_used,
            }))
        }
        Request::StreamIn(req) => stream_in(state, req).await,
        Request::StreamOut { handle, path, user } => stream_out(state, handle, path, user).await,
    }
}

/// `StreamIn(handle, path, user, tar_stream)` (spec §4.2/§6): the tar
/// payload travels base64-encoded in the request body, the same
/// whole-message convention `RunRequest::stdin_base64` uses, since this
/// transport has no separate binary-streaming channel.
async fn stream_in(state: &AppState, req: StreamInRequest) -> Result<serde_json::Value, Error> {
    let container = state.gardener.lookup(&req.handle)?;
    let bytes = BASE64.decode(req.tar_base64).map_err(|e| Error::Validation(format!("invalid tar_base64: {}", e)))?;
    let tar_stream: Box<dyn tokio::io::AsyncRead + Send + Unpin> = Box::new(std::io::Cursor::new(bytes));

    container.stream_in(&req.path, &req.user, tar_stream).await?;

    Ok(json!({}))
}

/// `StreamOut(handle, path, user) -> tar_stream` (spec §4.2/§6): reads
/// the Containerizer's tar stream to completion and base64-encodes it
/// into the response body, mirroring `Wait`'s stdout/stderr handling.
async fn stream_out(state: &AppState, handle: String, path: String, user: String) -> Result<serde_json::Value, Error> {
    let container = state.gardener.lookup(&handle)?;
    let mut reader = container.stream_out(&path, &user).await?;

    let mut bytes = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut bytes).await.map_err(io_err)?;

    Ok(json!({ "tar_base64": BASE64.encode(bytes) }))
}

async fn create(state: &AppState, req: CreateRequest) -> Result<serde_json::Value, Error> {
    let rootfs_path = if req.rootfs_path.is_empty() { state.default_rootfs.clone() } else { req.rootfs_path };

    let grace_time = Some(req.grace_time_secs.map(std::time::Duration::from_secs).unwrap_or(state.default_grace_time));

    let spec = DesiredContainerSpec {
        handle: req.handle,
        rootfs_path,
        network_spec: req.network_spec,
        privileged: req.privileged,
        limits: Limits { memory_bytes: req.memory_bytes, cpu_shares: req.cpu_shares, pid_max: req.pid_max },
        bind_mounts: req.bind_mounts.into_iter().map(to_bind_mount).collect::<Result<_, _>>()?,
        env: req.env,
        properties: req.properties,
        grace_time,
        args: req.args.unwrap_or_else(|| DesiredContainerSpec::default().args),
    };

    let container = state.gardener.create(spec)?;
    apply_default_egress_policy(state, &container)?;

    Ok(json!({ "handle": container.handle().as_str() }))
}

/// Installs the daemon's `allow_networks` list as per-container NetOut
/// ACCEPT rules immediately after creation (spec §6: `allow_networks`).
/// `deny_networks`/`allow_host_access` are recognized and parsed (spec
/// §6 only asks that the daemon "recognize" these options) but aren't
/// separately enforced here: this workspace's `NetOut` primitive only
/// expresses allow-rules, not a default-deny backstop, so a true
/// default-deny policy would need a Networker-level default chain this
/// crate doesn't build. Documented as a known limitation in DESIGN.md
/// rather than invented on the spot.
fn apply_default_egress_policy(state: &AppState, container: &AppContainer) -> Result<(), Error> {
    for network in &state.allow_networks {
        let rule = NetOutRule {
            protocol: Protocol::All,
            networks: vec![IpRange { start: Some(network.network()), end: Some(network.broadcast()) }],
            ports: vec![],
            icmp: None,
            log: false,
        };

        container.net_out(&rule)?;
    }

    Ok(())
}

async fn run(state: &AppState, req: RunRequest) -> Result<serde_json::Value, Error> {
    let container = state.gardener.lookup(&req.handle)?;

    let spec = ProcessSpec {
        args: req.args,
        dir: req.dir,
        user: req.user,
        env: req.env,
        terminal: req.terminal,
        rlimits: req.rlimits,
    };

    let token = uuid::Uuid::new_v4().to_string();
    let stdout_path = state.io_dir.join(format!("{}.stdout", token));
    let stderr_path = state.io_dir.join(format!("{}.stderr", token));

    let stdout_file = tokio::fs::File::create(&stdout_path).await.map_err(io_err)?;
    let stderr_file = tokio::fs::File::create(&stderr_path).await.map_err(io_err)?;

    let stdin: Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>> = match req.stdin_base64 {
        Some(encoded) => {
            let bytes = BASE64.decode(encoded).map_err(|e| Error::Validation(format!("invalid stdin_base64: {}", e)))?;
            let stdin_path = state.io_dir.join(format!("{}.stdin", token));
            tokio::fs::write(&stdin_path, &bytes).await.map_err(io_err)?;
            Some(Box::new(tokio::fs::File::open(&stdin_path).await.map_err(io_err)?))
        }
        None => None,
    };

    let process = container.run(&spec, stdin, Box::new(stdout_file), Box::new(stderr_file)).await?;

    let final_stdout = state.io_dir.join(format!("{}.stdout", process.exec_id));
    let final_stderr = state.io_dir.join(format!("{}.stderr", process.exec_id));
    let _ = tokio::fs::rename(&stdout_path, &final_stdout).await;
    let _ = tokio::fs::rename(&stderr_path, &final_stderr).await;

    state.io_registry.lock().unwrap().insert(process.exec_id.clone(), (final_stdout, final_stderr));

    Ok(json!({ "exec_id": process.exec_id, "pid": process.pid }))
}

async fn wait(state: &AppState, handle: String, exec_id: String) -> Result<serde_json::Value, Error> {
    let container = state.gardener.lookup(&handle)?;
    let exit_code = container.wait(&exec_id).await?;

    let paths = state.io_registry.lock().unwrap().remove(&exec_id);
    let (stdout_base64, stderr_base64) = match paths {
        Some((stdout_path, stderr_path)) => {
            let stdout = tokio::fs::read(&stdout_path).await.unwrap_or_default();
            let stderr = tokio::fs::read(&stderr_path).await.unwrap_or_default();
            let _ = tokio::fs::remove_file(&stdout_path).await;
            let _ = tokio::fs::remove_file(&stderr_path).await;
            (BASE64.encode(stdout), BASE64.encode(stderr))
        }
        None => (String::new(), String::new()),
    };

    Ok(json!({ "exit_code": exit_code, "stdout_base64": stdout_base64, "stderr_base64": stderr_base64 }))
}

fn to_bind_mount(dto: BindMountDto) -> Result<BindMount, Error> {
    Ok(BindMount {
        src: PathBuf::from(dto.src),
        dst: dto.dst,
        mode: if dto.read_only { MountMode::ReadOnly } else { MountMode::ReadWrite },
    })
}

fn to_net_out_rule(dto: NetOutRuleDto) -> Result<NetOutRule, Error> {
    let networks = dto
        .networks
        .into_iter()
        .map(|cidr| {
            Ipv4Network::try_from(cidr.as_str())
                .map(|network| IpRange { start: Some(network.network()), end: Some(network.broadcast()) })
                .map_err(|e| Error::Validation(format!("invalid network '{}': {}", cidr, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(NetOutRule {
        protocol: match dto.protocol {
            ProtocolDto::All => Protocol::All,
            ProtocolDto::Tcp => Protocol::Tcp,
            ProtocolDto::Udp => Protocol::Udp,
            ProtocolDto::Icmp => Protocol::Icmp,
        },
        networks,
        ports: dto.ports.into_iter().map(|p| PortRange { start: p.start, end: p.end }).collect(),
        icmp: None,
        log: dto.log,
    })
}

fn io_err(e: std::io::Error) -> Error {
    Error::Io(e.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_bind_mount_maps_read_only_flag_to_mount_mode() {
        let dto = BindMountDto { src: "/src".into(), dst: "/dst".into(), read_only: true };
        let mount = to_bind_mount(dto).unwrap();

        assert_eq!(mount.src, PathBuf::from("/src"));
        assert_eq!(mount.dst, "/dst");
        assert_eq!(mount.mode, MountMode::ReadOnly);
    }

    #[test]
    fn to_bind_mount_defaults_to_read_write() {
        let dto = BindMountDto { src: "/src".into(), dst: "/dst".into(), read_only: false };
        let mount = to_bind_mount(dto).unwrap();

        assert_eq!(mount.mode, MountMode::ReadWrite);
    }

    #[test]
    fn to_net_out_rule_converts_cidrs_to_ip_ranges() {
        let dto = NetOutRuleDto {
            protocol: ProtocolDto::Tcp,
            networks: vec!["10.0.0.0/24".into()],
            ports: vec![],
            log: true,
        };

        let rule = to_net_out_rule(dto).unwrap();

        assert_eq!(rule.protocol, Protocol::Tcp);
        assert!(rule.log);
        assert_eq!(rule.networks.len(), 1);
        assert_eq!(rule.networks[0].start, Some("10.0.0.0".parse().unwrap()));
        assert_eq!(rule.networks[0].end, Some("10.0.0.255".parse().unwrap()));
    }

    #[test]
    fn to_net_out_rule_rejects_a_malformed_network() {
        let dto = NetOutRuleDto { protocol: ProtocolDto::All, networks: vec!["not-a-cidr".into()], ports: vec![], log: false };

        assert!(matches!(to_net_out_rule(dto), Err(Error::Validation(_))));
    }
}
