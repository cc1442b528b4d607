use std::io::Read as _;
use std::net::Ipv4Addr;
use std::path::Path;
use std::process::exit;

use anyhow::{Context, Error};
use clap::Parser;
use common::{NetworkConfig, SystemCommandRunner};
use ipnetwork::Ipv4Network;
use netzwerk::{configure, FirewallShim, NetnsCommandRunner};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum Action {
    Create,
    Destroy,
}

/// OCI prestart/poststop hook invoked by the runtime (spec §4.4). One
/// binary, `--action` picks the direction; every other flag mirrors a
/// `NetworkConfig` field, named exactly as `Networker::hook_invocation`
/// renders them.
#[derive(Debug, Parser)]
struct Args {
    #[arg(long, value_enum)]
    action: Action,

    #[arg(long = "host-interface")]
    host_interface: String,

    #[arg(long = "container-interface")]
    container_interface: String,

    #[arg(long = "bridge-interface")]
    bridge_interface: String,

    #[arg(long = "bridge-ip")]
    bridge_ip: Ipv4Addr,

    #[arg(long = "container-ip")]
    container_ip: Ipv4Addr,

    #[arg(long = "external-ip")]
    external_ip: Ipv4Addr,

    #[arg(long = "subnet")]
    subnet: Ipv4Network,

    #[arg(long)]
    mtu: u32,

    #[arg(long = "iptable-prefix")]
    iptable_prefix: String,

    #[arg(long = "iptable-instance")]
    iptable_instance: String,

    #[arg(long = "dns-server")]
    dns_server: Vec<Ipv4Addr>,
}

impl From<Args> for NetworkConfig {
    fn from(args: Args) -> Self {
        NetworkConfig {
            host_intf: args.host_interface,
            container_intf: args.container_interface,
            bridge_name: args.bridge_interface,
            bridge_ip: args.bridge_ip,
            container_ip: args.container_ip,
            subnet: args.subnet,
            mtu: args.mtu,
            external_ip: args.external_ip,
            iptable_prefix: args.iptable_prefix,
            iptable_instance: args.iptable_instance,
            dns_servers: args.dns_server,
        }
    }
}

/// The subset of the OCI hook state object (delivered on stdin) this hook
/// actually needs: the container's pid, to derive its network namespace.
#[derive(Debug, Deserialize)]
struct HookState {
    pid: i32,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("werft-hook: {:#}", err);
        exit(1);
    }
}

fn run() -> Result<(), Error> {
    let args = Args::parse();
    let _guard = setup_logging();
    let action = args.action;
    let config = NetworkConfig::from(args);

    match action {
        Action::Create => create(&config),
        Action::Destroy => destroy(&config),
    }
}

fn create(config: &NetworkConfig) -> Result<(), Error> {
    let state = read_hook_state()?;
    let netns_path = format!("/proc/{}/ns/net", state.pid);

    tracing::info!(handle = %config.iptable_instance, netns = %netns_path, "configuring hooks for create");

    let host_runner = SystemCommandRunner;
    configure::configure_host(&host_runner, config, &netns_path)
        .with_context(|| "host-side network configuration failed")?;

    let container_runner = NetnsCommandRunner::new(SystemCommandRunner, netns_path);
    configure::configure_container(&container_runner, config)
        .with_context(|| "container-side network configuration failed")?;

    let firewall = FirewallShim::new(SystemCommandRunner, config.iptable_prefix.clone());
    firewall
        .create_instance_chains(&config.iptable_instance, &config.bridge_name, config.container_ip, &config.subnet)
        .with_context(|| "instance chain creation failed")?;

    Ok(())
}

fn destroy(config: &NetworkConfig) -> Result<(), Error> {
    tracing::info!(handle = %config.iptable_instance, "configuring hooks for destroy");

    let runner = SystemCommandRunner;
    configure::destroy_host(&runner, config).with_context(|| "host-side teardown failed")?;

    Ok(())
}

fn read_hook_state() -> Result<HookState, Error> {
    let mut buf = String::new();
    std::io::stdin()
        .read_to_string(&mut buf)
        .with_context(|| "failed to read OCI hook state from stdin")?;

    serde_json::from_str(&buf).with_context(|| "failed to parse OCI hook state")
}

fn setup_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let path = std::env::var("GARDEN_LOG_FILE").ok()?;
    let path = Path::new(&path);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name()?;

    let file_appender = tracing_appender::rolling::never(dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    tracing_subscriber::fmt().with_writer(non_blocking).init();

    Some(guard)
}
