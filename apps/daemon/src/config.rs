use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use ipnetwork::Ipv4Network;

/// Recognized daemon configuration, parsed via `clap`'s derive API (see
/// DESIGN.md's `apps/daemon` entry for the version rationale).
#[derive(Debug, Parser)]
#[command(name = "werft-daemon")]
pub struct Config {
    /// "unix" or "tcp"; only "unix" is implemented.
    #[arg(long, default_value = "unix")]
    pub listen_network: String,

    #[arg(long, default_value = "/run/werft.sock")]
    pub listen_addr: String,

    #[arg(long, default_value = "/var/lib/werft/depot")]
    pub depot: PathBuf,

    #[arg(long, default_value = "/var/lib/werft/graph")]
    pub graph: PathBuf,

    #[arg(long, default_value = "")]
    pub default_rootfs: String,

    #[arg(long, default_value = "10.254.0.0/22")]
    pub network_pool: Ipv4Network,

    #[arg(long, default_value_t = 60000)]
    pub port_pool_start: u16,

    #[arg(long, default_value_t = 5000)]
    pub port_pool_size: u16,

    #[arg(long)]
    pub allow_host_access: bool,

    #[arg(long = "deny-network")]
    pub deny_networks: Vec<Ipv4Network>,

    #[arg(long = "allow-network")]
    pub allow_networks: Vec<Ipv4Network>,

    /// Namespaces iptables chains and interface prefixes; kept short
    /// since it's embedded in interface names (spec §6).
    #[arg(long, default_value = "w")]
    pub tag: String,

    #[arg(long, default_value_t = 1500)]
    pub mtu: u32,

    #[arg(long, default_value = "10.0.0.1")]
    pub external_ip: Ipv4Addr,

    #[arg(long = "dns-server")]
    pub dns_server: Vec<Ipv4Addr>,

    #[arg(long, default_value_t = 0)]
    pub max_containers: u64,

    #[arg(long, default_value_t = 300)]
    pub default_grace_time: u64,

    #[arg(long, default_value = "/usr/bin/runc")]
    pub runtime_binary: String,

    #[arg(long, default_value = "/usr/bin/iodaemon")]
    pub supervisor_binary: String,

    #[arg(long = "hook-binary", default_value = "/usr/local/bin/werft-hook")]
    pub hook_binary: String,

    #[arg(long = "nstar-bin", default_value = "/usr/bin/nstar")]
    pub nstar_binary: String,

    #[arg(long, default_value_t = 30)]
    pub subnet_prefix: u8,

    #[arg(long, default_value_t = 60)]
    pub sweep_interval_secs: u64,
}
