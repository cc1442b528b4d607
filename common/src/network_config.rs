use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};

/// The per-container network state Networker derives in `Hooks` and the
/// Property Store persists under the `kawasaki.*` / `garden.network.*`
/// keys. `NetworkConfig` crosses the Networker/storage boundary, so it
/// lives in `common` rather than in `netzwerk` itself — `storage` needs
/// the type to offer `save_network_config`/`load_network_config` without
/// depending back on `netzwerk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub host_intf: String,
    pub container_intf: String,
    pub bridge_name: String,
    pub bridge_ip: Ipv4Addr,
    pub container_ip: Ipv4Addr,
    pub subnet: Ipv4Network,
    pub mtu: u32,
    pub external_ip: Ipv4Addr,
    pub iptable_prefix: String,
    pub iptable_instance: String,
    pub dns_servers: Vec<Ipv4Addr>,
}
