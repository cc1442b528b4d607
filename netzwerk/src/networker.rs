use std::sync::atomic::{AtomicU64, Ordering};

use common::{CommandRunner, Error, Handle, Invocation, NetworkConfig};
use storage::{PropertyStore, StorageEngine};

use crate::{
    error::NetworkError,
    iptables::{FirewallShim, NetOutRule},
    subnet_pool::{IpSelector, SubnetPool, SubnetSelector},
    port_pool::PortPool,
};

/// Reserved property key NetIn's port mappings accumulate under (spec §6).
const MAPPED_PORTS_KEY: &str = "garden.mapped-ports";

/// Where the container's network namespace path and bundle-relative hook
/// binary live — constant shape of the two hook commands (spec §4.4 step
/// 5: "same binary path, different `--action` flag").
pub struct HookCommands {
    pub prestart: Invocation,
    pub poststop: Invocation,
}

/// The Networker ("kawasaki"): subnet allocation, prestart/poststop hook
/// emission, and the runtime-surface NetIn/NetOut/Destroy operations.
/// Holds the subsystem's only process-wide mutable state (subnet pool,
/// port pool) plus a reference to the shared Property Store.
pub struct Networker<R: CommandRunner> {
    hook_binary_path: String,
    subnet_pool: SubnetPool,
    port_pool: PortPool,
    firewall: FirewallShim<R>,
    external_ip: std::net::Ipv4Addr,
    dns_servers: Vec<std::net::Ipv4Addr>,
    next_instance_id: AtomicU64,
    iptable_prefix: String,
    mtu: u32,
}

impl<R: CommandRunner> Networker<R> {
    pub fn new(
        hook_binary_path: impl Into<String>,
        pool: ipnetwork::Ipv4Network,
        subnet_prefix: u8,
        port_pool_start: u16,
        port_pool_size: u16,
        runner: R,
        iptable_prefix: impl Into<String>,
        external_ip: std::net::Ipv4Addr,
        dns_servers: Vec<std::net::Ipv4Addr>,
        mtu: u32,
    ) -> Self {
        let iptable_prefix = iptable_prefix.into();

        Self {
            hook_binary_path: hook_binary_path.into(),
            subnet_pool: SubnetPool::new(pool, subnet_prefix),
            port_pool: PortPool::new(port_pool_start, port_pool_size),
            firewall: FirewallShim::new(runner, iptable_prefix.clone()),
            external_ip,
            dns_servers,
            next_instance_id: AtomicU64::new(1),
            iptable_prefix,
            mtu,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.subnet_pool.capacity()
    }

    /// `Hooks(handle, spec, external_network_spec)` (spec §4.4 steps 1-5).
    #[fehler::throws(Error)]
    pub fn hooks(
        &self,
        handle: &Handle,
        spec: &str,
        properties: &PropertyStore<'_, impl StorageEngine>,
    ) -> HookCommands {
        let (subnet_sel, ip_sel) = parse_selectors(spec)?;

        let (subnet, ip) = self
            .subnet_pool
            .acquire(subnet_sel, ip_sel)
            .map_err(to_network_error)?;

        let bridge_ip =
            crate::range::first_host_addr(&subnet).map_err(Error::Network)?;
        let instance = self.next_instance_id.fetch_add(1, Ordering::SeqCst);

        let config = NetworkConfig {
            host_intf: format!("w-{}-0", handle.nic_prefix()),
            container_intf: format!("w-{}-1", handle.nic_prefix()),
            bridge_name: format!("w-br-{}", subnet_discriminator(&subnet)),
            bridge_ip,
            container_ip: ip,
            subnet,
            mtu: self.mtu,
            external_ip: self.external_ip,
            iptable_prefix: self.iptable_prefix.clone(),
            iptable_instance: instance.to_string(),
            dns_servers: self.dns_servers.clone(),
        };

        properties.save_network_config(handle, &config)?;

        HookCommands {
            prestart: self.hook_invocation("create", &config),
            poststop: self.hook_invocation("destroy", &config),
        }
    }

    /// `NetIn(handle, host_port, container_port)` (spec §4.4).
    #[fehler::throws(Error)]
    pub fn net_in(
        &self,
        handle: &Handle,
        host_port: u16,
        container_port: u16,
        properties: &PropertyStore<'_, impl StorageEngine>,
    ) -> (u16, u16) {
        let config = properties.load_network_config(handle)?;

        let host_port = if host_port == 0 {
            self.port_pool.acquire().map_err(to_network_error)?
        } else {
            host_port
        };
        let container_port = if container_port == 0 { host_port } else { container_port };

        self.firewall
            .add_dnat(&config.iptable_instance, config.external_ip, host_port, config.container_ip, container_port)
            .map_err(to_network_error)?;

        let mapped: String = properties.get(handle, MAPPED_PORTS_KEY).unwrap_or_else(|_| "[]".into());
        let mut mappings: Vec<(u16, u16)> = serde_json::from_str(&mapped).unwrap_or_default();
        mappings.push((host_port, container_port));
        properties
            .set(handle, MAPPED_PORTS_KEY, serde_json::to_string(&mappings).expect("serializable"))?;

        (host_port, container_port)
    }

    /// `NetOut(handle, rule)` (spec §4.4).
    #[fehler::throws(Error)]
    pub fn net_out(
        &self,
        handle: &Handle,
        rule: &NetOutRule,
        properties: &PropertyStore<'_, impl StorageEngine>,
    ) {
        let config = properties.load_network_config(handle)?;

        self.firewall
            .net_out(&config.iptable_instance, rule)
            .map_err(to_network_error)?;
    }

    /// `Destroy(handle)` (spec §4.4): missing state is tolerated, not
    /// fatal, since Destroy must never orphan resources in one subsystem
    /// because another subsystem has no record of the handle.
    #[fehler::throws(Error)]
    pub fn destroy(&self, handle: &Handle, properties: &PropertyStore<'_, impl StorageEngine>) {
        let config = match properties.load_network_config(handle) {
            Ok(config) => config,
            Err(_) => {
                tracing::debug!(%handle, "no network config, skipping network destroy");
                return;
            }
        };

        if let Err(e) = self.firewall.destroy_instance_chains(&config.iptable_instance) {
            tracing::error!(%handle, error = %e, "failed to destroy instance chains");
        }

        match self.subnet_pool.release(config.subnet, config.container_ip) {
            Ok(()) | Err(NetworkError::ReleasedUnallocatedSubnet) => {}
            Err(e) => tracing::error!(%handle, error = %e, "failed to release subnet"),
        }

        if let Ok(mapped) = properties.get(handle, MAPPED_PORTS_KEY) {
            if let Ok(mappings) = serde_json::from_str::<Vec<(u16, u16)>>(&mapped) {
                for (host_port, _) in mappings {
                    self.port_pool.release(host_port);
                }
            }
        }
    }

    fn hook_invocation(&self, action: &str, config: &NetworkConfig) -> Invocation {
        let mut args = vec![format!("--action={}", action)];
        args.push(format!("--host-interface={}", config.host_intf));
        args.push(format!("--container-interface={}", config.container_intf));
        args.push(format!("--bridge-interface={}", config.bridge_name));
        args.push(format!("--bridge-ip={}", config.bridge_ip));
        args.push(format!("--container-ip={}", config.container_ip));
        args.push(format!("--external-ip={}", config.external_ip));
        args.push(format!("--subnet={}", config.subnet));
        args.push(format!("--mtu={}", config.mtu));
        args.push(format!("--iptable-prefix={}", config.iptable_prefix));
        args.push(format!("--iptable-instance={}", config.iptable_instance));
        for dns in &config.dns_servers {
            args.push(format!("--dns-server={}", dns));
        }

        Invocation::new(self.hook_binary_path.clone(), args)
    }
}

fn subnet_discriminator(subnet: &ipnetwork::Ipv4Network) -> String {
    subnet
        .network()
        .to_string()
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect()
}

fn to_network_error(err: NetworkError) -> Error {
    match err {
        NetworkError::PortExhausted => Error::CapacityExhausted(err.to_string()),
        NetworkError::OutOfPool => Error::CapacityExhausted(err.to_string()),
        other => Error::Network(other.into()),
    }
}

/// Parses a network spec string the way `net.ParseCIDR` does (spec §4.4
/// step 1): empty spec is fully dynamic; `<cidr>` names a subnet but
/// leaves the address within it to allocation; `<ip>/<cidr>` pins both,
/// distinguished by whether the address component is the subnet's own
/// network address.
#[fehler::throws(Error)]
fn parse_selectors(spec: &str) -> (SubnetSelector, IpSelector) {
    use std::convert::TryFrom;

    if spec.is_empty() {
        return (SubnetSelector::Dynamic, IpSelector::Dynamic);
    }

    let parsed = ipnetwork::Ipv4Network::try_from(spec)
        .map_err(|e| Error::Validation(e.to_string()))?;
    let subnet = ipnetwork::Ipv4Network::new(parsed.network(), parsed.prefix())
        .map_err(|e| Error::Validation(e.to_string()))?;

    let ip_sel = if parsed.ip() == parsed.network() {
        IpSelector::Dynamic
    } else {
        IpSelector::Static(parsed.ip())
    };

    (SubnetSelector::Static(subnet), ip_sel)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::TryFrom;
    use storage::TestStorage;
    use test_helpers::FakeCommandRunner;

    fn networker() -> Networker<FakeCommandRunner> {
        Networker::new(
            "/usr/local/bin/hook",
            ipnetwork::Ipv4Network::try_from("10.254.0.0/24").unwrap(),
            30,
            60000,
            100,
            FakeCommandRunner::new(),
            "w",
            "10.0.0.1".parse().unwrap(),
            vec![],
            1500,
        )
    }

    #[test]
    fn hooks_allocates_a_subnet_and_persists_config() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TestStorage::new(dir.path()).unwrap();
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("a-handle").unwrap();
        properties.register(&handle, Default::default()).unwrap();

        let net = networker();
        let hooks = net.hooks(&handle, "", &properties).unwrap();

        assert!(hooks.prestart.args.contains(&"--action=create".to_string()));
        assert!(hooks.poststop.args.contains(&"--action=destroy".to_string()));

        let config = properties.load_network_config(&handle).unwrap();
        assert_eq!(config.container_ip.to_string(), "10.254.0.2");
    }

    #[test]
    fn destroy_is_tolerant_of_missing_network_config() {
        let dir = tempfile::tempdir().unwrap();
        let storage = TestStorage::new(dir.path()).unwrap();
        let properties = PropertyStore::new(&storage);
        let handle = Handle::new("unknown").unwrap();

        let net = networker();
        net.destroy(&handle, &properties).unwrap();
    }
}
