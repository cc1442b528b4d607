use common::{CommandRunner, Error, Invocation, NetworkConfig};

use crate::error::NetworkError;

const IP_BIN: &str = "/sbin/ip";
const NSENTER_BIN: &str = "/usr/bin/nsenter";

/// Wraps another `CommandRunner` so every invocation runs inside a target
/// network namespace via `nsenter --net=<path> -- <program> <args...>`
/// (spec §4.4's container-side configuration steps run "inside the
/// container's network namespace"; `configure_container` itself issues
/// plain `ip` invocations, oblivious to which namespace they land in, so
/// the namespace targeting happens at this layer instead).
pub struct NetnsCommandRunner<R: CommandRunner> {
    inner: R,
    netns_path: String,
}

impl<R: CommandRunner> NetnsCommandRunner<R> {
    pub fn new(inner: R, netns_path: impl Into<String>) -> Self {
        Self { inner, netns_path: netns_path.into() }
    }
}

impl<R: CommandRunner> CommandRunner for NetnsCommandRunner<R> {
    fn run(&self, invocation: &Invocation) -> Result<std::process::Output, Error> {
        let mut args = vec![format!("--net={}", self.netns_path), "--".to_string(), invocation.program.clone()];
        args.extend(invocation.args.iter().cloned());

        self.inner.run(&Invocation::new(NSENTER_BIN, args))
    }
}

fn ip(runner: &impl CommandRunner, args: Vec<String>) -> Result<(), NetworkError> {
    runner
        .run(&Invocation::new(IP_BIN, args))
        .map(|_| ())
        .map_err(|e| NetworkError::CommandFailed(e.to_string()))
}

/// Host-side configuration (spec §4.4, "Host configuration" bullet list):
/// veth pair, bridge, and moving the container end into the target netns.
/// Runs outside the container's network namespace, before the container's
/// own init process starts.
pub fn configure_host(
    runner: &impl CommandRunner,
    config: &NetworkConfig,
    container_netns_path: &str,
) -> Result<(), NetworkError> {
    if !interface_exists(runner, &config.host_intf)? {
        ip(runner, vec![
            "link".into(), "add".into(), config.host_intf.clone(),
            "type".into(), "veth".into(),
            "peer".into(), "name".into(), config.container_intf.clone(),
        ])?;
    }

    if !interface_exists(runner, &config.bridge_name)? {
        ip(runner, vec!["link".into(), "add".into(), config.bridge_name.clone(), "type".into(), "bridge".into()])?;
        ip(runner, vec![
            "addr".into(), "add".into(),
            format!("{}/{}", config.bridge_ip, config.subnet.prefix()),
            "dev".into(), config.bridge_name.clone(),
        ])?;
        ip(runner, vec!["link".into(), "set".into(), config.bridge_name.clone(), "up".into()])?;
    }

    ip(runner, vec!["link".into(), "set".into(), config.host_intf.clone(), "master".into(), config.bridge_name.clone()])?;
    ip(runner, vec!["link".into(), "set".into(), config.host_intf.clone(), "up".into()])?;

    ip(runner, vec![
        "link".into(), "set".into(), config.container_intf.clone(),
        "netns".into(), container_netns_path.into(),
    ])
    .map_err(|_| NetworkError::CommandFailed(format!(
        "failed to move {} into netns {}", config.container_intf, container_netns_path
    )))
}

/// Container-side configuration (spec §4.4, "Container configuration"
/// bullet list). Each step is its own `ip` invocation so a failure names
/// exactly which device/operation broke.
pub fn configure_container(
    runner: &impl CommandRunner,
    config: &NetworkConfig,
) -> Result<(), NetworkError> {
    ip(runner, vec!["link".into(), "set".into(), "lo".into(), "up".into()])
        .map_err(|_| NetworkError::CommandFailed("failed to bring up lo".into()))?;
    ip(runner, vec!["addr".into(), "add".into(), "127.0.0.1/8".into(), "dev".into(), "lo".into()])
        .map_err(|_| NetworkError::CommandFailed("failed to address lo".into()))?;

    ip(runner, vec![
        "addr".into(), "add".into(),
        format!("{}/{}", config.container_ip, config.subnet.prefix()),
        "dev".into(), config.container_intf.clone(),
    ])
    .map_err(|_| NetworkError::CommandFailed(format!("failed to address {}", config.container_intf)))?;

    ip(runner, vec!["link".into(), "set".into(), config.container_intf.clone(), "mtu".into(), config.mtu.to_string()])
        .map_err(|_| NetworkError::CommandFailed(format!("failed to set mtu on {}", config.container_intf)))?;
    ip(runner, vec!["link".into(), "set".into(), config.container_intf.clone(), "up".into()])
        .map_err(|_| NetworkError::CommandFailed(format!("failed to bring up {}", config.container_intf)))?;

    ip(runner, vec!["route".into(), "add".into(), "default".into(), "via".into(), config.bridge_ip.to_string()])
        .map_err(|_| NetworkError::CommandFailed("failed to add default route".into()))
}

pub fn destroy_host(runner: &impl CommandRunner, config: &NetworkConfig) -> Result<(), NetworkError> {
    let _ = ip(runner, vec!["link".into(), "delete".into(), config.host_intf.clone()]);
    Ok(())
}

fn interface_exists(runner: &impl CommandRunner, name: &str) -> Result<bool, NetworkError> {
    let args: Vec<String> = vec!["link".into(), "show".into(), name.into()];
    Ok(runner
        .run(&Invocation::new(IP_BIN, args))
        .is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ipnetwork::Ipv4Network;
    use std::convert::TryFrom;
    use test_helpers::FakeCommandRunner;

    fn config() -> NetworkConfig {
        NetworkConfig {
            host_intf: "w-abcdefgh-0".into(),
            container_intf: "w-abcdefgh-1".into(),
            bridge_name: "w-bridge".into(),
            bridge_ip: "10.254.0.1".parse().unwrap(),
            container_ip: "10.254.0.2".parse().unwrap(),
            subnet: Ipv4Network::try_from("10.254.0.0/30").unwrap(),
            mtu: 1500,
            external_ip: "10.0.0.1".parse().unwrap(),
            iptable_prefix: "w".into(),
            iptable_instance: "1".into(),
            dns_servers: vec![],
        }
    }

    #[test]
    fn configure_host_creates_veth_and_bridge() {
        let runner = FakeCommandRunner::new();

        configure_host(&runner, &config(), "/proc/1234/ns/net").unwrap();

        let invocations = runner.invocations();
        assert!(invocations.iter().any(|i| i.args.contains(&"veth".to_string())));
        assert!(invocations.iter().any(|i| i.args.contains(&"bridge".to_string())));
        assert!(invocations.iter().any(|i| i.args.contains(&"/proc/1234/ns/net".to_string())));
    }

    #[test]
    fn netns_runner_prefixes_invocations_with_nsenter() {
        let runner = FakeCommandRunner::new();
        let netns_runner = NetnsCommandRunner::new(runner.clone(), "/proc/1234/ns/net");

        configure_container(&netns_runner, &config()).unwrap();

        let invocations = runner.invocations();
        assert!(invocations.iter().all(|i| i.program == NSENTER_BIN));
        assert!(invocations.iter().all(|i| i.args.contains(&"--net=/proc/1234/ns/net".to_string())));
        assert!(invocations.iter().any(|i| i.args.contains(&IP_BIN.to_string())));
    }

    #[test]
    fn configure_container_adds_loopback_and_default_route() {
        let runner = FakeCommandRunner::new();

        configure_container(&runner, &config()).unwrap();

        let invocations = runner.invocations();
        assert!(invocations.iter().any(|i| i.args.contains(&"127.0.0.1/8".to_string())));
        assert!(invocations.iter().any(|i| i.args.contains(&"default".to_string())));
    }
}
