use std::net::Ipv4Addr;

use common::{CommandRunner, Invocation};
use ipnetwork::Ipv4Network;

use crate::{error::NetworkError, lock::IptablesLock};

const IPTABLES_BIN: &str = "/sbin/iptables";

/// Protocol filter for a `NetOutRule`; `All` is the `iptables --protocol
/// all` shorthand, not "no protocol filter".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    fn as_iptables_arg(self) -> &'static str {
        match self {
            Protocol::All => "all",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IpRange {
    pub start: Option<Ipv4Addr>,
    pub end: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    fn as_iptables_arg(self) -> String {
        if self.start == self.end {
            self.start.to_string()
        } else {
            format!("{}:{}", self.start, self.end)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpControl {
    pub icmp_type: u8,
    pub code: Option<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetOutRule {
    pub protocol: Protocol,
    pub networks: Vec<IpRange>,
    pub ports: Vec<PortRange>,
    pub icmp: Option<IcmpControl>,
    pub log: bool,
}

impl Default for Protocol {
    fn default() -> Self {
        Protocol::All
    }
}

/// Per-container iptables chains: a nat-table instance chain off
/// PREROUTING and a filter-table instance chain off FORWARD, plus the
/// shared logging sub-chain each filter chain's LOG rules goto.
pub struct FirewallShim<R: CommandRunner> {
    runner: R,
    iptables_prefix: String,
    lock: IptablesLock,
}

impl<R: CommandRunner> FirewallShim<R> {
    pub fn new(runner: R, iptables_prefix: impl Into<String>) -> Self {
        Self {
            runner,
            iptables_prefix: iptables_prefix.into(),
            lock: IptablesLock::new(),
        }
    }

    fn nat_chain(&self, instance: &str) -> String {
        format!("{}-instance-{}", self.iptables_prefix, instance)
    }

    fn filter_chain(&self, instance: &str) -> String {
        format!("{}-instance-{}-filter", self.iptables_prefix, instance)
    }

    fn log_chain(&self, instance: &str) -> String {
        format!("{}-log", self.filter_chain(instance))
    }

    fn default_chain(&self) -> String {
        format!("{}-default", self.iptables_prefix)
    }

    fn run(&self, args: Vec<String>) -> Result<(), NetworkError> {
        let _guard = self.lock.acquire();

        let mut full_args = vec!["-w".to_string()];
        full_args.extend(args);

        self.runner
            .run(&Invocation::new(IPTABLES_BIN, full_args))
            .map_err(|e| NetworkError::CommandFailed(e.to_string()))?;

        Ok(())
    }

    /// `Configurer.Apply`'s `InstanceChainCreator.Create` step (spec §4.4
    /// host configuration, third bullet).
    pub fn create_instance_chains(
        &self,
        instance: &str,
        bridge_name: &str,
        container_ip: Ipv4Addr,
        subnet: &Ipv4Network,
    ) -> Result<(), NetworkError> {
        let nat = self.nat_chain(instance);
        let filter = self.filter_chain(instance);

        self.run(vec!["-t".into(), "nat".into(), "-N".into(), nat.clone()])?;
        self.run(vec![
            "-t".into(), "nat".into(), "-A".into(), "PREROUTING".into(),
            "--jump".into(), nat.clone(),
        ])?;
        self.run(vec![
            "-t".into(), "nat".into(), "-A".into(), "POSTROUTING".into(),
            "--source".into(), subnet.to_string(),
            "!".into(), "--destination".into(), subnet.to_string(),
            "--jump".into(), "MASQUERADE".into(),
        ])?;

        self.run(vec!["-N".into(), filter.clone()])?;
        self.run(vec![
            "-A".into(), "FORWARD".into(), "--in-interface".into(), bridge_name.into(),
            "--goto".into(), filter.clone(),
        ])?;
        self.run(vec![
            "-A".into(), filter.clone(),
            "--source".into(), subnet.to_string(),
            "--destination".into(), subnet.to_string(),
            "--jump".into(), "ACCEPT".into(),
        ])?;
        self.run(vec![
            "-A".into(), filter.clone(),
            "--jump".into(), self.default_chain(),
        ])?;

        let _ = container_ip;
        Ok(())
    }

    pub fn destroy_instance_chains(&self, instance: &str) -> Result<(), NetworkError> {
        let nat = self.nat_chain(instance);
        let filter = self.filter_chain(instance);

        // Flush-then-delete with `|| true` tolerance: a chain that's
        // already gone (e.g. Destroy retried after a partial failure)
        // must not turn this into an error.
        let _ = self.run(vec!["-t".into(), "nat".into(), "-D".into(), "PREROUTING".into(), "--jump".into(), nat.clone()]);
        let _ = self.run(vec!["-t".into(), "nat".into(), "-F".into(), nat.clone()]);
        let _ = self.run(vec!["-t".into(), "nat".into(), "-X".into(), nat]);

        let _ = self.run(vec!["-D".into(), "FORWARD".into(), "--goto".into(), filter.clone()]);
        let _ = self.run(vec!["-F".into(), filter.clone()]);
        let _ = self.run(vec!["-X".into(), filter]);

        Ok(())
    }

    /// `NetIn` DNAT rule (spec §4.4): `-d <external_ip> -p tcp --dport
    /// <host> → DNAT <container_ip>:<container>`.
    pub fn add_dnat(
        &self,
        instance: &str,
        external_ip: Ipv4Addr,
        host_port: u16,
        container_ip: Ipv4Addr,
        container_port: u16,
    ) -> Result<(), NetworkError> {
        self.run(vec![
            "-t".into(), "nat".into(), "-A".into(), self.nat_chain(instance),
            "--destination".into(), external_ip.to_string(),
            "--protocol".into(), "tcp".into(),
            "--destination-port".into(), host_port.to_string(),
            "--jump".into(), "DNAT".into(),
            "--to-destination".into(), format!("{}:{}", container_ip, container_port),
        ])
    }

    /// `NetOut` (spec §4.4): prepend an ACCEPT rule at position 1 of the
    /// instance filter chain, expanding the networks×ports permutation.
    /// Mirrors the commented `iptables_test.go` fixture in
    /// `original_source/kawasaki/iptables`: ALL/ICMP reject explicit
    /// ports, `Log` redirects via `--goto` to the logging sub-chain
    /// instead of `--jump RETURN`.
    pub fn net_out(&self, instance: &str, rule: &NetOutRule) -> Result<(), NetworkError> {
        if !rule.ports.is_empty() && matches!(rule.protocol, Protocol::All | Protocol::Icmp) {
            return Err(NetworkError::PortsNotAllowedForProtocol);
        }

        let chain = self.filter_chain(instance);
        let networks = if rule.networks.is_empty() {
            vec![IpRange::default()]
        } else {
            rule.networks.clone()
        };
        let ports = if rule.ports.is_empty() {
            vec![None]
        } else {
            rule.ports.iter().copied().map(Some).collect()
        };

        for network in &networks {
            for port in &ports {
                let mut args = vec!["-I".into(), chain.clone(), "1".into()];
                args.push("--protocol".into());
                args.push(rule.protocol.as_iptables_arg().into());

                Self::push_network_args(&mut args, network);

                if let Some(icmp) = &rule.icmp {
                    args.push("--icmp-type".into());
                    args.push(match icmp.code {
                        Some(code) => format!("{}/{}", icmp.icmp_type, code),
                        None => icmp.icmp_type.to_string(),
                    });
                }

                if let Some(port) = port {
                    args.push("--destination-port".into());
                    args.push(port.as_iptables_arg());
                }

                if rule.log {
                    args.push("--goto".into());
                    args.push(self.log_chain(instance));
                } else {
                    args.push("--jump".into());
                    args.push("RETURN".into());
                }

                self.run(args)?;
            }
        }

        Ok(())
    }

    fn push_network_args(args: &mut Vec<String>, network: &IpRange) {
        match (network.start, network.end) {
            (None, None) => {}
            (Some(ip), None) | (None, Some(ip)) => {
                args.push("--destination".into());
                args.push(ip.to_string());
            }
            (Some(start), Some(end)) if start == end => {
                args.push("--destination".into());
                args.push(start.to_string());
            }
            (Some(start), Some(end)) => {
                args.push("-m".into());
                args.push("iprange".into());
                args.push("--dst-range".into());
                args.push(format!("{}-{}", start, end));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_helpers::FakeCommandRunner;

    fn shim() -> (FakeCommandRunner, FirewallShim<FakeCommandRunner>) {
        let runner = FakeCommandRunner::new();
        let shim = FirewallShim::new(runner.clone(), "w-bar");
        (runner, shim)
    }

    #[test]
    fn net_out_defaults_to_accept_all() {
        let (runner, shim) = shim();

        shim.net_out("baz", &NetOutRule::default()).unwrap();

        let invocations = runner.invocations();
        assert_eq!(invocations.len(), 1);
        assert!(invocations[0].args.contains(&"RETURN".to_string()));
        assert!(invocations[0].args.contains(&"all".to_string()));
    }

    #[test]
    fn net_out_expands_networks_times_ports() {
        let (runner, shim) = shim();

        let rule = NetOutRule {
            protocol: Protocol::Tcp,
            networks: vec![
                IpRange { start: Some("1.2.3.4".parse().unwrap()), end: None },
                IpRange {
                    start: Some("2.2.3.4".parse().unwrap()),
                    end: Some("2.2.3.9".parse().unwrap()),
                },
            ],
            ports: vec![PortRange { start: 12, end: 24 }, PortRange { start: 64, end: 942 }],
            icmp: None,
            log: false,
        };

        shim.net_out("baz", &rule).unwrap();

        assert_eq!(runner.invocations().len(), 4);
    }

    #[test]
    fn net_out_rejects_ports_with_all_protocol() {
        let (_runner, shim) = shim();

        let rule = NetOutRule {
            protocol: Protocol::All,
            ports: vec![PortRange::single(22)],
            ..Default::default()
        };

        assert!(shim.net_out("baz", &rule).is_err());
    }

    #[test]
    fn net_out_log_goes_via_the_log_chain() {
        let (runner, shim) = shim();

        shim.net_out("baz", &NetOutRule { log: true, ..Default::default() }).unwrap();

        let invocations = runner.invocations();
        assert!(invocations[0].args.contains(&"--goto".to_string()));
        assert!(invocations[0].args.contains(&"w-bar-instance-baz-filter-log".to_string()));
    }
}
