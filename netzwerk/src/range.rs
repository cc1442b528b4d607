use std::net::Ipv4Addr;

use ipnetwork::Ipv4Network;

/// The first host address of a subnet (network address + 1), used as the
/// bridge's own address within a subnet.
#[fehler::throws(anyhow::Error)]
pub fn first_host_addr(subnet: &Ipv4Network) -> Ipv4Addr {
    let octets = subnet.network().octets();
    let as_u32 = u32::from_be_bytes(octets) + 1;

    Ipv4Addr::from(as_u32.to_be_bytes())
}

#[cfg(test)]
mod tests {
    use std::convert::TryFrom;

    use super::*;

    #[test]
    fn test_first_host_addr() {
        let subnet = Ipv4Network::try_from("10.254.0.0/30").unwrap();

        assert_eq!(first_host_addr(&subnet).unwrap().to_string(), "10.254.0.1");
    }
}
