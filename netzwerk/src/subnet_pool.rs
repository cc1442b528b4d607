use std::{
    collections::{BTreeMap, BTreeSet},
    convert::TryFrom,
    net::Ipv4Addr,
    sync::Mutex,
};

use ipnetwork::Ipv4Network;

use crate::error::NetworkError;

/// What the caller asked for when requesting a subnet (spec §4.4 step 1:
/// empty spec → Dynamic, `<cidr>` → Static).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubnetSelector {
    Dynamic,
    Static(Ipv4Network),
}

/// What the caller asked for when requesting a container IP within a
/// subnet (`<ip>/<cidr>` → Static(ip)).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpSelector {
    Dynamic,
    Static(Ipv4Addr),
}

struct SubnetState {
    allocated: BTreeSet<Ipv4Addr>,
    dynamically_created: bool,
}

/// Subnet allocator: a configured root CIDR sliced into fixed-size subnets,
/// each tracking its own set of allocated container IPs. State lives only
/// for the daemon's process lifetime — persisting it across restarts is a
/// stated non-goal.
pub struct SubnetPool {
    pool: Ipv4Network,
    subnet_prefix: u8,
    state: Mutex<BTreeMap<Ipv4Network, SubnetState>>,
}

impl SubnetPool {
    pub fn new(pool: Ipv4Network, subnet_prefix: u8) -> Self {
        Self {
            pool,
            subnet_prefix,
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// Total number of `subnet_prefix`-sized subnets the configured pool
    /// can host.
    pub fn capacity(&self) -> u64 {
        let host_bits = self.subnet_prefix.saturating_sub(self.pool.prefix());

        1u64 << host_bits
    }

    pub fn acquire(
        &self,
        subnet_sel: SubnetSelector,
        ip_sel: IpSelector,
    ) -> Result<(Ipv4Network, Ipv4Addr), NetworkError> {
        let mut state = self.state.lock().expect("subnet pool lock poisoned");

        match subnet_sel {
            SubnetSelector::Static(subnet) => {
                self.require_within_pool(&subnet)?;

                let entry = state.entry(subnet).or_insert_with(|| SubnetState {
                    allocated: BTreeSet::new(),
                    dynamically_created: false,
                });

                let ip = Self::allocate_ip(subnet, &mut entry.allocated, ip_sel)?;
                Ok((subnet, ip))
            }
            SubnetSelector::Dynamic => {
                for subnet in self.candidate_subnets() {
                    let is_new = !state.contains_key(&subnet);

                    if is_new {
                        let mut entry = SubnetState {
                            allocated: BTreeSet::new(),
                            dynamically_created: true,
                        };
                        let ip = Self::allocate_ip(subnet, &mut entry.allocated, ip_sel)?;
                        state.insert(subnet, entry);
                        return Ok((subnet, ip));
                    }

                    let entry = state.get_mut(&subnet).expect("just checked presence");
                    if let Ok(ip) = Self::allocate_ip(subnet, &mut entry.allocated, ip_sel) {
                        return Ok((subnet, ip));
                    }
                }

                Err(NetworkError::OutOfPool)
            }
        }
    }

    pub fn release(&self, subnet: Ipv4Network, ip: Ipv4Addr) -> Result<(), NetworkError> {
        let mut state = self.state.lock().expect("subnet pool lock poisoned");

        let entry = state
            .get_mut(&subnet)
            .ok_or(NetworkError::ReleasedUnallocatedSubnet)?;

        if !entry.allocated.remove(&ip) {
            return Err(NetworkError::ReleasedUnallocatedSubnet);
        }

        if entry.allocated.is_empty() && entry.dynamically_created {
            state.remove(&subnet);
        }

        Ok(())
    }

    fn require_within_pool(&self, subnet: &Ipv4Network) -> Result<(), NetworkError> {
        let contained = self.pool.contains(subnet.network())
            && subnet.prefix() >= self.pool.prefix();

        if contained {
            Ok(())
        } else {
            Err(NetworkError::OutOfPool)
        }
    }

    fn candidate_subnets(&self) -> impl Iterator<Item = Ipv4Network> + '_ {
        let step = 1u32 << (32 - self.subnet_prefix);
        let base = u32::from_be_bytes(self.pool.network().octets());
        let count = self.capacity();

        (0..count).map(move |i| {
            let addr = Ipv4Addr::from((base + (i as u32) * step).to_be_bytes());
            Ipv4Network::new(addr, self.subnet_prefix).expect("prefix within range")
        })
    }

    fn allocate_ip(
        subnet: Ipv4Network,
        allocated: &mut BTreeSet<Ipv4Addr>,
        ip_sel: IpSelector,
    ) -> Result<Ipv4Addr, NetworkError> {
        match ip_sel {
            IpSelector::Static(ip) => {
                if !subnet.contains(ip) {
                    return Err(NetworkError::IpTaken(ip.to_string()));
                }
                if !allocated.insert(ip) {
                    return Err(NetworkError::IpTaken(ip.to_string()));
                }
                Ok(ip)
            }
            IpSelector::Dynamic => {
                let reserved = crate::range::first_host_addr(&subnet)
                    .expect("first host addr is always derivable");

                for candidate in &subnet {
                    if candidate == subnet.network()
                        || candidate == subnet.broadcast()
                        || candidate == reserved
                    {
                        continue;
                    }

                    if allocated.insert(candidate) {
                        return Ok(candidate);
                    }
                }

                Err(NetworkError::OutOfPool)
            }
        }
    }
}

impl TryFrom<&str> for SubnetSelector {
    type Error = anyhow::Error;

    fn try_from(spec: &str) -> Result<Self, Self::Error> {
        if spec.is_empty() {
            Ok(SubnetSelector::Dynamic)
        } else {
            Ok(SubnetSelector::Static(Ipv4Network::try_from(spec)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> SubnetPool {
        SubnetPool::new(Ipv4Network::try_from("10.254.0.0/24").unwrap(), 30)
    }

    #[test]
    fn dynamic_allocation_picks_lowest_free_subnet() {
        let pool = pool();

        let (subnet, ip) = pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();

        assert_eq!(subnet.to_string(), "10.254.0.0/30");
        assert_eq!(ip.to_string(), "10.254.0.2");
    }

    #[test]
    fn second_dynamic_allocation_picks_next_subnet() {
        let pool = pool();

        pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();
        let (subnet, _) = pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();

        assert_eq!(subnet.to_string(), "10.254.0.4/30");
    }

    #[test]
    fn static_subnet_outside_pool_is_rejected() {
        let pool = pool();
        let outside = Ipv4Network::try_from("192.168.0.0/30").unwrap();

        let err = pool.acquire(SubnetSelector::Static(outside), IpSelector::Dynamic).unwrap_err();

        assert_eq!(err, NetworkError::OutOfPool);
    }

    #[test]
    fn release_then_reacquire_frees_the_subnet() {
        let pool = pool();

        let (subnet, ip) = pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();
        pool.release(subnet, ip).unwrap();

        let (reacquired, _) = pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();
        assert_eq!(reacquired, subnet);
    }

    #[test]
    fn double_release_is_an_error() {
        let pool = pool();

        let (subnet, ip) = pool.acquire(SubnetSelector::Dynamic, IpSelector::Dynamic).unwrap();
        pool.release(subnet, ip).unwrap();

        assert_eq!(
            pool.release(subnet, ip).unwrap_err(),
            NetworkError::ReleasedUnallocatedSubnet
        );
    }

    #[test]
    fn capacity_reports_total_subnets() {
        assert_eq!(pool().capacity(), 64);
    }
}
