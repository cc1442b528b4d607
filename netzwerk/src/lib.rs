pub mod configure;
mod error;
pub mod iptables;
mod lock;
pub mod networker;
pub mod port_pool;
pub mod range;
pub mod subnet_pool;

pub use configure::NetnsCommandRunner;
pub use error::NetworkError;
pub use iptables::{FirewallShim, IcmpControl, IpRange, NetOutRule, PortRange, Protocol};
pub use networker::{HookCommands, Networker};
pub use port_pool::PortPool;
pub use subnet_pool::{IpSelector, SubnetPool, SubnetSelector};
