mod command;
mod error;
mod handle;
mod network_config;

pub use command::{CommandRunner, Invocation, SystemCommandRunner};
pub use error::Error;
pub use handle::Handle;
pub use network_config::NetworkConfig;

use std::collections::BTreeMap;

/// An AND of property key/value requirements, as accepted by
/// `Gardener::Containers`.
pub type PropertyFilter = BTreeMap<String, String>;

/// An ordered K=V environment list, as carried on
/// `DesiredContainerSpec` and `ProcessSpec`.
pub type EnvList = Vec<String>;
