/// Errors specific to subnet/port allocation (spec §4.5, §4.6). Networker
/// converts these into `common::Error::Network` at its own boundary; kept
/// distinct here so subnet/port pool tests can match on the exact variant.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("subnet already taken: {0}")]
    SubnetTaken(String),

    #[error("ip already taken: {0}")]
    IpTaken(String),

    #[error("subnet pool exhausted")]
    OutOfPool,

    #[error("released a subnet that was never allocated")]
    ReleasedUnallocatedSubnet,

    #[error("port pool exhausted")]
    PortExhausted,

    #[error("ports cannot be specified for this protocol")]
    PortsNotAllowedForProtocol,

    #[error("command failed: {0}")]
    CommandFailed(String),
}
