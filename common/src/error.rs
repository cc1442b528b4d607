/// The error taxonomy surfaced to RPC callers.
///
/// Internal plumbing keeps using `anyhow::Error` the way the rest of this
/// workspace does; this enum exists at the Gardener/daemon boundary, where
/// an error needs a reporting category rather than just a message.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no such container: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("runtime error: {0}")]
    Runtime(#[source] anyhow::Error),

    #[error("network error: {0}")]
    Network(#[source] anyhow::Error),

    #[error("io error: {0}")]
    Io(#[source] anyhow::Error),

    #[error("transient error, retry later: {0}")]
    Transient(#[source] anyhow::Error),
}

impl Error {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}
