use common::Error;

#[derive(thiserror::Error, Debug)]
pub enum ContainerizerError {
    #[error("bundle is missing required field: {0}")]
    IncompleteBundle(String),

    #[error("container '{0}' already exists")]
    AlreadyExists(String),

    #[error("container '{0}' does not exist")]
    NoSuchContainer(String),

    #[error("init process did not print the start token within {0:?}")]
    RuntimeStartTimeout(std::time::Duration),

    #[error("runtime binary failed: {0}")]
    RuntimeFailed(String),

    #[error("pidfile '{0}' was never populated")]
    PidfileTimeout(String),

    #[error("process '{0}' is not in the expected state for this operation")]
    InvalidProcessState(String),

    #[error("streaming shim failed: {0}")]
    StreamFailed(String),
}

/// `ContainerizerError` is the inner, crate-local taxonomy (named instead
/// of stringly-typed `anyhow::bail!` calls); this is where it crosses into
/// the reporting taxonomy consumed at the Gardener/daemon boundary.
pub fn to_common_error(err: ContainerizerError) -> Error {
    match err {
        ContainerizerError::NoSuchContainer(handle) => Error::NotFound(handle),
        ContainerizerError::AlreadyExists(handle) => {
            Error::Validation(format!("container '{}' already exists", handle))
        }
        ContainerizerError::IncompleteBundle(field) => Error::Validation(field),
        other @ ContainerizerError::RuntimeStartTimeout(_) => Error::Runtime(other.into()),
        other @ ContainerizerError::RuntimeFailed(_) => Error::Runtime(other.into()),
        other @ ContainerizerError::PidfileTimeout(_) => Error::Transient(other.into()),
        other @ ContainerizerError::InvalidProcessState(_) => Error::Runtime(other.into()),
        other @ ContainerizerError::StreamFailed(_) => Error::Io(other.into()),
    }
}
