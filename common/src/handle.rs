use std::convert::AsRef;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Error;

/// Interface names are built as `w-<pfx>-<trunc(handle)>-0/1`; BSD/Linux
/// both cap interface names well under `handle.len()` for any handle a
/// caller would reasonably choose, so the usable prefix is fixed at 8.
const NIC_HANDLE_LEN: usize = 8;

/// An opaque, caller-visible container identifier.
///
/// A `Handle` is never empty. Long handles are stored in full (`as_str`
/// returns the whole thing) but truncated to their first 8 characters
/// whenever they're embedded in something length-constrained, such as a
/// network interface name (see `nic_prefix`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Handle(String);

impl Handle {
    pub fn new(raw: impl Into<String>) -> Result<Self, Error> {
        let raw = raw.into();

        if raw.is_empty() {
            return Err(Error::Validation("handle must not be empty".into()));
        }

        Ok(Self(raw))
    }

    /// Generates a fresh handle, used when `Create` is called without one.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The prefix used to derive NIC names deterministically. Truncation
    /// never panics on multi-byte handles: it walks char boundaries rather
    /// than slicing raw bytes.
    pub fn nic_prefix(&self) -> &str {
        match self.0.char_indices().nth(NIC_HANDLE_LEN) {
            Some((boundary, _)) => &self.0[..boundary],
            None => &self.0,
        }
    }
}

impl AsRef<str> for Handle {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Handle> for String {
    fn from(handle: Handle) -> String {
        handle.0
    }
}
