use std::sync::{Mutex, MutexGuard};

/// Process-wide iptables serialization (spec §5: "iptables commands are
/// serialized globally ... to avoid concurrent kernel table corruption").
/// `iptables -w` already takes a kernel-level lock against other
/// processes; this complements it by preventing two threads in this
/// daemon from racing to mutate the same instance chain.
pub struct IptablesLock(Mutex<()>);

impl IptablesLock {
    pub fn new() -> Self {
        Self(Mutex::new(()))
    }

    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.0.lock().expect("iptables lock poisoned")
    }
}

impl Default for IptablesLock {
    fn default() -> Self {
        Self::new()
    }
}
