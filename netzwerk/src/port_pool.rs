use std::{collections::VecDeque, sync::Mutex};

use crate::error::NetworkError;

/// Fixed-range `[start, start+size)` ephemeral port allocator (spec §4.6).
/// Released ports go to the back of the free queue rather than the front,
/// so a port is reused only after every other free port has been tried —
/// minimizing collisions with sockets still lingering in TIME_WAIT.
pub struct PortPool {
    state: Mutex<PortPoolState>,
}

struct PortPoolState {
    free: VecDeque<u16>,
}

impl PortPool {
    pub fn new(start: u16, size: u16) -> Self {
        let free = (start..start.saturating_add(size)).collect();

        Self {
            state: Mutex::new(PortPoolState { free }),
        }
    }

    pub fn acquire(&self) -> Result<u16, NetworkError> {
        let mut state = self.state.lock().expect("port pool lock poisoned");

        state.free.pop_front().ok_or(NetworkError::PortExhausted)
    }

    pub fn release(&self, port: u16) {
        let mut state = self.state.lock().expect("port pool lock poisoned");

        state.free.push_back(port);
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().expect("port pool lock poisoned").free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquires_in_order() {
        let pool = PortPool::new(60000, 3);

        assert_eq!(pool.acquire().unwrap(), 60000);
        assert_eq!(pool.acquire().unwrap(), 60001);
    }

    #[test]
    fn exhausted_pool_errors() {
        let pool = PortPool::new(60000, 1);

        pool.acquire().unwrap();
        assert_eq!(pool.acquire().unwrap_err(), NetworkError::PortExhausted);
    }

    #[test]
    fn released_ports_go_to_the_back_of_the_queue() {
        let pool = PortPool::new(60000, 2);

        let first = pool.acquire().unwrap();
        pool.release(first);

        assert_eq!(pool.acquire().unwrap(), 60001);
        assert_eq!(pool.acquire().unwrap(), first);
    }
}
