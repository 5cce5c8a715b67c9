//! Local ports handed to consumer-side sessions.
//!
//! Ports in `min..=max` are reserved first-free. A [`PortGuard`] owns its
//! reservation and gives the port back when dropped, so a session task that
//! ends for any reason frees its port.

use relaytun_core::{GatewayError, GatewayResult};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, PoisonError};

pub struct PortPool {
    min: u16,
    max: u16,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortPool {
    pub fn new(min: u16, max: u16) -> GatewayResult<Self> {
        if min == 0 || min > max {
            return Err(GatewayError::invalid(
                "gateway.min_port",
                format!("port range {min}..={max} is empty or starts at 0"),
            ));
        }
        Ok(Self {
            min,
            max,
            in_use: Arc::new(Mutex::new(BTreeSet::new())),
        })
    }

    /// Reserve the lowest free port.
    pub fn reserve(&self) -> GatewayResult<PortGuard> {
        let mut in_use = self.in_use.lock().unwrap_or_else(PoisonError::into_inner);
        let port = (self.min..=self.max)
            .find(|p| !in_use.contains(p))
            .ok_or_else(|| {
                GatewayError::Operational(format!(
                    "no free consumer port in {}..={}",
                    self.min, self.max
                ))
            })?;
        in_use.insert(port);
        Ok(PortGuard {
            port,
            in_use: self.in_use.clone(),
        })
    }

    pub fn in_use(&self) -> usize {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn capacity(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }
}

/// A reserved port; released on drop. `Send`, so it can ride along into
/// the session task.
#[derive(Debug)]
pub struct PortGuard {
    port: u16,
    in_use: Arc<Mutex<BTreeSet<u16>>>,
}

impl PortGuard {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortGuard {
    fn drop(&mut self) {
        self.in_use
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserves_lowest_free_port() {
        let pool = PortPool::new(8000, 8002).unwrap();
        let a = pool.reserve().unwrap();
        let b = pool.reserve().unwrap();
        assert_eq!((a.port(), b.port()), (8000, 8001));
        drop(a);
        assert_eq!(pool.reserve().unwrap().port(), 8000);
    }

    #[test]
    fn exhausted_pool_is_operational_error() {
        let pool = PortPool::new(9000, 9001).unwrap();
        let _a = pool.reserve().unwrap();
        let _b = pool.reserve().unwrap();
        assert!(matches!(pool.reserve(), Err(GatewayError::Operational(_))));
        assert_eq!(pool.in_use(), 2);
        assert_eq!(pool.capacity(), 2);
    }

    #[test]
    fn guard_releases_on_drop() {
        let pool = PortPool::new(7000, 7000).unwrap();
        {
            let _guard = pool.reserve().unwrap();
            assert_eq!(pool.in_use(), 1);
        }
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn rejects_empty_range() {
        assert!(PortPool::new(10, 9).is_err());
        assert!(PortPool::new(0, 9).is_err());
    }
}
