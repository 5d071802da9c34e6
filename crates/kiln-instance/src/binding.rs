//! The inventory of network endpoints leased to instances.

use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::LazyLock;

use parking_lot::Mutex;
use regex::Regex;

use crate::InstanceError;

static ENTRY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d+\.\d+\.\d+\.\d+):(\d+)$").expect("static regex is valid")
});

/// An address and port leased exclusively to one instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingEndpoint {
    pub address: Ipv4Addr,
    pub port: u16,
}

impl BindingEndpoint {
    pub fn new(address: Ipv4Addr, port: u16) -> Self {
        Self { address, port }
    }

    /// The value written as `server-ip`. A wildcard bind is left empty so
    /// the server listens on every interface.
    pub fn server_ip(&self) -> String {
        if self.address.is_unspecified() {
            String::new()
        } else {
            self.address.to_string()
        }
    }
}

impl fmt::Display for BindingEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

impl FromStr for BindingEndpoint {
    type Err = InstanceError;

    fn from_str(entry: &str) -> Result<Self, Self::Err> {
        let invalid = |reason| InstanceError::InvalidBinding {
            entry: entry.to_string(),
            reason,
        };
        let caps = ENTRY.captures(entry.trim()).ok_or_else(|| invalid("expected ip:port"))?;
        let address = caps[1].parse().map_err(|_| invalid("bad address"))?;
        let port = caps[2].parse().map_err(|_| invalid("bad port"))?;
        Ok(Self { address, port })
    }
}

#[derive(Default)]
struct PoolInner {
    /// Top of the stack is the end of the vector.
    free: Vec<BindingEndpoint>,
    allocated: HashSet<BindingEndpoint>,
}

/// A stack of endpoints. `allocate` pops, `free` pushes, so the most
/// recently freed endpoint is reused first.
#[derive(Default)]
pub struct BindingPool {
    inner: Mutex<PoolInner>,
}

impl BindingPool {
    /// Builds a pool from `ip:port` entries. The first entry is handed
    /// out first.
    pub fn from_entries<I, S>(entries: I) -> Result<Self, InstanceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let pool = Self::default();
        pool.reload(entries)?;
        Ok(pool)
    }

    /// Replaces the inventory. Refused while any endpoint is leased.
    pub fn reload<I, S>(&self, entries: I) -> Result<usize, InstanceError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = Vec::new();
        let mut seen = HashSet::new();
        for entry in entries {
            let entry = entry.as_ref();
            let endpoint: BindingEndpoint = entry.parse()?;
            if !seen.insert(endpoint.clone()) {
                return Err(InstanceError::InvalidBinding {
                    entry: entry.to_string(),
                    reason: "duplicated binding",
                });
            }
            parsed.push(endpoint);
        }

        let mut inner = self.inner.lock();
        if !inner.allocated.is_empty() {
            return Err(InstanceError::BindingsInUse(inner.allocated.len()));
        }
        parsed.reverse();
        inner.free = parsed;
        Ok(inner.free.len())
    }

    /// Leases the next endpoint.
    pub fn allocate(&self) -> Result<BindingEndpoint, InstanceError> {
        let mut inner = self.inner.lock();
        let endpoint = inner.free.pop().ok_or(InstanceError::NoBindingAvailable)?;
        inner.allocated.insert(endpoint.clone());
        tracing::debug!(binding = %endpoint, "binding allocated");
        Ok(endpoint)
    }

    /// Returns a leased endpoint. Freeing one that is not currently
    /// leased is an error.
    pub fn free(&self, endpoint: BindingEndpoint) -> Result<(), InstanceError> {
        let mut inner = self.inner.lock();
        if !inner.allocated.remove(&endpoint) {
            tracing::error!(binding = %endpoint, "attempt to free a binding that is not allocated");
            return Err(InstanceError::NotAllocated(endpoint));
        }
        tracing::debug!(binding = %endpoint, "binding freed");
        inner.free.push(endpoint);
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.inner.lock().free.len()
    }

    pub fn allocated(&self) -> usize {
        self.inner.lock().allocated.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> BindingPool {
        BindingPool::from_entries(["0.0.0.0:25565", "127.0.0.1:25566", "127.0.0.1:25567"])
            .expect("valid bindings")
    }

    #[test]
    fn test_first_entry_allocated_first() {
        let pool = pool();
        assert_eq!(pool.allocate().unwrap().to_string(), "0.0.0.0:25565");
        assert_eq!(pool.allocate().unwrap().to_string(), "127.0.0.1:25566");
    }

    #[test]
    fn test_exhaustion_fails() {
        let pool = pool();
        for _ in 0..3 {
            pool.allocate().expect("should allocate");
        }
        assert!(matches!(pool.allocate(), Err(InstanceError::NoBindingAvailable)));
    }

    #[test]
    fn test_free_unallocated_rejected() {
        let pool = pool();
        let endpoint = pool.allocate().unwrap();
        pool.free(endpoint.clone()).expect("first free succeeds");
        assert!(matches!(pool.free(endpoint), Err(InstanceError::NotAllocated(_))));

        let stranger: BindingEndpoint = "10.0.0.1:1".parse().unwrap();
        assert!(pool.free(stranger).is_err());
    }

    #[test]
    fn test_lifo_reuse() {
        let pool = pool();
        let first = pool.allocate().unwrap();
        pool.free(first.clone()).unwrap();
        assert_eq!(pool.allocate().unwrap(), first);
    }

    #[test]
    fn test_duplicates_and_malformed_rejected() {
        assert!(BindingPool::from_entries(["1.2.3.4:5", "1.2.3.4:5"]).is_err());
        assert!(BindingPool::from_entries(["localhost:25565"]).is_err());
        assert!(BindingPool::from_entries(["1.2.3.4:99999"]).is_err());
    }

    #[test]
    fn test_reload_refused_while_allocated() {
        let pool = pool();
        let endpoint = pool.allocate().unwrap();
        assert!(matches!(
            pool.reload(["1.1.1.1:1"]),
            Err(InstanceError::BindingsInUse(1))
        ));
        pool.free(endpoint).unwrap();
        assert_eq!(pool.reload(["1.1.1.1:1"]).unwrap(), 1);
    }

    #[test]
    fn test_server_ip_blank_for_wildcard() {
        let any: BindingEndpoint = "0.0.0.0:25565".parse().unwrap();
        assert_eq!(any.server_ip(), "");
        let local: BindingEndpoint = "127.0.0.1:25565".parse().unwrap();
        assert_eq!(local.server_ip(), "127.0.0.1");
    }
}
