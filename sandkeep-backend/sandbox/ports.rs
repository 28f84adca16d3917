//! Host port leasing for the Docker backend.
//!
//! Each exposed container port is published on a host port from a fixed
//! range. A port is handed out only when no live sandbox of this process holds
//! it and a TCP bind on it succeeds right now. Leases are keyed by sandbox id.
//! When the engine runs on another machine the bind check would test the
//! wrong host, so only the lease table guards those ports.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener};
use std::ops::RangeInclusive;
use std::sync::Mutex;

use crate::sandbox::error::SandboxError;

#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    leased: Mutex<HashMap<u16, String>>,
    bind_check: bool,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Result<Self, SandboxError> {
        if start == 0 || start > end {
            return Err(SandboxError::Config(format!("invalid port range {start}-{end}")));
        }
        Ok(Self {
            range: start..=end,
            leased: Mutex::new(HashMap::new()),
            bind_check: true,
        })
    }

    /// Skip the local bind check; for engines on a remote host.
    pub fn without_bind_check(mut self) -> Self {
        self.bind_check = false;
        self
    }

    #[cfg(test)]
    pub(crate) fn checks_bind(&self) -> bool {
        self.bind_check
    }

    /// Lease one free host port to `owner`.
    pub fn allocate(&self, owner: &str) -> Result<u16, SandboxError> {
        let start = *self.range.start() as u32;
        let span = *self.range.end() as u32 - start + 1;
        let offset = random_u32() % span;

        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        for step in 0..span {
            let port = (start + (offset + step) % span) as u16;
            if leased.contains_key(&port) {
                continue;
            }
            if self.bind_check && !is_bindable(port) {
                tracing::debug!(port, "host port in use, skipping");
                continue;
            }
            leased.insert(port, owner.to_string());
            return Ok(port);
        }

        Err(SandboxError::Provision(format!(
            "no free host port in {}-{}",
            self.range.start(),
            self.range.end()
        )))
    }

    /// Lease one host port per container port, all or nothing.
    pub fn allocate_many(&self, owner: &str, count: usize) -> Result<Vec<u16>, SandboxError> {
        let mut ports = Vec::with_capacity(count);
        for _ in 0..count {
            match self.allocate(owner) {
                Ok(port) => ports.push(port),
                Err(e) => {
                    self.release_owner(owner);
                    return Err(e);
                }
            }
        }
        Ok(ports)
    }

    /// Release every lease held by `owner`. Returns the freed ports.
    pub fn release_owner(&self, owner: &str) -> Vec<u16> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        let freed: Vec<u16> = leased
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(p, _)| *p)
            .collect();
        for port in &freed {
            leased.remove(port);
        }
        if !freed.is_empty() {
            tracing::debug!(sandbox_id = %owner, ports = ?freed, "released host ports");
        }
        freed
    }

    #[cfg(test)]
    pub(crate) fn leased_by(&self, owner: &str) -> Vec<u16> {
        let leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        let mut ports: Vec<u16> = leased
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(p, _)| *p)
            .collect();
        ports.sort_unstable();
        ports
    }

    #[cfg(test)]
    pub(crate) fn leased_count(&self) -> usize {
        self.leased.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Parse `start-end`.
pub fn parse_port_range(raw: &str) -> Result<(u16, u16), SandboxError> {
    let invalid = || SandboxError::Config(format!("invalid port range: {raw:?}"));
    let (start, end) = raw.trim().split_once('-').ok_or_else(invalid)?;
    let start: u16 = start.trim().parse().map_err(|_| invalid())?;
    let end: u16 = end.trim().parse().map_err(|_| invalid())?;
    if start == 0 || start > end {
        return Err(invalid());
    }
    Ok((start, end))
}

fn is_bindable(port: u16) -> bool {
    TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)).is_ok()
}

fn random_u32() -> u32 {
    let mut buf = [0u8; 4];
    match getrandom::fill(&mut buf) {
        Ok(()) => u32::from_le_bytes(buf),
        Err(_) => chrono::Utc::now().timestamp_subsec_nanos(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    /// Find a small range of currently free ports. Each test scans its own
    /// region so parallel tests do not grab each other's ports.
    fn free_range(region: u16, len: u16) -> (u16, u16) {
        let from = 41000 + region * 2000;
        for base in (from..from + 2000 - len).step_by(97) {
            if (base..base + len).all(is_bindable) {
                return (base, base + len - 1);
            }
        }
        panic!("no free port range for test");
    }

    #[test]
    fn allocated_ports_are_in_range_and_unique() {
        let (start, end) = free_range(0, 16);
        let alloc = PortAllocator::new(start, end).unwrap();
        let mut seen = HashSet::new();
        for i in 0..16 {
            let port = alloc.allocate(&format!("sbx-{i}")).unwrap();
            assert!((start..=end).contains(&port));
            assert!(seen.insert(port), "port {port} handed out twice");
        }
        assert!(matches!(alloc.allocate("sbx-x"), Err(SandboxError::Provision(_))));
    }

    #[test]
    fn concurrent_leasing_never_double_allocates() {
        let (start, end) = free_range(1, 40);
        let alloc = Arc::new(PortAllocator::new(start, end).unwrap());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let alloc = alloc.clone();
                std::thread::spawn(move || {
                    (0..5)
                        .map(|i| alloc.allocate(&format!("sbx-{t}-{i}")).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let all: Vec<u16> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 40);
        assert_eq!(unique.len(), 40);
    }

    #[test]
    fn occupied_ports_are_skipped() {
        let (start, end) = free_range(2, 2);
        let _foreign = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, start)).unwrap();
        let alloc = PortAllocator::new(start, end).unwrap();
        for _ in 0..3 {
            let port = alloc.allocate("sbx-a").unwrap();
            assert_eq!(port, end);
            alloc.release_owner("sbx-a");
        }
    }

    #[test]
    fn release_frees_only_the_owner() {
        let (start, end) = free_range(3, 4);
        let alloc = PortAllocator::new(start, end).unwrap();
        alloc.allocate_many("sbx-a", 2).unwrap();
        alloc.allocate("sbx-b").unwrap();
        assert_eq!(alloc.leased_by("sbx-a").len(), 2);

        let freed = alloc.release_owner("sbx-a");
        assert_eq!(freed.len(), 2);
        assert!(alloc.leased_by("sbx-a").is_empty());
        assert_eq!(alloc.leased_count(), 1);
        assert!(alloc.release_owner("sbx-unknown").is_empty());
    }

    #[test]
    fn allocate_many_is_all_or_nothing() {
        let (start, end) = free_range(4, 2);
        let alloc = PortAllocator::new(start, end).unwrap();
        assert!(alloc.allocate_many("sbx-a", 3).is_err());
        assert_eq!(alloc.leased_count(), 0);
    }

    #[test]
    fn parse_port_range_variants() {
        assert_eq!(parse_port_range("30000-39999").unwrap(), (30000, 39999));
        assert_eq!(parse_port_range(" 5000 - 5000 ").unwrap(), (5000, 5000));
        assert!(parse_port_range("40000-30000").is_err());
        assert!(parse_port_range("0-10").is_err());
        assert!(parse_port_range("abc").is_err());
        assert!(PortAllocator::new(10, 5).is_err());
    }

    #[test]
    fn remote_allocator_relies_on_leases_only() {
        let (start, end) = free_range(5, 1);
        let _occupied = TcpListener::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, start)).unwrap();

        let local = PortAllocator::new(start, end).unwrap();
        assert!(local.allocate("sbx-a").is_err());

        let remote = PortAllocator::new(start, end).unwrap().without_bind_check();
        assert_eq!(remote.allocate("sbx-a").unwrap(), start);
        assert!(remote.allocate("sbx-b").is_err());
    }
}
