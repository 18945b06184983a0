//! # Host Set
//!
//! Purpose: Track the backend addresses the pool should be connected to and
//! compute what changed when discovery reports a new list.
//!
//! ## Design Principles
//! 1. **Identity by Address**: Two hosts with the same IP are the same host.
//! 2. **Order Independence**: Sets are kept sorted; input order and
//!    duplicates never matter.

use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

/// One backend address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Host {
    pub address: IpAddr,
    pub port: u16,
}

impl Host {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Host { address, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Hosts to add and remove to move from one set to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostDelta {
    pub added: Vec<Host>,
    pub removed: Vec<Host>,
}

impl HostDelta {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Authoritative set of backend hosts.
#[derive(Debug, Clone, Default)]
pub struct HostSet {
    current: BTreeMap<IpAddr, Host>,
}

impl HostSet {
    pub fn new() -> Self {
        HostSet::default()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    pub fn contains(&self, address: &IpAddr) -> bool {
        self.current.contains_key(address)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Host> {
        self.current.values()
    }

    /// Inserts a host; returns false if its address was already present.
    pub fn insert(&mut self, host: Host) -> bool {
        if self.current.contains_key(&host.address) {
            return false;
        }
        self.current.insert(host.address, host);
        true
    }

    pub fn remove(&mut self, address: &IpAddr) -> Option<Host> {
        self.current.remove(address)
    }

    /// Symmetric difference between the current set and `incoming`.
    ///
    /// Hosts only in `incoming` are additions; hosts only in the current set
    /// are removals. Duplicate addresses in `incoming` collapse to the first.
    pub fn diff<'a, I>(&self, incoming: I) -> HostDelta
    where
        I: IntoIterator<Item = &'a Host>,
    {
        let incoming = collapse(incoming);
        let added = incoming
            .values()
            .filter(|host| !self.current.contains_key(&host.address))
            .copied()
            .collect();
        let removed = self
            .current
            .values()
            .filter(|host| !incoming.contains_key(&host.address))
            .copied()
            .collect();
        HostDelta { added, removed }
    }

    /// Replaces the current set with `incoming`.
    pub fn replace<'a, I>(&mut self, incoming: I)
    where
        I: IntoIterator<Item = &'a Host>,
    {
        self.current = collapse(incoming);
    }
}

fn collapse<'a, I>(hosts: I) -> BTreeMap<IpAddr, Host>
where
    I: IntoIterator<Item = &'a Host>,
{
    let mut out = BTreeMap::new();
    for host in hosts {
        out.entry(host.address).or_insert(*host);
    }
    out
}
