//! The passive address-learning table.
//!
//! A two-level structure: the outer level is keyed by Ethernet hardware
//! address, the inner level (one per outer entry) by the protocol addresses
//! that MAC has been observed sourcing. Both levels share the same entry
//! shape; only outer entries ever populate a child table.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::error::EndoorError;
use crate::mac::MacAddr;

/// An entry is flagged ROUTER after it has been seen sourcing a router
/// advertisement; CLIENT is reserved for explicit marking and is currently
/// set only by the legacy ARP-triggered path in `filter_inside_in`.
pub const ROUTER: u8 = 0x01;
pub const CLIENT: u8 = 0x02;

const MIN_HITS: u64 = 100;

/// A family-tagged address, as stored in a table slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoAddr {
    Mac(MacAddr),
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
}

impl ProtoAddr {
    fn type_id(&self) -> i32 {
        match self {
            // matches the historical AF_PACKET/AF_INET/AF_INET6 values used
            // in the JSON dump
            ProtoAddr::Mac(_) => 17,
            ProtoAddr::Ipv4(_) => 2,
            ProtoAddr::Ipv6(_) => 10,
        }
    }
}

impl std::fmt::Display for ProtoAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProtoAddr::Mac(m) => write!(f, "{m}"),
            ProtoAddr::Ipv4(a) => write!(f, "{a}"),
            ProtoAddr::Ipv6(a) => write!(f, "{a}"),
        }
    }
}

struct AddrEntry {
    addr: Option<ProtoAddr>,
    last_seen: u64,
    hits: u64,
    flags: u8,
    children: Option<Box<AddressTable>>,
}

impl AddrEntry {
    fn empty() -> Self {
        Self { addr: None, last_seen: 0, hits: 0, flags: 0, children: None }
    }

    fn is_empty(&self) -> bool {
        self.addr.is_none()
    }
}

/// Fixed-capacity table of address entries, one level of the two-level
/// structure described above.
pub struct AddressTable {
    entries: Vec<AddrEntry>,
    child_capacity: usize,
    live_count: usize,
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl AddressTable {
    /// `capacity` bounds this level; `child_capacity` is the capacity newly
    /// created child tables (under a MAC entry) will be given.
    pub fn new(capacity: usize, child_capacity: usize) -> Self {
        Self {
            entries: (0..capacity).map(|_| AddrEntry::empty()).collect(),
            child_capacity,
            live_count: 0,
        }
    }

    pub fn live_count(&self) -> usize {
        self.live_count
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn get_addr_index(&self, addr: &ProtoAddr) -> Option<usize> {
        let mut seen = 0;
        for (i, e) in self.entries.iter().enumerate() {
            if e.is_empty() {
                continue;
            }
            seen += 1;
            if e.addr.as_ref() == Some(addr) {
                return Some(i);
            }
            if seen >= self.live_count {
                break;
            }
        }
        None
    }

    fn get_empty_index(&self) -> Option<usize> {
        self.entries.iter().position(|e| e.is_empty())
    }

    /// Update (or create) a single-level entry for `addr`. Returns its index.
    fn update_entry(&mut self, addr: ProtoAddr, flags: u8) -> Result<usize, EndoorError> {
        let i = match self.get_addr_index(&addr) {
            Some(i) => i,
            None => {
                let i = self.get_empty_index().ok_or_else(|| {
                    EndoorError::Capacity("protocol address list full".into())
                })?;
                self.entries[i].addr = Some(addr);
                self.live_count += 1;
                i
            }
        };
        let e = &mut self.entries[i];
        e.last_seen = now_secs();
        e.hits += 1;
        e.flags |= flags;
        Ok(i)
    }

    /// Learn that `mac` sourced `addr` (if any; `None` means only the MAC
    /// itself was observed, with no protocol address extracted).
    pub fn update(
        &mut self,
        mac: MacAddr,
        addr: Option<ProtoAddr>,
        flags: u8,
    ) -> Result<usize, EndoorError> {
        let outer = self.update_entry(ProtoAddr::Mac(mac), flags)?;
        if let Some(addr) = addr {
            let entry = &mut self.entries[outer];
            let child = entry
                .children
                .get_or_insert_with(|| Box::new(AddressTable::new(self.child_capacity, 0)));
            child.update_entry(addr, flags)?;
        }
        Ok(outer)
    }

    /// Highest-hit MAC carrying the ROUTER flag, falling back to the
    /// overall busiest MAC if none is flagged. Requires `hits > MIN_HITS`.
    pub fn search_router(&self) -> Option<MacAddr> {
        if self.live_count == 0 {
            return None;
        }
        let flagged = self
            .entries
            .iter()
            .filter(|e| !e.is_empty() && e.flags & ROUTER == ROUTER)
            .reduce(|a, b| if b.hits > a.hits { b } else { a });

        let candidate = flagged.or_else(|| {
            self.entries.iter().filter(|e| !e.is_empty()).reduce(|a, b| if b.hits > a.hits { b } else { a })
        })?;

        if candidate.hits <= MIN_HITS {
            return None;
        }
        match candidate.addr {
            Some(ProtoAddr::Mac(m)) => Some(m),
            _ => None,
        }
    }

    /// Busiest MAC overall, then its busiest non-link-local, non-zero IPv4
    /// child.
    pub fn search_client(&self) -> Option<(MacAddr, Ipv4Addr)> {
        if self.live_count == 0 {
            return None;
        }
        let busiest =
            self.entries.iter().filter(|e| !e.is_empty()).reduce(|a, b| if b.hits > a.hits { b } else { a })?;
        let mac = match busiest.addr {
            Some(ProtoAddr::Mac(m)) => m,
            _ => return None,
        };
        let children = busiest.children.as_ref()?;
        let addr = children
            .entries
            .iter()
            .filter_map(|e| match e.addr {
                Some(ProtoAddr::Ipv4(a)) if is_usable_client_ip(a) => Some((e.hits, a)),
                _ => None,
            })
            .reduce(|a, b| if b.0 > a.0 { b } else { a })
            .map(|(_, a)| a)?;
        Some((mac, addr))
    }

    /// Recursively drop entries older than `max_age` seconds, leaves first.
    /// `max_age == 0` disables expiry.
    pub fn cleanup(&mut self, max_age: u64) {
        if max_age == 0 {
            return;
        }
        let now = now_secs();
        for e in self.entries.iter_mut() {
            if e.is_empty() {
                continue;
            }

            if let Some(children) = e.children.as_mut() {
                children.cleanup(max_age);
                if children.live_count > 0 {
                    // a surviving child keeps the parent alive regardless of its own age
                    continue;
                }
            }

            if e.last_seen + max_age < now {
                *e = AddrEntry::empty();
                self.live_count -= 1;
            }
        }
    }

    pub fn snapshot(&self) -> Vec<AddrSnapshot> {
        self.entries
            .iter()
            .filter(|e| !e.is_empty())
            .map(|e| AddrSnapshot {
                r#type: e.addr.as_ref().unwrap().type_id(),
                addr: e.addr.as_ref().unwrap().to_string(),
                time: e.last_seen,
                addresses: e
                    .children
                    .as_ref()
                    .map(|c| c.snapshot())
                    .unwrap_or_default(),
            })
            .collect()
    }
}

fn is_usable_client_ip(addr: Ipv4Addr) -> bool {
    if addr.is_unspecified() {
        return false;
    }
    let octets = addr.octets();
    !(octets[0] == 169 && octets[1] == 254)
}

#[derive(Debug, Serialize)]
pub struct AddrSnapshot {
    pub r#type: i32,
    pub addr: String,
    pub time: u64,
    pub addresses: Vec<AddrSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> MacAddr {
        MacAddr([0xaa, 0xbb, 0xcc, 0, 0, b])
    }

    #[test]
    fn update_creates_outer_and_inner() {
        let mut t = AddressTable::new(16, 16);
        let addr = ProtoAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 5));
        for _ in 0..150 {
            t.update(mac(1), Some(addr), CLIENT).unwrap();
        }
        assert_eq!(t.live_count(), 1);
        let snap = t.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].addresses.len(), 1);
        // hits aren't exposed directly in the snapshot, but repeated
        // updates must not create duplicate entries
    }

    #[test]
    fn search_client_excludes_link_local() {
        let mut t = AddressTable::new(16, 16);
        let busy = mac(1);
        for _ in 0..500 {
            t.update(busy, Some(ProtoAddr::Ipv4(Ipv4Addr::new(169, 254, 1, 1))), 0).unwrap();
        }
        for _ in 0..10 {
            t.update(busy, Some(ProtoAddr::Ipv4(Ipv4Addr::new(10, 0, 0, 9))), 0).unwrap();
        }
        let (found_mac, found_ip) = t.search_client().expect("client found");
        assert_eq!(found_mac, busy);
        assert_eq!(found_ip, Ipv4Addr::new(10, 0, 0, 9));
    }

    #[test]
    fn search_router_prefers_flagged() {
        let mut t = AddressTable::new(16, 16);
        for _ in 0..200 {
            t.update(mac(2), None, 0).unwrap();
        }
        for _ in 0..101 {
            t.update(mac(1), None, ROUTER).unwrap();
        }
        assert_eq!(t.search_router(), Some(mac(1)));
    }

    #[test]
    fn search_router_falls_back_without_flag() {
        let mut t = AddressTable::new(16, 16);
        for _ in 0..200 {
            t.update(mac(2), None, 0).unwrap();
        }
        for _ in 0..50 {
            t.update(mac(3), None, 0).unwrap();
        }
        assert_eq!(t.search_router(), Some(mac(2)));
    }

    #[test]
    fn search_router_ties_favor_lowest_index() {
        let mut t = AddressTable::new(16, 16);
        for _ in 0..150 {
            t.update(mac(1), None, 0).unwrap();
        }
        for _ in 0..150 {
            t.update(mac(2), None, 0).unwrap();
        }
        // mac(1) occupies the lower outer index and must win the tie
        assert_eq!(t.search_router(), Some(mac(1)));
    }

    #[test]
    fn search_router_on_empty_table_returns_none() {
        let t = AddressTable::new(16, 16);
        assert_eq!(t.search_router(), None);
    }

    #[test]
    fn cleanup_removes_aged_entries() {
        let mut t = AddressTable::new(16, 16);
        t.update(mac(1), None, 0).unwrap();
        assert_eq!(t.live_count(), 1);
        // force age by rewriting last_seen into the past
        t.entries[0].last_seen = 0;
        t.cleanup(1);
        assert_eq!(t.live_count(), 0);
    }

    #[test]
    fn capacity_exhaustion_is_reported() {
        let mut t = AddressTable::new(1, 1);
        t.update(mac(1), None, 0).unwrap();
        let err = t.update(mac(2), None, 0);
        assert!(err.is_err());
    }
}
