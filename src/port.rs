//! Port (interface agent): the per-interface receive loop, the three
//! filters, and the small ring of cross-port references they need.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::addr_table::AddressTable;
use crate::frame::{self, Direction};
use crate::mac::MacAddr;
use crate::pcap::PcapWriter;
use crate::platform::RawPort;
use crate::state_table::StateTable;

pub const OUTSIDE: usize = 0;
pub const INSIDE: usize = 1;
pub const TUNNEL: usize = 2;

const SNAPLEN: usize = 4096;

/// Per-port policy, dispatched as data rather than as a function pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Filter {
    Accept,
    OutsideIn,
    InsideIn,
    TunnelOut,
}

enum FilterResult {
    Accept,
    Drop,
}

/// The learned peer identities a port publishes for the filters to read.
/// `router_valid`: 0 = unknown, 1 = learned, 2 = operator-pinned.
#[derive(Default)]
pub struct PeerState {
    pub hwclient: MacAddr,
    pub hwclient_valid: bool,
    pub hwrouter: MacAddr,
    pub router_valid: u8,
}

pub struct Port {
    pub name: String,
    raw: Arc<dyn RawPort>,
    /// Bytes of synthetic header the reader zero-prefixes before reading;
    /// writers skip the same number of bytes of whatever buffer they send.
    pub off: usize,
    /// `None` for the tunnel port, which has no real L2 identity.
    own_mac: Option<MacAddr>,
    filter: Filter,
    out: usize,
    gate: Option<usize>,
    pub addr_table: Mutex<AddressTable>,
    pub peer: Mutex<PeerState>,
}

impl Port {
    /// `None` for the tunnel port, which has no real L2 identity.
    pub fn own_mac(&self) -> Option<MacAddr> {
        self.own_mac
    }

    pub fn new(
        name: impl Into<String>,
        raw: Arc<dyn RawPort>,
        off: usize,
        own_mac: Option<MacAddr>,
        filter: Filter,
        out: usize,
        gate: Option<usize>,
        table_capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            raw,
            off,
            own_mac,
            filter,
            out,
            gate,
            addr_table: Mutex::new(AddressTable::new(table_capacity, table_capacity)),
            peer: Mutex::new(PeerState::default()),
        }
    }
}

/// Owns all three ports and the shared state table. Cyclic references
/// between ports (outside.out = inside, inside.out = outside, tunnel.out =
/// outside, outside.gate = tunnel) are modeled as plain indices into
/// `ports`, never as owned pointers.
pub struct PortRing {
    pub ports: [Port; 3],
    pub state: Mutex<StateTable>,
    pub pcap: Option<Arc<PcapWriter>>,
}

impl PortRing {
    /// Name of the port `idx` diverts dropped frames to, if any.
    pub fn gate_name(&self, idx: usize) -> Option<&str> {
        self.ports[idx].gate.map(|g| self.ports[g].name.as_str())
    }

    fn write_out(&self, dest: usize, buf: &[u8], len: usize) {
        let port = &self.ports[dest];
        match port.raw.send(&buf[port.off..len]) {
            Ok(n) if n < len - port.off => {
                warn!(port = %port.name, wrote = n, total = len - port.off, "short write");
            }
            Ok(_) => {}
            Err(e) => error!(port = %port.name, error = %e, "write failed"),
        }
    }

    fn apply_filter(&self, idx: usize, buf: &mut [u8], len: usize) -> FilterResult {
        match self.ports[idx].filter {
            Filter::Accept => FilterResult::Accept,
            Filter::InsideIn => FilterResult::Accept,
            Filter::OutsideIn => self.filter_outside_in(idx, buf, len),
            Filter::TunnelOut => self.filter_tunnel_out(idx, buf, len),
        }
    }

    /// Divert host-originated replies into the tunnel; bridge everything
    /// else straight through to the inside interface.
    fn filter_outside_in(&self, idx: usize, buf: &mut [u8], len: usize) -> FilterResult {
        let matched = self.state.lock().update_if_exists(&buf[..len], Direction::Incoming).is_some();
        if !matched {
            return FilterResult::Accept;
        }
        if let Some(gate) = self.ports[idx].gate {
            let gate_off = self.ports[gate].off;
            for b in buf.iter_mut().take(gate_off) {
                *b = 0;
            }
        }
        FilterResult::Drop
    }

    /// Masquerade a tunnel-originated IPv4 packet as the client, toward the
    /// router, and record the flow in the state table.
    fn filter_tunnel_out(&self, idx: usize, buf: &mut [u8], len: usize) -> FilterResult {
        match frame::ether_type(buf) {
            Some(frame::ETHERTYPE_IPV4) => {}
            other => {
                debug!(?other, "ethertype on tunnel-out not implemented yet");
                return FilterResult::Drop;
            }
        }

        let outside = self.ports[idx].out;
        let inside = self.ports[outside].out;

        // lock order: client-side (inside) port before router-side (outside)
        let hwclient = {
            let peer = self.ports[inside].peer.lock();
            if !peer.hwclient_valid {
                warn!(port = %self.ports[inside].name, "no valid client address yet found");
                return FilterResult::Drop;
            }
            peer.hwclient
        };
        buf[6..12].copy_from_slice(&hwclient.0);

        let hwrouter = {
            let peer = self.ports[outside].peer.lock();
            if peer.router_valid == 0 {
                warn!(port = %self.ports[outside].name, "no valid router address yet found");
                return FilterResult::Drop;
            }
            peer.hwrouter
        };
        buf[0..6].copy_from_slice(&hwrouter.0);

        match self.state.lock().update(&buf[..len], Direction::Outgoing) {
            Ok(_) => FilterResult::Accept,
            Err(e) => {
                debug!(error = %e, "not tracking tunnel-out flow");
                FilterResult::Drop
            }
        }
    }
}

/// Runs the blocking receive loop for port `idx` until EOF. Intended to be
/// spawned on its own OS thread.
pub fn receive_loop(ring: Arc<PortRing>, idx: usize) {
    let mut buf = vec![0u8; SNAPLEN];
    let off = ring.ports[idx].off;

    loop {
        for b in buf.iter_mut().take(off) {
            *b = 0;
        }

        let n = match ring.ports[idx].raw.recv(&mut buf[off..]) {
            Ok(0) => {
                info!(port = %ring.ports[idx].name, "received EOF, stopping receiver");
                return;
            }
            Ok(n) => n,
            Err(e) => {
                error!(port = %ring.ports[idx].name, error = %e, "read failed, retrying in 10s");
                std::thread::sleep(Duration::from_secs(10));
                continue;
            }
        };
        let len = n + off;

        if let Some(pcap) = &ring.pcap {
            pcap.save(&buf[..len]);
        }

        if drop_self_sourced(&ring.ports[idx], &buf[..len]) {
            continue;
        }

        let (addr, learn_flags) = frame::learn_source(&buf[..len]);
        if let Some(src_mac) = frame::ether_src(&buf[..len]) {
            if let Err(e) = ring.ports[idx].addr_table.lock().update(src_mac, addr, learn_flags) {
                error!(port = %ring.ports[idx].name, error = %e, "address table update failed");
            }
        }

        match ring.apply_filter(idx, &mut buf, len) {
            FilterResult::Accept => ring.write_out(ring.ports[idx].out, &buf, len),
            FilterResult::Drop => {
                if let Some(gate) = ring.ports[idx].gate {
                    debug!(from = %ring.ports[idx].name, to = %ring.ports[gate].name, "diverting");
                    ring.write_out(gate, &buf, len);
                }
            }
        }
    }
}

fn drop_self_sourced(port: &Port, buf: &[u8]) -> bool {
    match (port.own_mac, frame::ether_src(buf)) {
        (Some(own), Some(src)) if own == src => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::mock::MockPort;

    fn eth(src: [u8; 6], dst: [u8; 6], ethertype: u16, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![0u8; 14];
        v[0..6].copy_from_slice(&dst);
        v[6..12].copy_from_slice(&src);
        v[12..14].copy_from_slice(&ethertype.to_be_bytes());
        v.extend_from_slice(payload);
        v
    }

    fn build_ring() -> Arc<PortRing> {
        let outside_raw: Arc<dyn RawPort> = Arc::new(MockPort::new());
        let inside_raw: Arc<dyn RawPort> = Arc::new(MockPort::new());
        let tunnel_raw: Arc<dyn RawPort> = Arc::new(MockPort::new());

        let outside = Port::new(
            "outside",
            outside_raw,
            0,
            Some(MacAddr([0xaa, 0, 0, 0, 0, 1])),
            Filter::OutsideIn,
            INSIDE,
            Some(TUNNEL),
            64,
        );
        let inside = Port::new(
            "inside",
            inside_raw,
            0,
            Some(MacAddr([0xbb, 0, 0, 0, 0, 1])),
            Filter::InsideIn,
            OUTSIDE,
            None,
            64,
        );
        let tunnel = Port::new("tunnel", tunnel_raw, 10, None, Filter::TunnelOut, OUTSIDE, None, 64);

        Arc::new(PortRing {
            ports: [outside, inside, tunnel],
            state: Mutex::new(StateTable::new(64)),
            pcap: None,
        })
    }

    #[test]
    fn self_sourced_frames_are_dropped() {
        let ring = build_ring();
        let own = ring.ports[OUTSIDE].addr_table.lock().live_count();
        assert_eq!(own, 0);

        let frame = eth([0xaa, 0, 0, 0, 0, 1], [1, 2, 3, 4, 5, 6], 0x0800, &[]);
        assert!(drop_self_sourced(&ring.ports[OUTSIDE], &frame));
    }

    #[test]
    fn tunnel_out_requires_learned_peers() {
        let ring = build_ring();
        let mut frame = eth([0; 6], [0; 6], frame::ETHERTYPE_IPV4, &[]);
        let mut ip = vec![0u8; 24];
        ip[0] = 0x45;
        ip[9] = frame::PROTO_TCP;
        ip[12..16].copy_from_slice(&[10, 0, 0, 5]);
        ip[16..20].copy_from_slice(&[93, 184, 216, 34]);
        ip[20..22].copy_from_slice(&54321u16.to_be_bytes());
        ip[22..24].copy_from_slice(&80u16.to_be_bytes());
        frame.extend_from_slice(&ip);
        let len = frame.len();

        assert!(matches!(ring.apply_filter(TUNNEL, &mut frame, len), FilterResult::Drop));

        {
            let mut peer = ring.ports[INSIDE].peer.lock();
            peer.hwclient = MacAddr([1, 1, 1, 1, 1, 1]);
            peer.hwclient_valid = true;
        }
        {
            let mut peer = ring.ports[OUTSIDE].peer.lock();
            peer.hwrouter = MacAddr([2, 2, 2, 2, 2, 2]);
            peer.router_valid = 1;
        }

        let result = ring.apply_filter(TUNNEL, &mut frame, len);
        assert!(matches!(result, FilterResult::Accept));
        assert_eq!(&frame[0..6], &[2, 2, 2, 2, 2, 2]);
        assert_eq!(&frame[6..12], &[1, 1, 1, 1, 1, 1]);
        assert_eq!(ring.state.lock().live_count(), 1);
    }
}
