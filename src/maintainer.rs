//! The periodic maintainer: ages out learned addresses and states, and
//! promotes discovered router/client identities onto their ports.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use tracing::{info, warn};

use crate::platform::TunController;
use crate::port::{PortRing, INSIDE, OUTSIDE};

const TICK: Duration = Duration::from_secs(10);

/// Shared readiness gate: port receive loops and the maintainer increment
/// this as they enter their steady-state loop; `main` waits on it before
/// starting the interactive console.
pub struct ReadyGate {
    count: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl ReadyGate {
    pub fn new() -> Self {
        Self { count: AtomicUsize::new(0), lock: Mutex::new(()), cvar: Condvar::new() }
    }

    pub fn mark_ready(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
        self.cvar.notify_all();
    }

    pub fn wait_for(&self, expected: usize) {
        let mut guard = self.lock.lock().unwrap();
        while self.count.load(Ordering::SeqCst) < expected {
            guard = self.cvar.wait(guard).unwrap();
        }
    }
}

impl Default for ReadyGate {
    fn default() -> Self {
        Self::new()
    }
}

pub fn run(
    ring: Arc<PortRing>,
    tun: Arc<dyn TunController>,
    tunnel_ifname: String,
    max_age: u64,
    ready: Arc<ReadyGate>,
) {
    ready.mark_ready();
    loop {
        std::thread::sleep(TICK);
        tick(&ring, tun.as_ref(), &tunnel_ifname, max_age);
    }
}

fn tick(ring: &PortRing, tun: &dyn TunController, tunnel_ifname: &str, max_age: u64) {
    for port in &ring.ports {
        port.addr_table.lock().cleanup(max_age);
    }

    maintain_router(ring);
    maintain_client(ring, tun, tunnel_ifname);

    ring.state.lock().cleanup();
}

fn maintain_router(ring: &PortRing) {
    let outside = &ring.ports[OUTSIDE];
    let pinned = outside.peer.lock().router_valid >= 2;
    if pinned {
        return;
    }
    let Some(found) = outside.addr_table.lock().search_router() else {
        return;
    };
    let mut peer = outside.peer.lock();
    if peer.hwrouter != found {
        info!(ifname = %outside.name, router = %found, "router address changed");
        peer.hwrouter = found;
        peer.router_valid = 1;
    }
}

fn maintain_client(ring: &PortRing, tun: &dyn TunController, tunnel_ifname: &str) {
    let inside = &ring.ports[INSIDE];
    if inside.peer.lock().hwclient_valid {
        return;
    }
    let Some((mac, addr)) = inside.addr_table.lock().search_client() else {
        return;
    };
    // re-check under lock in case another maintainer tick (or a future
    // concurrent path) already published a client while we were searching
    if inside.peer.lock().hwclient_valid {
        return;
    }

    let netmask = std::net::Ipv4Addr::new(255, 255, 255, 255);
    if let Err(e) = tun.configure_ipv4(tunnel_ifname, addr, netmask) {
        warn!(error = %e, "failed to configure tunnel address");
        return;
    }

    // publish validity only after the tunnel device is actually routable,
    // so no observer ever sees hwclient_valid=true prematurely
    let mut peer = inside.peer.lock();
    info!(ifname = %inside.name, client = %mac, addr = %addr, "client identified");
    peer.hwclient = mac;
    peer.hwclient_valid = true;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr_table::CLIENT;
    use crate::mac::MacAddr;
    use crate::platform::mock::{MockPort, MockTunController};
    use crate::platform::RawPort;
    use crate::port::{Filter, Port, INSIDE as IN, OUTSIDE as OUT};
    use crate::state_table::StateTable;
    use parking_lot::Mutex as PLMutex;

    fn ring() -> Arc<PortRing> {
        let outside = Port::new(
            "outside",
            Arc::new(MockPort::new()) as Arc<dyn RawPort>,
            0,
            Some(MacAddr([1; 6])),
            Filter::OutsideIn,
            IN,
            Some(2),
            64,
        );
        let inside = Port::new(
            "inside",
            Arc::new(MockPort::new()) as Arc<dyn RawPort>,
            0,
            Some(MacAddr([2; 6])),
            Filter::InsideIn,
            OUT,
            None,
            64,
        );
        let tunnel = Port::new(
            "tunnel",
            Arc::new(MockPort::new()) as Arc<dyn RawPort>,
            10,
            None,
            Filter::TunnelOut,
            OUT,
            None,
            64,
        );
        Arc::new(PortRing { ports: [outside, inside, tunnel], state: PLMutex::new(StateTable::new(64)), pcap: None })
    }

    #[test]
    fn client_publishes_after_tunnel_configured() {
        let ring = ring();
        let client_mac = MacAddr([9, 9, 9, 9, 9, 9]);
        for _ in 0..10 {
            ring.ports[IN]
                .addr_table
                .lock()
                .update(client_mac, Some(crate::addr_table::ProtoAddr::Ipv4(std::net::Ipv4Addr::new(10, 0, 0, 5))), CLIENT)
                .unwrap();
        }

        let tun = MockTunController::new();
        maintain_client(&ring, &tun, "tun0");

        assert!(ring.ports[IN].peer.lock().hwclient_valid);
        assert_eq!(tun.configured.lock().unwrap().len(), 1);
    }
}
