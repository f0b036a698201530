//! JSON status snapshot and the minimal HTTP surface that exposes it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::addr_table::AddrSnapshot;
use crate::port::{PortRing, OUTSIDE};

#[derive(Debug, Serialize)]
pub struct InterfaceSnapshot {
    pub ifname: String,
    pub gate: Option<String>,
    pub hwaddr: String,
    pub hwclient: String,
    pub hwrouter: String,
    pub addresses: Vec<AddrSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct FullSnapshot {
    pub interfaces: Vec<InterfaceSnapshot>,
}

#[derive(Debug, Serialize)]
pub struct DumpResponse {
    #[serde(flatten)]
    pub snapshot: FullSnapshot,
    pub curtime: u64,
}

pub fn dump_snapshot(ring: &PortRing) -> FullSnapshot {
    let interfaces = ring
        .ports
        .iter()
        .enumerate()
        .map(|(idx, port)| {
            let peer = port.peer.lock();
            InterfaceSnapshot {
                ifname: port.name.clone(),
                gate: ring.gate_name(idx).map(str::to_string),
                hwaddr: port.own_mac().map(|m| m.to_string()).unwrap_or_default(),
                hwclient: peer.hwclient.to_string(),
                hwrouter: peer.hwrouter.to_string(),
                addresses: port.addr_table.lock().snapshot(),
            }
        })
        .collect();
    FullSnapshot { interfaces }
}

fn outside_dump(ring: &PortRing) -> DumpResponse {
    let port = &ring.ports[OUTSIDE];
    let peer = port.peer.lock();
    let snapshot = FullSnapshot {
        interfaces: vec![InterfaceSnapshot {
            ifname: port.name.clone(),
            gate: ring.gate_name(OUTSIDE).map(str::to_string),
            hwaddr: port.own_mac().map(|m| m.to_string()).unwrap_or_default(),
            hwclient: peer.hwclient.to_string(),
            hwrouter: peer.hwrouter.to_string(),
            addresses: port.addr_table.lock().snapshot(),
        }],
    };
    let curtime = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    DumpResponse { snapshot, curtime }
}

async fn get_dump(State(ring): State<Arc<PortRing>>) -> impl IntoResponse {
    Json(outside_dump(&ring))
}

async fn unhandled_method() -> Response {
    StatusCode::NOT_IMPLEMENTED.into_response()
}

pub fn router(ring: Arc<PortRing>) -> Router {
    Router::new()
        .route(
            "/api/v1/dump",
            get(get_dump).head(get_dump).fallback(unhandled_method),
        )
        .fallback(|| async { StatusCode::NOT_FOUND })
        .layer(TraceLayer::new_for_http())
        .with_state(ring)
}

pub async fn serve(ring: Arc<PortRing>, addr: SocketAddr) -> std::io::Result<()> {
    info!(%addr, "status endpoint listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(ring)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mac::MacAddr;
    use crate::platform::mock::MockPort;
    use crate::platform::RawPort;
    use crate::port::{Filter, Port, INSIDE, OUTSIDE as OUT};
    use crate::state_table::StateTable;
    use parking_lot::Mutex;

    fn ring() -> Arc<PortRing> {
        let outside = Port::new(
            "outside",
            Arc::new(MockPort::new()) as Arc<dyn RawPort>,
            0,
            Some(MacAddr([1, 2, 3, 4, 5, 6])),
            Filter::OutsideIn,
            INSIDE,
            Some(2),
            64,
        );
        let inside =
            Port::new("inside", Arc::new(MockPort::new()) as Arc<dyn RawPort>, 0, None, Filter::InsideIn, OUT, None, 64);
        let tunnel =
            Port::new("tunnel", Arc::new(MockPort::new()) as Arc<dyn RawPort>, 10, None, Filter::TunnelOut, OUT, None, 64);
        Arc::new(PortRing { ports: [outside, inside, tunnel], state: Mutex::new(StateTable::new(64)), pcap: None })
    }

    #[test]
    fn dump_serializes_to_valid_json() {
        let ring = ring();
        let dump = outside_dump(&ring);
        let text = serde_json::to_string(&dump).unwrap();
        let back: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(back.get("curtime").is_some());
        assert!(back.get("interfaces").is_some());
    }

    #[test]
    fn dump_reports_real_gate_and_hwaddr() {
        let ring = ring();
        let dump = outside_dump(&ring);
        let outside = &dump.snapshot.interfaces[0];
        assert_eq!(outside.gate.as_deref(), Some("tunnel"));
        assert_eq!(outside.hwaddr, "01:02:03:04:05:06");
    }

    #[test]
    fn full_snapshot_covers_all_ports() {
        let ring = ring();
        let snap = dump_snapshot(&ring);
        assert_eq!(snap.interfaces.len(), 3);
        assert_eq!(snap.interfaces[0].gate.as_deref(), Some("tunnel"));
        assert!(snap.interfaces[1].gate.is_none());
        // the tunnel port has no L2 identity of its own
        assert_eq!(snap.interfaces[2].hwaddr, "");
    }
}
