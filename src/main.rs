//! Endoor entry point: parses arguments, loads configuration, wires up the
//! three ports and the maintainer, and runs the interactive console.

use std::sync::Arc;

use clap::Parser;
use endoor::cli::Args;
use endoor::config::EndoorConfig;
use endoor::console;
use endoor::maintainer::{self, ReadyGate};
use endoor::mac::MacAddr;
use endoor::pcap::PcapWriter;
use endoor::platform::{RawPort, TunController};
use endoor::port::{Filter, Port, PortRing, INSIDE, OUTSIDE, TUNNEL};
use endoor::state_table::StateTable;
use endoor::status;
use parking_lot::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const TABLE_CAPACITY: usize = 1024;
const STATE_CAPACITY: usize = 16384;
const SNAPLEN: u32 = 4096;
const TUNNEL_IFNAME: &str = "tun0";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let config_path = args.config.clone().unwrap_or_else(|| "/etc/endoor/endoor.json".into());
    let config = EndoorConfig::load(&config_path).unwrap_or_else(|e| {
        eprintln!("config not found at {config_path} ({e}), using defaults");
        EndoorConfig::default()
    });
    let config = args.apply(config);

    let initial_filter = if config.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_new(std::env::var("RUST_LOG").unwrap_or_else(|_| initial_filter.into()))?;
    let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(filter);
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting endoor");

    let pcap = config
        .pcap_path
        .as_ref()
        .map(|path| PcapWriter::create(path, SNAPLEN).map(Arc::new))
        .transpose()?;

    let ring = Arc::new(build_ring(&config, pcap)?);
    let tun: Arc<dyn TunController> = make_tun_controller();

    let ready = Arc::new(ReadyGate::new());

    for idx in [OUTSIDE, INSIDE, TUNNEL] {
        let ring = ring.clone();
        let ready = ready.clone();
        std::thread::Builder::new().name(format!("recv{idx}")).spawn(move || {
            ready.mark_ready();
            endoor::port::receive_loop(ring, idx);
        })?;
    }

    {
        let ring = ring.clone();
        let tun = tun.clone();
        let ready = ready.clone();
        let max_age = config.max_age_secs;
        std::thread::Builder::new().name("maintainer".into()).spawn(move || {
            maintainer::run(ring, tun, TUNNEL_IFNAME.into(), max_age, ready);
        })?;
    }

    if let Some(addr) = config.http_bind {
        let ring = ring.clone();
        std::thread::Builder::new().name("status-http".into()).spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread().enable_io().build().expect("tokio runtime");
            if let Err(e) = rt.block_on(status::serve(ring, addr)) {
                tracing::error!(error = %e, "status server exited");
            }
        })?;
    }

    // wait for the three receivers + maintainer before starting the console
    ready.wait_for(4);

    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    console::run(stdin.lock(), stdout.lock(), ring, reload_handle);

    Ok(())
}

fn build_ring(
    config: &EndoorConfig,
    pcap: Option<Arc<PcapWriter>>,
) -> Result<PortRing, Box<dyn std::error::Error>> {
    let (outside_raw, outside_mac) = make_port(&config.outside_ifname)?;
    let (inside_raw, inside_mac) = make_port(&config.inside_ifname)?;
    let tunnel_raw = make_tunnel()?;

    let outside = Port::new(
        config.outside_ifname.clone(),
        outside_raw,
        0,
        Some(outside_mac),
        Filter::OutsideIn,
        INSIDE,
        Some(TUNNEL),
        TABLE_CAPACITY,
    );
    let inside = Port::new(
        config.inside_ifname.clone(),
        inside_raw,
        0,
        Some(inside_mac),
        Filter::InsideIn,
        OUTSIDE,
        None,
        TABLE_CAPACITY,
    );
    // the tunnel's own MAC is modeled as absent (`None`) rather than the
    // historical all-ones sentinel, so the self-frame check never fires
    // for it
    let tunnel = Port::new(TUNNEL_IFNAME, tunnel_raw, 10, None, Filter::TunnelOut, OUTSIDE, None, TABLE_CAPACITY);

    if let Some(pinned) = config.pinned_router_mac {
        let mut peer = outside.peer.lock();
        peer.hwrouter = pinned;
        peer.router_valid = 2;
    }

    Ok(PortRing { ports: [outside, inside, tunnel], state: Mutex::new(StateTable::new(STATE_CAPACITY)), pcap })
}

#[cfg(target_os = "linux")]
fn make_port(ifname: &str) -> std::io::Result<(Arc<dyn RawPort>, MacAddr)> {
    let port = endoor::platform::linux::LinuxPort::bind(ifname)?;
    let mac = MacAddr(port.hwaddr());
    Ok((Arc::new(port), mac))
}

#[cfg(not(target_os = "linux"))]
fn make_port(ifname: &str) -> std::io::Result<(Arc<dyn RawPort>, MacAddr)> {
    tracing::warn!(ifname, "raw AF_PACKET sockets are only implemented for linux; using an in-memory port");
    Ok((Arc::new(endoor::platform::mock::MockPort::new()), MacAddr::ZERO))
}

#[cfg(target_os = "linux")]
fn make_tunnel() -> std::io::Result<Arc<dyn RawPort>> {
    Ok(Arc::new(endoor::platform::linux::LinuxTunDevice::alloc(TUNNEL_IFNAME)?))
}

#[cfg(not(target_os = "linux"))]
fn make_tunnel() -> std::io::Result<Arc<dyn RawPort>> {
    Ok(Arc::new(endoor::platform::mock::MockPort::new()))
}

#[cfg(target_os = "linux")]
fn make_tun_controller() -> Arc<dyn TunController> {
    Arc::new(endoor::platform::linux::LinuxTun)
}

#[cfg(not(target_os = "linux"))]
fn make_tun_controller() -> Arc<dyn TunController> {
    Arc::new(endoor::platform::mock::MockTunController::new())
}
