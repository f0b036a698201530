//! The interactive line-oriented console: `addr`, `info`, `router`,
//! `state`, `dump`, `expire`, `debug`, `nodebug`, `help`, `exit`.

use std::io::{BufRead, Write};
use std::sync::Arc;

use tracing_subscriber::{reload, EnvFilter};

use crate::mac::MacAddr;
use crate::port::PortRing;
use crate::status::dump_snapshot;

pub type LogReload = reload::Handle<EnvFilter, tracing_subscriber::Registry>;

pub fn run<R: BufRead, W: Write>(mut input: R, mut output: W, ring: Arc<PortRing>, log: LogReload) {
    loop {
        write!(output, "endoor> ").ok();
        output.flush().ok();

        let mut line = String::new();
        if input.read_line(&mut line).unwrap_or(0) == 0 {
            break;
        }
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let mut parts = line.split_whitespace();
        let cmd = parts.next().unwrap_or("");
        let rest: Vec<&str> = parts.collect();

        match cmd {
            "exit" | "quit" => break,
            "help" => print_help(&mut output),
            "debug" => {
                set_filter(&log, "debug");
                writeln!(output, "debug logging enabled").ok();
            }
            "nodebug" => {
                set_filter(&log, "info");
                writeln!(output, "debug logging disabled").ok();
            }
            "addr" => print_addr(&mut output, &ring),
            "info" => print_info(&mut output, &ring),
            "state" => print_state(&mut output, &ring),
            "router" => match rest.first().and_then(|s| s.parse::<MacAddr>().ok()) {
                Some(mac) => {
                    let mut peer = ring.ports[crate::port::OUTSIDE].peer.lock();
                    peer.hwrouter = mac;
                    peer.router_valid = 2;
                    writeln!(output, "router pinned to {mac}").ok();
                }
                None => {
                    writeln!(output, "usage: router <hwaddr>").ok();
                }
            },
            "expire" => match rest.first().and_then(|s| s.parse::<u64>().ok()) {
                Some(age) => {
                    for port in &ring.ports {
                        port.addr_table.lock().cleanup(age);
                    }
                    writeln!(output, "expired addresses older than {age}s").ok();
                }
                None => {
                    writeln!(output, "usage: expire <secs>").ok();
                }
            },
            "dump" => match dump_to_file(&ring, "dump.json") {
                Ok(()) => {
                    writeln!(output, "wrote dump.json").ok();
                }
                Err(e) => {
                    writeln!(output, "dump failed: {e}").ok();
                }
            },
            other => {
                writeln!(output, "*** unknown command {other}").ok();
            }
        }
    }
}

fn set_filter(log: &LogReload, directive: &str) {
    if let Ok(filter) = EnvFilter::try_new(directive) {
        let _ = log.reload(filter);
    }
}

fn print_help<W: Write>(output: &mut W) {
    writeln!(
        output,
        "commands: addr, info, router <hwaddr>, state, dump, expire <secs>, debug, nodebug, help, exit"
    )
    .ok();
}

fn print_addr<W: Write>(output: &mut W, ring: &PortRing) {
    for port in &ring.ports {
        let table = port.addr_table.lock();
        writeln!(output, "{}: {} entries", port.name, table.live_count()).ok();
        for entry in table.snapshot() {
            writeln!(output, "  {} (last seen {})", entry.addr, entry.time).ok();
        }
    }
}

fn print_info<W: Write>(output: &mut W, ring: &PortRing) {
    for port in &ring.ports {
        let peer = port.peer.lock();
        writeln!(
            output,
            "{}: hwclient={} ({}), hwrouter={} (valid={})",
            port.name, peer.hwclient, peer.hwclient_valid, peer.hwrouter, peer.router_valid
        )
        .ok();
    }
}

fn print_state<W: Write>(output: &mut W, ring: &PortRing) {
    writeln!(output, "{} active flows", ring.state.lock().live_count()).ok();
}

fn dump_to_file(ring: &PortRing, path: &str) -> std::io::Result<()> {
    let snapshot = dump_snapshot(ring);
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(path, json)
}
