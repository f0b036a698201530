//! Endoor: a transparent layer-2 traffic-stealing bridge.
//!
//! Three interface agents run independent receive loops, bridging frames
//! between an "outside" (router-facing) port, an "inside" (client-facing)
//! port, and a virtual tunnel port. A passive address table learns the
//! router's and client's hardware/protocol addresses purely by observing
//! ARP and ICMPv6-ND traffic; a state table correlates tunnel-originated
//! flows with their replies so the outside port can divert them back into
//! the tunnel instead of bridging them to the client.

#![warn(missing_docs)]
#![allow(dead_code)]

pub mod addr_table;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod frame;
pub mod mac;
pub mod maintainer;
pub mod pcap;
pub mod platform;
pub mod port;
pub mod state_table;
pub mod status;

pub use config::EndoorConfig;
pub use error::EndoorError;
