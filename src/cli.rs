//! Command-line argument surface, mirroring the historical `-a/-d/-i/-o/-r/-w`
//! flags.

use clap::Parser;

use crate::config::EndoorConfig;
use crate::mac::MacAddr;

#[derive(Debug, Parser)]
#[command(name = "endoor", about = "Transparent layer-2 traffic-stealing bridge")]
pub struct Args {
    /// Path to a JSON configuration file.
    #[arg(long)]
    pub config: Option<String>,

    /// Maximum age of learned addresses, in seconds. 0 means infinity.
    #[arg(short = 'a', long = "max-age")]
    pub max_age: Option<u64>,

    /// Output debug-level logging.
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Name of the inside (client-facing) interface.
    #[arg(short = 'i', long = "inside")]
    pub inside: Option<String>,

    /// Name of the outside (router-facing) interface.
    #[arg(short = 'o', long = "outside")]
    pub outside: Option<String>,

    /// Pin the router's hardware address instead of learning it.
    #[arg(short = 'r', long = "router")]
    pub router: Option<MacAddr>,

    /// Write captured packets to this pcap file.
    #[arg(short = 'w', long = "pcap")]
    pub pcap: Option<String>,
}

impl Args {
    /// Flags always win over the loaded (or default) config; unset flags
    /// leave the underlying value untouched.
    pub fn apply(&self, mut config: EndoorConfig) -> EndoorConfig {
        if let Some(age) = self.max_age {
            config.max_age_secs = age;
        }
        if self.debug {
            config.debug = true;
        }
        if let Some(inside) = &self.inside {
            config.inside_ifname = inside.clone();
        }
        if let Some(outside) = &self.outside {
            config.outside_ifname = outside.clone();
        }
        if let Some(router) = self.router {
            config.pinned_router_mac = Some(router);
        }
        if let Some(pcap) = &self.pcap {
            config.pcap_path = Some(pcap.clone());
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_defaults() {
        let args = Args {
            config: None,
            max_age: Some(60),
            debug: true,
            inside: Some("eth2".into()),
            outside: None,
            router: None,
            pcap: None,
        };
        let cfg = args.apply(EndoorConfig::default());
        assert_eq!(cfg.max_age_secs, 60);
        assert!(cfg.debug);
        assert_eq!(cfg.inside_ifname, "eth2");
        // outside was not set on the CLI, default value passes through
        assert_eq!(cfg.outside_ifname, "eth0");
    }
}
