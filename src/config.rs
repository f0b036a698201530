//! Endoor configuration: loaded from a JSON file, overridable by CLI flags.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::error::EndoorError;
use crate::mac::MacAddr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndoorConfig {
    pub inside_ifname: String,
    pub outside_ifname: String,
    pub pcap_path: Option<String>,
    pub pinned_router_mac: Option<MacAddr>,
    pub max_age_secs: u64,
    pub debug: bool,
    pub http_bind: Option<SocketAddr>,
}

impl Default for EndoorConfig {
    fn default() -> Self {
        Self {
            inside_ifname: "eth1".into(),
            outside_ifname: "eth0".into(),
            pcap_path: None,
            pinned_router_mac: None,
            max_age_secs: 120,
            debug: false,
            http_bind: Some("0.0.0.0:8080".parse().unwrap()),
        }
    }
}

impl EndoorConfig {
    pub fn load(path: &str) -> Result<Self, EndoorError> {
        let content = std::fs::read_to_string(path).map_err(|e| EndoorError::Config(e.to_string()))?;
        serde_json::from_str(&content).map_err(|e| EndoorError::Config(e.to_string()))
    }

    pub fn save(&self, path: &str) -> Result<(), EndoorError> {
        let content = serde_json::to_string_pretty(self).map_err(|e| EndoorError::Config(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| EndoorError::Config(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_historical_interface_names() {
        let cfg = EndoorConfig::default();
        assert_eq!(cfg.outside_ifname, "eth0");
        assert_eq!(cfg.inside_ifname, "eth1");
        assert_eq!(cfg.max_age_secs, 120);
    }

    #[test]
    fn missing_file_is_a_config_error_not_a_panic() {
        let err = EndoorConfig::load("/nonexistent/endoor.json");
        assert!(matches!(err, Err(EndoorError::Config(_))));
    }
}
