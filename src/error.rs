//! Error taxonomy

use thiserror::Error;

/// Errors surfaced by the core and its ambient stack.
#[derive(Debug, Error)]
pub enum EndoorError {
    #[error("network error: {0}")]
    Network(String),
    #[error("tunnel error: {0}")]
    Tunnel(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("capacity exhausted: {0}")]
    Capacity(String),
}

/// Why a frame could not be classified into a state-table key.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("frame too short")]
    TooShort,
    #[error("unsupported ethertype 0x{0:04x}")]
    UnsupportedEtherType(u16),
    #[error("unsupported l4 protocol {0}")]
    UnsupportedProto(u8),
    #[error("not an ip packet")]
    NotIp,
}
