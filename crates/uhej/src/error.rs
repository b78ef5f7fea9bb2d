//! Discovery errors

use thiserror::Error;

/// A datagram that is not a valid discovery frame
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IllegalFrame {
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),

    #[error("unknown frame type {0}")]
    UnknownType(u8),

    #[error("frame ended early")]
    Truncated,

    #[error("string field is not NUL terminated")]
    UnterminatedString,
}

/// Failures setting up a scan
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to bind discovery socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),
}
