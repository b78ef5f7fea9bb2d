//! Device client errors

use dps_protocol::{CommandId, ProtocolError};
use thiserror::Error;

/// Errors from a command exchange with a device
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Command {0:?} failed according to device")]
    CommandFailed(CommandId),

    #[error("Configuration error: {0}")]
    Config(String),
}
