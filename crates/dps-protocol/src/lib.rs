//! OpenDPS serial protocol
//!
//! Frame codec, command builders and response decoders for OpenDPS power
//! supplies, plus serial, UDP and TCP transports.

pub mod commands;
pub mod escape;
pub mod frame;
pub mod transport;
pub mod types;

pub use commands::{CommandId, Request};
pub use escape::FrameAssembler;
pub use frame::{crc16, Frame, FrameBuilder, FrameReader};
pub use transport::{Endpoint, Transport};
pub use types::*;
