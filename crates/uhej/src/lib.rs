//! uHej service discovery
//!
//! Codec for the uHej multicast discovery protocol and a scan that finds
//! OpenDPS devices announcing themselves on the local network.

pub mod error;
pub mod frame;
pub mod scan;

pub use error::{DiscoveryError, IllegalFrame};
pub use frame::{DiscoveryFrame, Hello, Service, ServiceType};
pub use scan::{scan, DiscoveryRecord, ScanConfig, ScanContext};
