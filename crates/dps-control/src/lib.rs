//! OpenDPS device control
//!
//! This crate provides a request/response client for OpenDPS power supplies
//! and the firmware upgrade engine, on top of the low-level protocol crate.

pub mod config;
pub mod device;
pub mod error;
pub mod upgrade;

#[cfg(test)]
mod mock;

pub use config::ConnectionConfig;
pub use device::{DeviceEvent, DpsDevice};
pub use error::DeviceError;
pub use upgrade::{FirmwareImage, UpgradeEngine, UpgradeError, UpgradeProgress, UpgradeState};
