//! Firmware upgrade engine
//!
//! Negotiates a chunk size with the bootloader, then streams the image one
//! chunk per upgrade-data command. Every status other than continue ends the
//! transfer; there is no retry and no resume.

use crate::device::DpsDevice;
use crate::error::DeviceError;
use dps_protocol::commands::UpgradeStatus;
use dps_protocol::crc16;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Chunk size proposed to the bootloader
pub const DEFAULT_CHUNK_SIZE: u16 = 1024;

/// Offset of the header marker byte in an application image
pub const HEADER_MARKER_OFFSET: usize = 3;

/// Expected header marker value
pub const HEADER_MARKER: u8 = 0x20;

/// Upgrade errors
#[derive(Error, Debug)]
pub enum UpgradeError {
    #[error("Invalid firmware image: {0}")]
    InvalidImage(String),

    #[error("Device rejected firmware upgrade ({0})")]
    Rejected(UpgradeStatus),

    #[error("Firmware upgrade failed at offset {offset}: {status}")]
    ChunkFailed { status: UpgradeStatus, offset: usize },

    #[error("Device never confirmed the upgrade")]
    Incomplete,

    #[error("No usable chunk size (proposed 0, device sent 0)")]
    ZeroChunkSize,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// Where the engine is in the transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeState {
    Idle,
    Negotiating,
    Transferring,
    Succeeded,
    Failed,
}

/// Transfer state between upgrade-start and the final status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpgradeSession {
    pub chunk_size: u16,
    pub offset: usize,
    pub last_status: UpgradeStatus,
}

/// Reported after every chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpgradeProgress {
    pub sent: usize,
    pub total: usize,
}

/// Summary of a finished upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpgradeReport {
    pub chunk_size: u16,
    pub chunks: usize,
    pub bytes: usize,
}

/// A firmware image and its CRC
#[derive(Debug, Clone)]
pub struct FirmwareImage {
    data: Vec<u8>,
    crc: u16,
}

impl FirmwareImage {
    /// Check the header marker unless `force` is set
    pub fn new(data: Vec<u8>, force: bool) -> Result<Self, UpgradeError> {
        if data.is_empty() {
            return Err(UpgradeError::InvalidImage("image is empty".to_string()));
        }
        if !force {
            match data.get(HEADER_MARKER_OFFSET) {
                Some(&HEADER_MARKER) => {}
                Some(other) => {
                    return Err(UpgradeError::InvalidImage(format!(
                        "unexpected header byte {other:#04x}, is this an OpenDPS image?"
                    )))
                }
                None => {
                    return Err(UpgradeError::InvalidImage(
                        "image shorter than its header".to_string(),
                    ))
                }
            }
        }
        let crc = crc16(&data);
        Ok(Self { data, crc })
    }

    pub async fn from_file(path: &Path, force: bool) -> Result<Self, UpgradeError> {
        let data = tokio::fs::read(path).await?;
        tracing::info!("Read {} bytes of firmware from {}", data.len(), path.display());
        Self::new(data, force)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[must_use]
    pub fn crc(&self) -> u16 {
        self.crc
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

/// Drives one upgrade over a device
#[derive(Debug)]
pub struct UpgradeEngine {
    state: UpgradeState,
    session: Option<UpgradeSession>,
    proposed_chunk_size: u16,
    start_timeout: Duration,
}

impl UpgradeEngine {
    pub fn new(proposed_chunk_size: u16, start_timeout: Duration) -> Self {
        Self {
            state: UpgradeState::Idle,
            session: None,
            proposed_chunk_size,
            start_timeout,
        }
    }

    #[must_use]
    pub fn state(&self) -> UpgradeState {
        self.state
    }

    /// Live session, cleared once the transfer ends
    #[must_use]
    pub fn session(&self) -> Option<&UpgradeSession> {
        self.session.as_ref()
    }

    /// Run the whole upgrade, calling `progress` after every chunk
    pub async fn run(
        &mut self,
        device: &mut DpsDevice,
        image: &FirmwareImage,
        mut progress: impl FnMut(UpgradeProgress),
    ) -> Result<UpgradeReport, UpgradeError> {
        let result = self.transfer(device, image, &mut progress).await;
        self.state = if result.is_ok() {
            UpgradeState::Succeeded
        } else {
            UpgradeState::Failed
        };
        self.session = None;
        result
    }

    async fn transfer(
        &mut self,
        device: &mut DpsDevice,
        image: &FirmwareImage,
        progress: &mut impl FnMut(UpgradeProgress),
    ) -> Result<UpgradeReport, UpgradeError> {
        self.state = UpgradeState::Negotiating;
        tracing::info!(
            "Starting upgrade: {} bytes, crc {:04x}, proposing chunk size {}",
            image.len(),
            image.crc(),
            self.proposed_chunk_size
        );

        let start = device
            .upgrade_start(self.proposed_chunk_size, image.crc(), self.start_timeout)
            .await?;
        if start.status != UpgradeStatus::Continue {
            tracing::error!("Upgrade start refused: {} (reason {:?})", start.status, start.reason);
            return Err(UpgradeError::Rejected(start.status));
        }

        let chunk_size = if start.chunk_size == 0 {
            tracing::warn!("Device sent chunk size 0, keeping {}", self.proposed_chunk_size);
            self.proposed_chunk_size
        } else {
            start.chunk_size
        };
        if chunk_size == 0 {
            tracing::error!("Neither side offered a non-zero chunk size");
            return Err(UpgradeError::ZeroChunkSize);
        }
        if chunk_size != self.proposed_chunk_size {
            tracing::info!("Device asked for chunk size {}", chunk_size);
        }

        self.state = UpgradeState::Transferring;
        self.session = Some(UpgradeSession {
            chunk_size,
            offset: 0,
            last_status: start.status,
        });

        let total = image.len();
        let mut offset = 0;
        let mut chunks = 0;

        for chunk in image.data().chunks(usize::from(chunk_size)) {
            let status = device.upgrade_data(chunk).await?;
            let chunk_offset = offset;
            offset += chunk.len();
            chunks += 1;
            self.record(offset, status);
            progress(UpgradeProgress { sent: offset, total });

            match status {
                UpgradeStatus::Continue => {}
                UpgradeStatus::Success => {
                    if offset < total {
                        tracing::warn!("Device reported success with {} bytes unsent", total - offset);
                    }
                    tracing::info!("Upgrade succeeded after {} chunks", chunks);
                    return Ok(UpgradeReport {
                        chunk_size,
                        chunks,
                        bytes: offset,
                    });
                }
                other => {
                    tracing::error!("Chunk at offset {} failed: {}", chunk_offset, other);
                    return Err(UpgradeError::ChunkFailed {
                        status: other,
                        offset: chunk_offset,
                    });
                }
            }
        }

        // An exact multiple of the chunk size gives the bootloader no short
        // chunk to end on, so send an empty one.
        if total % usize::from(chunk_size) == 0 {
            let status = device.upgrade_data(&[]).await?;
            chunks += 1;
            self.record(offset, status);
            progress(UpgradeProgress { sent: offset, total });
            match status {
                UpgradeStatus::Success => {
                    tracing::info!("Upgrade succeeded after {} chunks", chunks);
                    return Ok(UpgradeReport {
                        chunk_size,
                        chunks,
                        bytes: offset,
                    });
                }
                UpgradeStatus::Continue => {}
                other => {
                    tracing::error!("Terminating chunk failed: {}", other);
                    return Err(UpgradeError::ChunkFailed {
                        status: other,
                        offset,
                    });
                }
            }
        }

        Err(UpgradeError::Incomplete)
    }

    fn record(&mut self, offset: usize, status: UpgradeStatus) {
        if let Some(session) = self.session.as_mut() {
            session.offset = offset;
            session.last_status = status;
        }
    }
}

impl Default for UpgradeEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, crate::config::DEFAULT_UPGRADE_TIMEOUT)
    }
}
