//! OpenDPS device client

use crate::config::ConnectionConfig;
use crate::error::DeviceError;
use dps_protocol::commands::{ParameterStatus, Screen, UpgradeStatus, WifiStatus};
use dps_protocol::types::{
    decode_function_list, decode_parameter_statuses, CalibrationReport, OcpEvent, ParameterList,
    QueryResponse, ResponseHeader, UpgradeStartResponse, VersionInfo,
};
use dps_protocol::{transport, CommandId, FrameReader, Request, Transport};
use std::time::Duration;
use tokio::sync::broadcast;

/// Unsolicited messages from the device
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Output was cut by the over-current protection
    OverCurrent(OcpEvent),
}

/// A connected OpenDPS device
///
/// Every call is one request followed by one reply. Nothing is retried.
pub struct DpsDevice {
    transport: Box<dyn Transport>,
    timeout: Duration,
    event_tx: broadcast::Sender<DeviceEvent>,
}

impl DpsDevice {
    /// Wrap an already open transport
    pub fn new(transport: Box<dyn Transport>, timeout: Duration) -> Self {
        let (event_tx, _) = broadcast::channel(16);
        Self {
            transport,
            timeout,
            event_tx,
        }
    }

    /// Open the endpoint named by the configuration
    pub async fn connect(config: &ConnectionConfig) -> Result<Self, DeviceError> {
        let endpoint = config.endpoint()?;
        tracing::info!("Communicating with {}", endpoint);
        let transport = transport::open(&endpoint).await?;
        Ok(Self::new(transport, config.timeout))
    }

    /// Subscribe to unsolicited device events
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.event_tx.subscribe()
    }

    pub async fn close(&mut self) -> Result<(), DeviceError> {
        self.transport.close().await?;
        Ok(())
    }

    /// Send a request and read its reply
    ///
    /// Over-current events that arrive ahead of the reply are published to
    /// subscribers and skipped.
    pub async fn exchange(
        &mut self,
        request: &Request<'_>,
        timeout: Duration,
    ) -> Result<(ResponseHeader, FrameReader), DeviceError> {
        let frame = request.to_frame();
        tracing::debug!("TX {:2} bytes {:02X?}", frame.len(), frame.bytes());
        self.transport.send(frame.bytes()).await?;

        loop {
            let raw = self.transport.receive(timeout).await?;
            tracing::debug!("RX {:2} bytes {:02X?}", raw.len(), &raw);

            let mut reader = FrameReader::from_received(&raw)?;
            if reader.remaining().first() == Some(&(CommandId::OcpEvent as u8)) {
                let event = OcpEvent::decode(&mut reader)?;
                tracing::warn!("Over-current protection tripped at {} mA", event.i_cut_ma);
                let _ = self.event_tx.send(DeviceEvent::OverCurrent(event));
                continue;
            }

            let header = ResponseHeader::decode(&mut reader, request.command_id())?;
            return Ok((header, reader));
        }
    }

    /// Exchange and fail if the device reports failure
    async fn command(&mut self, request: &Request<'_>) -> Result<FrameReader, DeviceError> {
        let (header, reader) = self.exchange(request, self.timeout).await?;
        if !header.success() {
            return Err(DeviceError::CommandFailed(request.command_id()));
        }
        Ok(reader)
    }

    pub async fn ping(&mut self) -> Result<(), DeviceError> {
        self.command(&Request::Ping).await?;
        Ok(())
    }

    /// Read input and output readings, the active function and its parameters
    pub async fn query(&mut self) -> Result<QueryResponse, DeviceError> {
        let mut reader = self.command(&Request::Query).await?;
        Ok(QueryResponse::decode(&mut reader)?)
    }

    pub async fn wifi_status(&mut self, status: WifiStatus) -> Result<(), DeviceError> {
        self.command(&Request::WifiStatus(status)).await?;
        Ok(())
    }

    /// Lock or unlock the front panel keys
    pub async fn lock(&mut self, locked: bool) -> Result<(), DeviceError> {
        self.command(&Request::Lock(locked)).await?;
        Ok(())
    }

    pub async fn set_function(&mut self, name: &str) -> Result<(), DeviceError> {
        self.command(&Request::SetFunction(name)).await?;
        Ok(())
    }

    pub async fn enable_output(&mut self, enable: bool) -> Result<(), DeviceError> {
        self.command(&Request::EnableOutput(enable)).await?;
        Ok(())
    }

    pub async fn list_functions(&mut self) -> Result<Vec<String>, DeviceError> {
        let mut reader = self.command(&Request::ListFunctions).await?;
        Ok(decode_function_list(&mut reader))
    }

    /// Set parameters of the active function, one status per pair in order
    pub async fn set_parameters(
        &mut self,
        params: &[(String, String)],
    ) -> Result<Vec<ParameterStatus>, DeviceError> {
        let mut reader = self.command(&Request::SetParameters(params)).await?;
        Ok(decode_parameter_statuses(&mut reader)?)
    }

    pub async fn list_parameters(&mut self) -> Result<ParameterList, DeviceError> {
        let mut reader = self.command(&Request::ListParameters).await?;
        Ok(ParameterList::decode(&mut reader)?)
    }

    /// Report external temperatures in tenths of a degree
    pub async fn temperature_report(
        &mut self,
        temp1: Option<i16>,
        temp2: Option<i16>,
    ) -> Result<(), DeviceError> {
        self.command(&Request::TemperatureReport(temp1, temp2))
            .await?;
        Ok(())
    }

    pub async fn version(&mut self) -> Result<VersionInfo, DeviceError> {
        let mut reader = self.command(&Request::Version).await?;
        Ok(VersionInfo::decode(&mut reader))
    }

    pub async fn calibration_report(&mut self) -> Result<CalibrationReport, DeviceError> {
        let mut reader = self.command(&Request::CalibrationReport).await?;
        Ok(CalibrationReport::decode(&mut reader)?)
    }

    pub async fn set_calibration(
        &mut self,
        values: &[(String, f32)],
    ) -> Result<Vec<ParameterStatus>, DeviceError> {
        let mut reader = self.command(&Request::SetCalibration(values)).await?;
        Ok(decode_parameter_statuses(&mut reader)?)
    }

    pub async fn clear_calibration(&mut self) -> Result<(), DeviceError> {
        self.command(&Request::ClearCalibration).await?;
        Ok(())
    }

    pub async fn change_screen(&mut self, screen: Screen) -> Result<(), DeviceError> {
        self.command(&Request::ChangeScreen(screen)).await?;
        Ok(())
    }

    /// Set backlight brightness in percent
    pub async fn set_brightness(&mut self, percent: u8) -> Result<(), DeviceError> {
        self.command(&Request::SetBrightness(percent)).await?;
        Ok(())
    }

    /// Ask the device to enter its bootloader and prepare for an image
    ///
    /// The reply status is an upgrade status, not a success flag.
    pub async fn upgrade_start(
        &mut self,
        chunk_size: u16,
        crc: u16,
        timeout: Duration,
    ) -> Result<UpgradeStartResponse, DeviceError> {
        let (header, mut reader) = self
            .exchange(&Request::UpgradeStart { chunk_size, crc }, timeout)
            .await?;
        Ok(UpgradeStartResponse::decode(&header, &mut reader)?)
    }

    /// Send one image chunk, an empty chunk marks the end of the image
    pub async fn upgrade_data(&mut self, chunk: &[u8]) -> Result<UpgradeStatus, DeviceError> {
        let (header, _) = self
            .exchange(&Request::UpgradeData(chunk), self.timeout)
            .await?;
        Ok(UpgradeStatus::from(header.status))
    }
}
