//! Protocol errors and decoded device responses

use serde::Serialize;
use thiserror::Error;

use crate::commands::{
    decode_temperature, CommandId, ParameterStatus, SiPrefix, Unit, UpgradeReason,
    UpgradeStatus, RESPONSE_FLAG,
};
use crate::frame::FrameReader;

/// Protocol errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("Received data has no framing")]
    NotFramed,

    #[error("CRC mismatch: expected {expected:04X}, got {actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    #[error("Payload truncated: needed {needed} bytes, {remaining} left")]
    Truncated { needed: usize, remaining: usize },

    #[error("Expected a response frame, got command byte {0:#04X}")]
    UnexpectedResponse(u8),

    #[error("Timeout talking to device")]
    DeviceTimeout,

    #[error("Transport not connected")]
    NotConnected,

    #[error("Invalid device endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Numeric code for frame decode failures (1 length, 2 framing, 3 CRC)
    #[must_use]
    pub fn code(&self) -> Option<u8> {
        match self {
            ProtocolError::FrameTooShort(_) => Some(1),
            ProtocolError::NotFramed => Some(2),
            ProtocolError::CrcMismatch { .. } => Some(3),
            _ => None,
        }
    }
}

/// The two bytes every response starts with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Command byte with the response flag cleared
    pub command: u8,
    /// Success flag, or the upgrade status for upgrade commands
    pub status: u8,
    /// Whether `command` matched the id of the request that was sent
    pub matches_request: bool,
}

impl ResponseHeader {
    /// Read the response header for a request of type `request`
    ///
    /// An id mismatch is logged and recorded, not treated as an error; the
    /// caller decides whether it matters.
    pub fn decode(reader: &mut FrameReader, request: CommandId) -> Result<Self, ProtocolError> {
        let raw = reader.unpack8()?;
        if raw & RESPONSE_FLAG == 0 {
            return Err(ProtocolError::UnexpectedResponse(raw));
        }
        let command = raw & !RESPONSE_FLAG;
        let status = reader.unpack8()?;

        let matches_request = command == request as u8;
        if !matches_request {
            tracing::warn!(
                "Sent command {:02x}, response was {:02x}",
                request as u8,
                command
            );
        }

        Ok(Self {
            command,
            status,
            matches_request,
        })
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status != 0
    }
}

/// A function parameter and its current value, as text
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterValue {
    pub name: String,
    pub value: String,
}

/// Response to the query command
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResponse {
    pub v_in_mv: u16,
    pub v_out_mv: u16,
    pub i_out_ma: u16,
    pub output_enabled: bool,
    /// Tenths of a degree
    pub temp1: Option<i16>,
    /// Tenths of a degree
    pub temp2: Option<i16>,
    pub temp_shutdown: bool,
    pub function: String,
    pub parameters: Vec<ParameterValue>,
}

impl QueryResponse {
    pub fn decode(reader: &mut FrameReader) -> Result<Self, ProtocolError> {
        let v_in_mv = reader.unpack16()?;
        let v_out_mv = reader.unpack16()?;
        let i_out_ma = reader.unpack16()?;
        let output_enabled = reader.unpack8()? != 0;
        let temp1 = decode_temperature(reader.unpack16()?);
        let temp2 = decode_temperature(reader.unpack16()?);
        let temp_shutdown = reader.unpack8()? != 0;
        let function = reader.unpack_cstr();

        let mut parameters = Vec::new();
        while !reader.at_end() {
            let name = reader.unpack_cstr();
            let value = reader.unpack_cstr();
            parameters.push(ParameterValue { name, value });
        }

        Ok(Self {
            v_in_mv,
            v_out_mv,
            i_out_ma,
            output_enabled,
            temp1,
            temp2,
            temp_shutdown,
            function,
            parameters,
        })
    }
}

/// Response to upgrade-start, sent by the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct UpgradeStartResponse {
    pub status: UpgradeStatus,
    /// Chunk size the device will accept, may differ from the proposal
    pub chunk_size: u16,
    pub reason: UpgradeReason,
}

impl UpgradeStartResponse {
    pub fn decode(header: &ResponseHeader, reader: &mut FrameReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            status: UpgradeStatus::from(header.status),
            chunk_size: reader.unpack16()?,
            reason: UpgradeReason::from(reader.unpack8()?),
        })
    }
}

/// Names of the functions the device supports
pub fn decode_function_list(reader: &mut FrameReader) -> Vec<String> {
    let mut names = Vec::new();
    while !reader.at_end() {
        let name = reader.unpack_cstr();
        if name.is_empty() {
            break;
        }
        names.push(name);
    }
    names
}

/// Description of one parameter of the active function
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterInfo {
    pub name: String,
    pub unit: Unit,
    pub prefix: SiPrefix,
}

/// Response to list-parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ParameterList {
    pub function: String,
    pub parameters: Vec<ParameterInfo>,
}

impl ParameterList {
    pub fn decode(reader: &mut FrameReader) -> Result<Self, ProtocolError> {
        let function = reader.unpack_cstr();
        let mut parameters = Vec::new();
        while !reader.at_end() {
            let name = reader.unpack_cstr();
            let unit = Unit::from(reader.unpack8()?);
            let prefix = SiPrefix::from(reader.unpack8()?);
            parameters.push(ParameterInfo { name, unit, prefix });
        }
        Ok(Self {
            function,
            parameters,
        })
    }
}

/// One status byte per item of a set-parameters or set-calibration request
pub fn decode_parameter_statuses(reader: &mut FrameReader) -> Result<Vec<ParameterStatus>, ProtocolError> {
    let mut statuses = Vec::new();
    while !reader.at_end() {
        statuses.push(ParameterStatus::from(reader.unpack8()?));
    }
    Ok(statuses)
}

/// Git hashes of the bootloader and application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionInfo {
    pub boot_git_hash: String,
    pub app_git_hash: String,
}

impl VersionInfo {
    pub fn decode(reader: &mut FrameReader) -> Self {
        Self {
            boot_git_hash: reader.unpack_cstr(),
            app_git_hash: reader.unpack_cstr(),
        }
    }
}

/// Raw converter readings and calibration coefficients
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CalibrationReport {
    pub vout_adc: u16,
    pub vin_adc: u16,
    pub iout_adc: u16,
    pub iout_dac: u16,
    pub vout_dac: u16,
    pub a_adc_k: f32,
    pub a_adc_c: f32,
    pub a_dac_k: f32,
    pub a_dac_c: f32,
    pub v_adc_k: f32,
    pub v_adc_c: f32,
    pub v_dac_k: f32,
    pub v_dac_c: f32,
    pub vin_adc_k: f32,
    pub vin_adc_c: f32,
}

impl CalibrationReport {
    pub fn decode(reader: &mut FrameReader) -> Result<Self, ProtocolError> {
        Ok(Self {
            vout_adc: reader.unpack16()?,
            vin_adc: reader.unpack16()?,
            iout_adc: reader.unpack16()?,
            iout_dac: reader.unpack16()?,
            vout_dac: reader.unpack16()?,
            a_adc_k: reader.unpack_f32()?,
            a_adc_c: reader.unpack_f32()?,
            a_dac_k: reader.unpack_f32()?,
            a_dac_c: reader.unpack_f32()?,
            v_adc_k: reader.unpack_f32()?,
            v_adc_c: reader.unpack_f32()?,
            v_dac_k: reader.unpack_f32()?,
            v_dac_c: reader.unpack_f32()?,
            vin_adc_k: reader.unpack_f32()?,
            vin_adc_c: reader.unpack_f32()?,
        })
    }
}

/// Over-current protection event, sent unsolicited by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OcpEvent {
    /// Current that tripped the protection
    pub i_cut_ma: u16,
}

impl OcpEvent {
    pub fn decode(reader: &mut FrameReader) -> Result<Self, ProtocolError> {
        let cmd = reader.unpack8()?;
        if cmd != CommandId::OcpEvent as u8 {
            return Err(ProtocolError::UnexpectedResponse(cmd));
        }
        Ok(Self {
            i_cut_ma: reader.unpack16()?,
        })
    }
}

/// Format millivolts as `V.VV`
#[must_use]
pub fn format_millivolts(mv: u16) -> String {
    format!("{}.{:02}", mv / 1000, (mv % 1000) / 10)
}

/// Format milliamperes as `A.AAA`
#[must_use]
pub fn format_milliamps(ma: u16) -> String {
    format!("{}.{:03}", ma / 1000, ma % 1000)
}

/// Format tenths of a degree as `T.T`
#[must_use]
pub fn format_temperature(deci: i16) -> String {
    let sign = if deci < 0 { "-" } else { "" };
    let abs = deci.unsigned_abs();
    format!("{sign}{}.{}", abs / 10, abs % 10)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameBuilder;

    fn response(build: impl FnOnce(&mut FrameBuilder)) -> FrameReader {
        let mut f = FrameBuilder::new();
        build(&mut f);
        FrameReader::from_received(f.end().bytes()).unwrap()
    }

    #[test]
    fn test_header_matches() {
        let mut reader = response(|f| {
            f.pack8(0x81).pack8(1);
        });
        let header = ResponseHeader::decode(&mut reader, CommandId::Ping).unwrap();
        assert_eq!(header.command, 1);
        assert!(header.success());
        assert!(header.matches_request);
    }

    #[test]
    fn test_header_mismatch_is_not_fatal() {
        let mut reader = response(|f| {
            f.pack8(0x84).pack8(0);
        });
        let header = ResponseHeader::decode(&mut reader, CommandId::Ping).unwrap();
        assert_eq!(header.command, 4);
        assert!(!header.matches_request);
        assert!(!header.success());
    }

    #[test]
    fn test_header_without_response_flag() {
        let mut reader = response(|f| {
            f.pack8(0x08).pack16(1200);
        });
        assert!(matches!(
            ResponseHeader::decode(&mut reader, CommandId::Query),
            Err(ProtocolError::UnexpectedResponse(0x08))
        ));
    }

    #[test]
    fn test_query_response() {
        let mut reader = response(|f| {
            f.pack8(0x84)
                .pack8(1)
                .pack16(12_340)
                .pack16(5_000)
                .pack16(1_250)
                .pack8(1)
                .pack16(0xFFF6)
                .pack16(0xFFFF)
                .pack8(0)
                .pack_cstr("cv")
                .pack_cstr("voltage")
                .pack_cstr("5000")
                .pack_cstr("current")
                .pack_cstr("1000");
        });
        let header = ResponseHeader::decode(&mut reader, CommandId::Query).unwrap();
        assert!(header.success());

        let query = QueryResponse::decode(&mut reader).unwrap();
        assert_eq!(query.v_in_mv, 12_340);
        assert_eq!(query.v_out_mv, 5_000);
        assert_eq!(query.i_out_ma, 1_250);
        assert!(query.output_enabled);
        assert_eq!(query.temp1, Some(-10));
        assert_eq!(query.temp2, None);
        assert!(!query.temp_shutdown);
        assert_eq!(query.function, "cv");
        assert_eq!(
            query.parameters,
            vec![
                ParameterValue {
                    name: "voltage".into(),
                    value: "5000".into()
                },
                ParameterValue {
                    name: "current".into(),
                    value: "1000".into()
                },
            ]
        );
    }

    #[test]
    fn test_query_response_truncated() {
        let mut reader = response(|f| {
            f.pack16(12_340).pack16(5_000);
        });
        assert!(matches!(
            QueryResponse::decode(&mut reader),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_function_list() {
        let mut reader = response(|f| {
            f.pack_cstr("cv").pack_cstr("cc").pack_cstr("cl");
        });
        assert_eq!(decode_function_list(&mut reader), vec!["cv", "cc", "cl"]);
    }

    #[test]
    fn test_function_list_stops_at_empty_name() {
        let mut reader = response(|f| {
            f.pack_cstr("cv").pack_cstr("").pack_cstr("junk");
        });
        assert_eq!(decode_function_list(&mut reader), vec!["cv"]);
    }

    #[test]
    fn test_parameter_list() {
        let mut reader = response(|f| {
            f.pack_cstr("cv")
                .pack_cstr("voltage")
                .pack8(2)
                .pack8((-3i8) as u8)
                .pack_cstr("current")
                .pack8(1)
                .pack8((-3i8) as u8)
                .pack_cstr("furlongs")
                .pack8(6)
                .pack8(7);
        });
        let list = ParameterList::decode(&mut reader).unwrap();
        assert_eq!(list.function, "cv");
        assert_eq!(list.parameters.len(), 3);
        assert_eq!(list.parameters[0].unit, Unit::Volt);
        assert_eq!(list.parameters[0].prefix, SiPrefix::Milli);
        assert_eq!(list.parameters[1].unit, Unit::Ampere);
        assert_eq!(list.parameters[2].unit.name(), "unknown");
        assert_eq!(list.parameters[2].prefix.name(), "e7");
    }

    #[test]
    fn test_parameter_list_truncated_triple() {
        let mut reader = response(|f| {
            f.pack_cstr("cv").pack_cstr("voltage").pack8(2);
        });
        assert!(matches!(
            ParameterList::decode(&mut reader),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_parameter_statuses_in_order() {
        let mut reader = response(|f| {
            f.pack8(1).pack8(3).pack8(2);
        });
        assert_eq!(
            decode_parameter_statuses(&mut reader).unwrap(),
            vec![
                ParameterStatus::Ok,
                ParameterStatus::IllegalValue,
                ParameterStatus::UnknownParameter
            ]
        );
    }

    #[test]
    fn test_upgrade_start_response() {
        let mut reader = response(|f| {
            f.pack8(0x89).pack8(0).pack16(512).pack8(3);
        });
        let header = ResponseHeader::decode(&mut reader, CommandId::UpgradeStart).unwrap();
        let resp = UpgradeStartResponse::decode(&header, &mut reader).unwrap();
        assert_eq!(resp.status, UpgradeStatus::Continue);
        assert_eq!(resp.chunk_size, 512);
        assert_eq!(resp.reason, UpgradeReason::Bootcom);
    }

    #[test]
    fn test_version_info() {
        let mut reader = response(|f| {
            f.pack_cstr("abc123").pack_cstr("def456");
        });
        let version = VersionInfo::decode(&mut reader);
        assert_eq!(version.boot_git_hash, "abc123");
        assert_eq!(version.app_git_hash, "def456");
    }

    #[test]
    fn test_calibration_report() {
        let coefficients: [f32; 10] = [1.0, -2.5, 0.5, 0.0, 16.1, -0.25, 3.0, 7.75, 12.5, 100.0];
        let mut reader = response(|f| {
            f.pack16(100).pack16(200).pack16(300).pack16(400).pack16(500);
            for c in coefficients {
                f.pack32(c.to_bits());
            }
        });
        let cal = CalibrationReport::decode(&mut reader).unwrap();
        assert_eq!(cal.vout_adc, 100);
        assert_eq!(cal.vin_adc, 200);
        assert_eq!(cal.iout_adc, 300);
        assert_eq!(cal.iout_dac, 400);
        assert_eq!(cal.vout_dac, 500);
        assert_eq!(cal.a_adc_k, 1.0);
        assert_eq!(cal.a_adc_c, -2.5);
        assert_eq!(cal.v_adc_k, 16.1);
        assert_eq!(cal.v_dac_c, 7.75);
        assert_eq!(cal.vin_adc_c, 100.0);
        assert!(reader.at_end());
    }

    #[test]
    fn test_ocp_event() {
        let mut reader = response(|f| {
            f.pack8(8).pack16(5100);
        });
        assert_eq!(OcpEvent::decode(&mut reader).unwrap().i_cut_ma, 5100);
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(ProtocolError::FrameTooShort(2).code(), Some(1));
        assert_eq!(ProtocolError::NotFramed.code(), Some(2));
        assert_eq!(
            ProtocolError::CrcMismatch {
                expected: 1,
                actual: 2
            }
            .code(),
            Some(3)
        );
        assert_eq!(ProtocolError::DeviceTimeout.code(), None);
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format_millivolts(12_345), "12.34");
        assert_eq!(format_millivolts(5_000), "5.00");
        assert_eq!(format_milliamps(1_005), "1.005");
        assert_eq!(format_temperature(-15), "-1.5");
        assert_eq!(format_temperature(253), "25.3");
    }
}
