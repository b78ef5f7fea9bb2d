//! OpenDPS command table and request builders

use std::fmt;

use serde::{Serialize, Serializer};

use crate::frame::{Frame, FrameBuilder};

/// Set on the command byte of every device response
pub const RESPONSE_FLAG: u8 = 0x80;

/// Command IDs for the OpenDPS serial protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum CommandId {
    Ping = 1,
    /// Retired, id kept so the numbering stays in sync with the firmware
    SetVoutLegacy = 2,
    /// Retired, id kept so the numbering stays in sync with the firmware
    SetIlimitLegacy = 3,
    Query = 4,
    /// Retired, id kept so the numbering stays in sync with the firmware
    PowerEnableLegacy = 5,
    WifiStatus = 6,
    Lock = 7,
    /// Sent by the device when over-current protection trips
    OcpEvent = 8,
    UpgradeStart = 9,
    UpgradeData = 10,
    SetFunction = 11,
    EnableOutput = 12,
    ListFunctions = 13,
    SetParameters = 14,
    ListParameters = 15,
    TemperatureReport = 16,
    Version = 17,
    CalibrationReport = 18,
    SetCalibration = 19,
    ClearCalibration = 20,
    ChangeScreen = 21,
    SetBrightness = 22,
}

impl CommandId {
    #[must_use]
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(CommandId::Ping),
            2 => Some(CommandId::SetVoutLegacy),
            3 => Some(CommandId::SetIlimitLegacy),
            4 => Some(CommandId::Query),
            5 => Some(CommandId::PowerEnableLegacy),
            6 => Some(CommandId::WifiStatus),
            7 => Some(CommandId::Lock),
            8 => Some(CommandId::OcpEvent),
            9 => Some(CommandId::UpgradeStart),
            10 => Some(CommandId::UpgradeData),
            11 => Some(CommandId::SetFunction),
            12 => Some(CommandId::EnableOutput),
            13 => Some(CommandId::ListFunctions),
            14 => Some(CommandId::SetParameters),
            15 => Some(CommandId::ListParameters),
            16 => Some(CommandId::TemperatureReport),
            17 => Some(CommandId::Version),
            18 => Some(CommandId::CalibrationReport),
            19 => Some(CommandId::SetCalibration),
            20 => Some(CommandId::ClearCalibration),
            21 => Some(CommandId::ChangeScreen),
            22 => Some(CommandId::SetBrightness),
            _ => None,
        }
    }

    /// Command byte the device uses when answering this command
    #[must_use]
    pub fn response_id(self) -> u8 {
        self as u8 | RESPONSE_FLAG
    }
}

/// Wi-Fi indicator states shown on the device screen
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum WifiStatus {
    Off = 0,
    Connecting = 1,
    Connected = 2,
    Error = 3,
    /// Used by the Wi-Fi companion while it is being upgraded
    Upgrading = 4,
}

/// Status codes reported by the device during a firmware upgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeStatus {
    Continue,
    BootcomError,
    CrcError,
    EraseError,
    FlashError,
    OverflowError,
    /// Upgrade data arrived without a preceding upgrade start
    ProtocolError,
    Success,
    Unknown(u8),
}

impl From<u8> for UpgradeStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => UpgradeStatus::Continue,
            1 => UpgradeStatus::BootcomError,
            2 => UpgradeStatus::CrcError,
            3 => UpgradeStatus::EraseError,
            4 => UpgradeStatus::FlashError,
            5 => UpgradeStatus::OverflowError,
            6 => UpgradeStatus::ProtocolError,
            16 => UpgradeStatus::Success,
            v => UpgradeStatus::Unknown(v),
        }
    }
}

impl fmt::Display for UpgradeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeStatus::Continue => write!(f, "continue"),
            UpgradeStatus::BootcomError => write!(f, "bootloader communication error"),
            UpgradeStatus::CrcError => write!(f, "CRC error"),
            UpgradeStatus::EraseError => write!(f, "flash erase error"),
            UpgradeStatus::FlashError => write!(f, "flash write error"),
            UpgradeStatus::OverflowError => write!(f, "image would overflow flash"),
            UpgradeStatus::ProtocolError => write!(f, "upgrade protocol error"),
            UpgradeStatus::Success => write!(f, "success"),
            UpgradeStatus::Unknown(v) => write!(f, "unknown status {v}"),
        }
    }
}

/// Why the bootloader entered upgrade mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpgradeReason {
    Unknown,
    Forced,
    PastFailure,
    Bootcom,
    UnfinishedUpgrade,
    AppStartFailed,
    Other(u8),
}

impl From<u8> for UpgradeReason {
    fn from(value: u8) -> Self {
        match value {
            0 => UpgradeReason::Unknown,
            1 => UpgradeReason::Forced,
            2 => UpgradeReason::PastFailure,
            3 => UpgradeReason::Bootcom,
            4 => UpgradeReason::UnfinishedUpgrade,
            5 => UpgradeReason::AppStartFailed,
            v => UpgradeReason::Other(v),
        }
    }
}

/// Per-item result of set-parameters and set-calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterStatus {
    Ok,
    UnknownParameter,
    IllegalValue,
    Other(u8),
}

impl From<u8> for ParameterStatus {
    fn from(value: u8) -> Self {
        match value {
            1 => ParameterStatus::Ok,
            2 => ParameterStatus::UnknownParameter,
            3 => ParameterStatus::IllegalValue,
            v => ParameterStatus::Other(v),
        }
    }
}

/// Unit of a function parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Unitless,
    Ampere,
    Volt,
    Watt,
    Second,
    Hertz,
    Unknown(u8),
}

impl From<u8> for Unit {
    fn from(value: u8) -> Self {
        match value {
            0 => Unit::Unitless,
            1 => Unit::Ampere,
            2 => Unit::Volt,
            3 => Unit::Watt,
            4 => Unit::Second,
            5 => Unit::Hertz,
            v => Unit::Unknown(v),
        }
    }
}

impl Unit {
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Unit::Unitless => "unitless",
            Unit::Ampere => "ampere",
            Unit::Volt => "volt",
            Unit::Watt => "watt",
            Unit::Second => "second",
            Unit::Hertz => "hertz",
            Unit::Unknown(_) => "unknown",
        }
    }

    #[must_use]
    pub fn symbol(&self) -> &'static str {
        match self {
            Unit::Unitless => "",
            Unit::Ampere => "A",
            Unit::Volt => "V",
            Unit::Watt => "W",
            Unit::Second => "s",
            Unit::Hertz => "Hz",
            Unit::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for Unit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

/// SI prefix of a function parameter, sent as a signed power of ten
///
/// The firmware encodes mega as 4, not 6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SiPrefix {
    Micro,
    Milli,
    Centi,
    Deci,
    None,
    Deca,
    Hecto,
    Kilo,
    Mega,
    Other(i8),
}

impl From<u8> for SiPrefix {
    fn from(value: u8) -> Self {
        match value as i8 {
            -6 => SiPrefix::Micro,
            -3 => SiPrefix::Milli,
            -2 => SiPrefix::Centi,
            -1 => SiPrefix::Deci,
            0 => SiPrefix::None,
            1 => SiPrefix::Deca,
            2 => SiPrefix::Hecto,
            3 => SiPrefix::Kilo,
            4 => SiPrefix::Mega,
            v => SiPrefix::Other(v),
        }
    }
}

impl SiPrefix {
    #[must_use]
    pub fn name(&self) -> String {
        match self {
            SiPrefix::Micro => "micro".into(),
            SiPrefix::Milli => "milli".into(),
            SiPrefix::Centi => "centi".into(),
            SiPrefix::Deci => "deci".into(),
            SiPrefix::None => String::new(),
            SiPrefix::Deca => "deca".into(),
            SiPrefix::Hecto => "hecto".into(),
            SiPrefix::Kilo => "kilo".into(),
            SiPrefix::Mega => "mega".into(),
            SiPrefix::Other(e) => format!("e{e}"),
        }
    }

    #[must_use]
    pub fn symbol(&self) -> String {
        match self {
            SiPrefix::Micro => "u".into(),
            SiPrefix::Milli => "m".into(),
            SiPrefix::Centi => "c".into(),
            SiPrefix::Deci => "d".into(),
            SiPrefix::None => String::new(),
            SiPrefix::Deca => "da".into(),
            SiPrefix::Hecto => "h".into(),
            SiPrefix::Kilo => "k".into(),
            SiPrefix::Mega => "M".into(),
            SiPrefix::Other(e) => format!("e{e}"),
        }
    }
}

impl fmt::Display for SiPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for SiPrefix {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

/// Screens selectable with change-screen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Screen {
    /// The active function's screen
    Main = 0,
    Settings = 1,
}

/// Temperature reading sent when no sensor value is available
pub const INVALID_TEMPERATURE: u16 = 0xFFFF;

/// A host-to-device request
///
/// Each variant maps to one command id and a fixed payload layout.
#[derive(Debug, Clone, PartialEq)]
pub enum Request<'a> {
    Ping,
    Query,
    WifiStatus(WifiStatus),
    Lock(bool),
    UpgradeStart { chunk_size: u16, crc: u16 },
    UpgradeData(&'a [u8]),
    SetFunction(&'a str),
    EnableOutput(bool),
    ListFunctions,
    /// `(name, value)` pairs, both sent as text
    SetParameters(&'a [(String, String)]),
    ListParameters,
    /// Two readings in tenths of a degree, `None` when absent
    ///
    /// -0.1 °C shares its wire value with the absent sentinel, so it is sent
    /// as -0.2 °C.
    TemperatureReport(Option<i16>, Option<i16>),
    Version,
    CalibrationReport,
    SetCalibration(&'a [(String, f32)]),
    ClearCalibration,
    ChangeScreen(Screen),
    /// Backlight brightness in percent
    SetBrightness(u8),
}

impl Request<'_> {
    #[must_use]
    pub fn command_id(&self) -> CommandId {
        match self {
            Request::Ping => CommandId::Ping,
            Request::Query => CommandId::Query,
            Request::WifiStatus(_) => CommandId::WifiStatus,
            Request::Lock(_) => CommandId::Lock,
            Request::UpgradeStart { .. } => CommandId::UpgradeStart,
            Request::UpgradeData(_) => CommandId::UpgradeData,
            Request::SetFunction(_) => CommandId::SetFunction,
            Request::EnableOutput(_) => CommandId::EnableOutput,
            Request::ListFunctions => CommandId::ListFunctions,
            Request::SetParameters(_) => CommandId::SetParameters,
            Request::ListParameters => CommandId::ListParameters,
            Request::TemperatureReport(..) => CommandId::TemperatureReport,
            Request::Version => CommandId::Version,
            Request::CalibrationReport => CommandId::CalibrationReport,
            Request::SetCalibration(_) => CommandId::SetCalibration,
            Request::ClearCalibration => CommandId::ClearCalibration,
            Request::ChangeScreen(_) => CommandId::ChangeScreen,
            Request::SetBrightness(_) => CommandId::SetBrightness,
        }
    }

    /// Build the sealed frame for this request
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        let mut f = FrameBuilder::new();
        f.pack8(self.command_id() as u8);

        match self {
            Request::Ping
            | Request::Query
            | Request::ListFunctions
            | Request::ListParameters
            | Request::Version
            | Request::CalibrationReport
            | Request::ClearCalibration => {}
            Request::WifiStatus(status) => {
                f.pack8(*status as u8);
            }
            Request::Lock(locked) => {
                f.pack8(u8::from(*locked));
            }
            Request::UpgradeStart { chunk_size, crc } => {
                f.pack16(*chunk_size).pack16(*crc);
            }
            Request::UpgradeData(chunk) => {
                f.pack_bytes(chunk);
            }
            Request::SetFunction(name) => {
                f.pack_cstr(name);
            }
            Request::EnableOutput(enable) => {
                f.pack8(u8::from(*enable));
            }
            Request::SetParameters(params) => {
                for (name, value) in params.iter() {
                    f.pack_cstr(name).pack_cstr(value);
                }
            }
            Request::TemperatureReport(t1, t2) => {
                f.pack16(encode_temperature(*t1))
                    .pack16(encode_temperature(*t2));
            }
            Request::SetCalibration(values) => {
                for (name, value) in values.iter() {
                    f.pack_cstr(name).pack_f32_le(*value);
                }
            }
            Request::ChangeScreen(screen) => {
                f.pack8(*screen as u8);
            }
            Request::SetBrightness(percent) => {
                f.pack8(*percent);
            }
        }

        f.end()
    }
}

fn encode_temperature(value: Option<i16>) -> u16 {
    match value {
        None => INVALID_TEMPERATURE,
        Some(-1) => (-2i16) as u16,
        Some(t) => t as u16,
    }
}

/// Decode a wire temperature (tenths of a degree), `None` for the sentinel
#[must_use]
pub fn decode_temperature(raw: u16) -> Option<i16> {
    if raw == INVALID_TEMPERATURE {
        None
    } else {
        Some(raw as i16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameReader;

    fn payload(request: &Request<'_>) -> Vec<u8> {
        FrameReader::from_received(request.to_frame().bytes())
            .unwrap()
            .remaining()
            .to_vec()
    }

    #[test]
    fn test_command_id_roundtrip() {
        for id in 1..=22 {
            let cmd = CommandId::from_u8(id).unwrap();
            assert_eq!(cmd as u8, id);
        }
        assert!(CommandId::from_u8(0).is_none());
        assert!(CommandId::from_u8(23).is_none());
        assert_eq!(CommandId::Version.response_id(), 0x91);
    }

    #[test]
    fn test_ping_request() {
        assert_eq!(
            Request::Ping.to_frame().bytes(),
            &[0x7E, 0x01, 0x10, 0x21, 0x7F]
        );
    }

    #[test]
    fn test_upgrade_start_request() {
        let req = Request::UpgradeStart {
            chunk_size: 1024,
            crc: 0xBEEF,
        };
        assert_eq!(payload(&req), vec![9, 0x04, 0x00, 0xBE, 0xEF]);
    }

    #[test]
    fn test_set_parameters_request() {
        let params = vec![
            ("voltage".to_string(), "5000".to_string()),
            ("current".to_string(), "200".to_string()),
        ];
        let mut expected = vec![14];
        expected.extend_from_slice(b"voltage\x005000\x00current\x00200\x00");
        assert_eq!(payload(&Request::SetParameters(&params)), expected);
    }

    #[test]
    fn test_set_calibration_request() {
        let values = vec![("V_DAC_K".to_string(), 1.5f32)];
        let mut expected = vec![19];
        expected.extend_from_slice(b"V_DAC_K\x00");
        expected.extend_from_slice(&1.5f32.to_le_bytes());
        assert_eq!(payload(&Request::SetCalibration(&values)), expected);
    }

    #[test]
    fn test_temperature_report_request() {
        let req = Request::TemperatureReport(Some(-15), None);
        assert_eq!(payload(&req), vec![16, 0xFF, 0xF1, 0xFF, 0xFF]);
    }

    #[test]
    fn test_minus_tenth_does_not_collide_with_sentinel() {
        let req = Request::TemperatureReport(Some(-1), Some(0));
        assert_eq!(payload(&req), vec![16, 0xFF, 0xFE, 0x00, 0x00]);
        assert_eq!(decode_temperature(0xFFFE), Some(-2));
    }

    #[test]
    fn test_temperature_decode() {
        assert_eq!(decode_temperature(0xFFFF), None);
        assert_eq!(decode_temperature(0x00FA), Some(250));
        assert_eq!(decode_temperature(0xFFF1), Some(-15));
    }

    #[test]
    fn test_unit_and_prefix_tables() {
        assert_eq!(Unit::from(2).name(), "volt");
        assert_eq!(Unit::from(5).symbol(), "Hz");
        assert_eq!(Unit::from(6).name(), "unknown");
        assert_eq!(SiPrefix::from((-3i8) as u8), SiPrefix::Milli);
        assert_eq!(SiPrefix::from(4).symbol(), "M");
        assert_eq!(SiPrefix::from(9).name(), "e9");
        assert_eq!(SiPrefix::from((-9i8) as u8).symbol(), "e-9");
    }

    #[test]
    fn test_upgrade_status_codes() {
        assert_eq!(UpgradeStatus::from(0), UpgradeStatus::Continue);
        assert_eq!(UpgradeStatus::from(2), UpgradeStatus::CrcError);
        assert_eq!(UpgradeStatus::from(16), UpgradeStatus::Success);
        assert_eq!(UpgradeStatus::from(7), UpgradeStatus::Unknown(7));
    }
}
