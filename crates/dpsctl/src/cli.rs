use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[clap(name = "dpsctl")]
#[clap(about = "Instrument an OpenDPS device", long_about = None)]
#[clap(version)]
pub(crate) struct Cli {
    /// OpenDPS device to connect to: a tty path, an IPv4 address or
    /// tcp:<host>[:port]. Falls back to the DPSIF environment variable.
    #[clap(short, long, global = true)]
    pub device: Option<String>,

    /// Output results as JSON
    #[clap(short, long, global = true)]
    pub json: bool,

    /// Log every frame sent and received
    #[clap(short, long, global = true)]
    pub verbose: bool,

    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum OnOff {
    On,
    Off,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum ScreenArg {
    Main,
    Settings,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub(crate) enum WifiArg {
    Off,
    Connecting,
    Connected,
    Error,
    Upgrading,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Commands {
    /// Ping the device
    Ping,
    /// Read measurements, the active function and its parameters
    #[clap(alias = "status")]
    Query,
    /// Lock the front panel keys
    Lock,
    /// Unlock the front panel keys
    Unlock,
    /// Switch the output on or off
    Power {
        #[clap(value_enum)]
        state: OnOff,
    },
    /// Select the active function
    Function { name: String },
    /// List the functions the device supports
    Functions,
    /// List parameters of the active function
    Parameters,
    /// Set parameters of the active function
    Set {
        /// name=value pairs
        #[clap(required = true, value_parser = parse_pair)]
        params: Vec<(String, String)>,
    },
    /// Show bootloader and application versions
    Version,
    /// Show raw converter readings and calibration coefficients
    Calibration,
    /// Write calibration coefficients
    SetCalibration {
        /// name=value pairs, values are floating point
        #[clap(required = true, value_parser = parse_calibration)]
        values: Vec<(String, f32)>,
    },
    /// Reset calibration to factory defaults
    ClearCalibration,
    /// Report external temperatures in degrees Celsius
    Temperature {
        #[clap(long, allow_negative_numbers = true)]
        t1: Option<f32>,
        #[clap(long, allow_negative_numbers = true)]
        t2: Option<f32>,
    },
    /// Change the screen shown on the device
    Screen {
        #[clap(value_enum)]
        screen: ScreenArg,
    },
    /// Set backlight brightness in percent
    Brightness {
        #[clap(value_parser = clap::value_parser!(u8).range(0..=100))]
        percent: u8,
    },
    /// Set the Wi-Fi indicator
    Wifi {
        #[clap(value_enum)]
        status: WifiArg,
    },
    /// Upgrade the device firmware
    Upgrade {
        /// Firmware image (.bin)
        file: PathBuf,
        /// Skip the image header check
        #[clap(short, long)]
        force: bool,
        /// Chunk size to propose to the bootloader
        #[clap(
            long,
            default_value_t = dps_control::upgrade::DEFAULT_CHUNK_SIZE,
            value_parser = clap::value_parser!(u16).range(1..)
        )]
        chunk_size: u16,
    },
    /// Scan for OpenDPS Wi-Fi devices
    Scan,
}

fn split_pair(arg: &str) -> Result<(&str, &str), String> {
    arg.split_once('=')
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{arg}'"))
}

fn parse_pair(arg: &str) -> Result<(String, String), String> {
    let (name, value) = split_pair(arg)?;
    Ok((name.to_string(), value.to_string()))
}

fn parse_calibration(arg: &str) -> Result<(String, f32), String> {
    let (name, value) = split_pair(arg)?;
    let value = value
        .parse::<f32>()
        .map_err(|_| format!("'{value}' is not a number"))?;
    Ok((name.to_string(), value))
}
