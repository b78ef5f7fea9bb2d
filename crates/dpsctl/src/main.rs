//! dpsctl - command line control for OpenDPS power supplies

use anyhow::{bail, Context};
use clap::Parser;
use dps_control::upgrade::UpgradeEngine;
use dps_control::{ConnectionConfig, DpsDevice, FirmwareImage};
use dps_protocol::commands::{ParameterStatus, Screen, WifiStatus};
use serde::Serialize;
use tokio::sync::broadcast::error::TryRecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod cli;
mod output;

use cli::{Cli, Commands, OnOff, ScreenArg, WifiArg};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "dpsctl=debug,dps_control=debug,dps_protocol=debug,uhej=debug"
    } else {
        "dpsctl=info,dps_control=info,dps_protocol=info,uhej=info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .init();

    if let Commands::Scan = cli.command {
        return scan(cli.json).await;
    }

    let config = ConnectionConfig::from_env()?.with_interface(cli.device.clone());
    let mut device = DpsDevice::connect(&config)
        .await
        .context("could not open device")?;

    let mut events = device.subscribe();
    let result = run(&mut device, &config, &cli).await;
    loop {
        match events.try_recv() {
            Ok(event) => output::event(cli.json, &event),
            Err(TryRecvError::Lagged(n)) => tracing::warn!("Missed {} device events", n),
            Err(_) => break,
        }
    }
    if let Err(e) = device.close().await {
        tracing::warn!("Could not close device: {}", e);
    }
    result
}

async fn run(device: &mut DpsDevice, config: &ConnectionConfig, cli: &Cli) -> anyhow::Result<()> {
    let json = cli.json;
    match &cli.command {
        Commands::Ping => {
            device.ping().await?;
            output::ack(json, "ping");
        }
        Commands::Query => {
            let query = device.query().await?;
            output::query(json, &query)?;
        }
        Commands::Lock => {
            device.lock(true).await?;
            output::ack(json, "lock");
        }
        Commands::Unlock => {
            device.lock(false).await?;
            output::ack(json, "unlock");
        }
        Commands::Power { state } => {
            device.enable_output(matches!(state, OnOff::On)).await?;
            output::ack(json, "power");
        }
        Commands::Function { name } => {
            device.set_function(name).await?;
            output::ack(json, "function");
        }
        Commands::Functions => {
            let functions = device.list_functions().await?;
            output::functions(json, &functions)?;
        }
        Commands::Parameters => {
            let list = device.list_parameters().await?;
            output::parameters(json, &list)?;
        }
        Commands::Set { params } => {
            let statuses = device.set_parameters(params).await?;
            let names: Vec<&str> = params.iter().map(|(n, _)| n.as_str()).collect();
            report_statuses(json, &names, &statuses)?;
        }
        Commands::Version => {
            let version = device.version().await?;
            output::version(json, &version)?;
        }
        Commands::Calibration => {
            let report = device.calibration_report().await?;
            output::calibration(json, &report)?;
        }
        Commands::SetCalibration { values } => {
            let statuses = device.set_calibration(values).await?;
            let names: Vec<&str> = values.iter().map(|(n, _)| n.as_str()).collect();
            report_statuses(json, &names, &statuses)?;
        }
        Commands::ClearCalibration => {
            device.clear_calibration().await?;
            output::ack(json, "clear_calibration");
        }
        Commands::Temperature { t1, t2 } => {
            let t1 = t1.map(to_tenths).transpose()?;
            let t2 = t2.map(to_tenths).transpose()?;
            device.temperature_report(t1, t2).await?;
            output::ack(json, "temperature");
        }
        Commands::Screen { screen } => {
            let screen = match screen {
                ScreenArg::Main => Screen::Main,
                ScreenArg::Settings => Screen::Settings,
            };
            device.change_screen(screen).await?;
            output::ack(json, "screen");
        }
        Commands::Brightness { percent } => {
            device.set_brightness(*percent).await?;
            output::ack(json, "brightness");
        }
        Commands::Wifi { status } => {
            let status = match status {
                WifiArg::Off => WifiStatus::Off,
                WifiArg::Connecting => WifiStatus::Connecting,
                WifiArg::Connected => WifiStatus::Connected,
                WifiArg::Error => WifiStatus::Error,
                WifiArg::Upgrading => WifiStatus::Upgrading,
            };
            device.wifi_status(status).await?;
            output::ack(json, "wifi");
        }
        Commands::Upgrade {
            file,
            force,
            chunk_size,
        } => {
            let image = FirmwareImage::from_file(file, *force).await?;
            let mut engine = UpgradeEngine::new(*chunk_size, config.upgrade_timeout);
            let report = engine
                .run(device, &image, |p| output::progress(json, p))
                .await?;
            output::upgraded(json, &report)?;
        }
        Commands::Scan => bail!("scan does not use a device connection"),
    }
    Ok(())
}

fn to_tenths(celsius: f32) -> anyhow::Result<i16> {
    let tenths = (celsius * 10.0).round();
    if !tenths.is_finite() || tenths < f32::from(i16::MIN) || tenths > f32::from(i16::MAX) {
        bail!("temperature {celsius} is out of range");
    }
    Ok(tenths as i16)
}

#[derive(Serialize)]
pub(crate) struct ItemStatus<'a> {
    pub name: &'a str,
    pub status: ParameterStatus,
}

fn report_statuses(json: bool, names: &[&str], statuses: &[ParameterStatus]) -> anyhow::Result<()> {
    let items: Vec<ItemStatus<'_>> = names
        .iter()
        .zip(statuses.iter())
        .map(|(&name, &status)| ItemStatus { name, status })
        .collect();
    output::statuses(json, &items)?;

    let failed = items
        .iter()
        .filter(|i| i.status != ParameterStatus::Ok)
        .count();
    if failed > 0 || statuses.len() < names.len() {
        bail!("{} of {} values were not accepted", names.len() - (items.len() - failed), names.len());
    }
    Ok(())
}

async fn scan(json: bool) -> anyhow::Result<()> {
    let config = uhej::ScanConfig::default();
    let count = uhej::scan(&config, |record| output::discovered(json, record))
        .await
        .context("scan failed")?;
    output::scan_summary(json, count);
    Ok(())
}
