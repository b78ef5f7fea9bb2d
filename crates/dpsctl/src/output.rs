//! Text and JSON rendering of device results

use crate::ItemStatus;
use dps_control::upgrade::UpgradeReport;
use dps_control::{DeviceEvent, UpgradeProgress};
use dps_protocol::commands::ParameterStatus;
use dps_protocol::types::{
    format_milliamps, format_millivolts, format_temperature, CalibrationReport, ParameterList,
    QueryResponse, VersionInfo,
};
use serde::Serialize;
use serde_json::json;
use std::io::Write;
use uhej::DiscoveryRecord;

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn ack(json: bool, command: &str) {
    if json {
        println!("{}", json!({ "cmd": command, "status": 1 }));
    }
}

pub(crate) fn query(json: bool, q: &QueryResponse) -> anyhow::Result<()> {
    if json {
        let params: serde_json::Map<String, serde_json::Value> = q
            .parameters
            .iter()
            .map(|p| (p.name.clone(), json!(p.value)))
            .collect();
        return print_json(&json!({
            "cmd": "query",
            "status": 1,
            "V_in": format_millivolts(q.v_in_mv),
            "V_out": format_millivolts(q.v_out_mv),
            "I_out": format_milliamps(q.i_out_ma),
            "output_enabled": q.output_enabled,
            "function": q.function,
            "params": params,
            "temp1": q.temp1.map(format_temperature),
            "temp2": q.temp2.map(format_temperature),
            "temp_shutdown": q.temp_shutdown,
        }));
    }

    let enable = if q.output_enabled { "on" } else { "off" };
    println!("Func       : {} ({})", q.function, enable);
    for p in &q.parameters {
        println!("  {:<8} : {}", p.name, p.value);
    }
    println!("V_in       : {} V", format_millivolts(q.v_in_mv));
    println!("V_out      : {} V", format_millivolts(q.v_out_mv));
    println!("I_out      : {} A", format_milliamps(q.i_out_ma));
    if let Some(t) = q.temp1 {
        println!("Temp1      : {} °C", format_temperature(t));
    }
    if let Some(t) = q.temp2 {
        println!("Temp2      : {} °C", format_temperature(t));
    }
    if q.temp_shutdown {
        println!("Temperature shutdown active");
    }
    Ok(())
}

pub(crate) fn functions(json: bool, names: &[String]) -> anyhow::Result<()> {
    if json {
        return print_json(&json!({ "cmd": "functions", "functions": names }));
    }
    println!("Supported functions:");
    for name in names {
        println!("  {name}");
    }
    Ok(())
}

pub(crate) fn parameters(json: bool, list: &ParameterList) -> anyhow::Result<()> {
    if json {
        return print_json(list);
    }
    if list.parameters.is_empty() {
        println!("Selected function {} has no parameters", list.function);
        return Ok(());
    }
    println!("Selected function {} has parameters:", list.function);
    for p in &list.parameters {
        println!(
            "  {:<10} {}{} ({}{})",
            p.name,
            p.prefix.symbol(),
            p.unit.symbol(),
            p.prefix.name(),
            p.unit.name()
        );
    }
    Ok(())
}

pub(crate) fn statuses(json: bool, items: &[ItemStatus<'_>]) -> anyhow::Result<()> {
    if json {
        return print_json(items);
    }
    for item in items {
        let text = match item.status {
            ParameterStatus::Ok => "ok".to_string(),
            ParameterStatus::UnknownParameter => "unknown parameter".to_string(),
            ParameterStatus::IllegalValue => "illegal value".to_string(),
            ParameterStatus::Other(v) => format!("status {v}"),
        };
        println!("{:<10} : {}", item.name, text);
    }
    Ok(())
}

pub(crate) fn version(json: bool, v: &VersionInfo) -> anyhow::Result<()> {
    if json {
        return print_json(v);
    }
    println!("Boot git hash : {}", v.boot_git_hash);
    println!("App git hash  : {}", v.app_git_hash);
    Ok(())
}

pub(crate) fn calibration(json: bool, c: &CalibrationReport) -> anyhow::Result<()> {
    if json {
        return print_json(c);
    }
    println!("Calibration report:");
    println!("  A_ADC_K = {}", c.a_adc_k);
    println!("  A_ADC_C = {}", c.a_adc_c);
    println!("  A_DAC_K = {}", c.a_dac_k);
    println!("  A_DAC_C = {}", c.a_dac_c);
    println!("  V_ADC_K = {}", c.v_adc_k);
    println!("  V_ADC_C = {}", c.v_adc_c);
    println!("  V_DAC_K = {}", c.v_dac_k);
    println!("  V_DAC_C = {}", c.v_dac_c);
    println!("  VIN_ADC_K = {}", c.vin_adc_k);
    println!("  VIN_ADC_C = {}", c.vin_adc_c);
    println!("  VOUT_ADC = {}", c.vout_adc);
    println!("  VIN_ADC = {}", c.vin_adc);
    println!("  IOUT_ADC = {}", c.iout_adc);
    println!("  IOUT_DAC = {}", c.iout_dac);
    println!("  VOUT_DAC = {}", c.vout_dac);
    Ok(())
}

pub(crate) fn progress(json: bool, p: UpgradeProgress) {
    if json {
        return;
    }
    let percent = if p.total == 0 { 100 } else { p.sent * 100 / p.total };
    print!("\rSent {}/{} bytes ({}%)", p.sent, p.total, percent);
    let _ = std::io::stdout().flush();
}

pub(crate) fn upgraded(json: bool, report: &UpgradeReport) -> anyhow::Result<()> {
    if json {
        return print_json(report);
    }
    println!();
    println!(
        "Upgrade done: {} bytes in {} chunks of {}",
        report.bytes, report.chunks, report.chunk_size
    );
    Ok(())
}

pub(crate) fn event(json: bool, event: &DeviceEvent) {
    match event {
        DeviceEvent::OverCurrent(ocp) => {
            if json {
                println!("{}", json!({ "event": "ocp", "i_cut": ocp.i_cut_ma }));
            } else {
                eprintln!(
                    "Over-current protection tripped at {} A",
                    format_milliamps(ocp.i_cut_ma)
                );
            }
        }
    }
}

pub(crate) fn discovered(json: bool, record: &DiscoveryRecord) {
    if json {
        if let Ok(line) = serde_json::to_string(record) {
            println!("{line}");
        }
    } else {
        println!("{}", record.addr);
    }
}

pub(crate) fn scan_summary(json: bool, count: usize) {
    if json {
        println!("{}", json!({ "found": count }));
        return;
    }
    match count {
        0 => println!("No OpenDPS devices found"),
        1 => println!("1 OpenDPS device found"),
        n => println!("{n} OpenDPS devices found"),
    }
}
