use assert_cmd::cargo::cargo_bin_cmd;
use serde_json::Value;
use std::error::Error;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn run_psg(args: &[&str]) -> Result<Value, Box<dyn Error>> {
    let mut cmd = cargo_bin_cmd!("psg");
    cmd.args(args);
    let output = cmd.assert().success().get_output().stdout.clone();
    Ok(serde_json::from_slice(&output)?)
}

fn synth(path: &Path, duration: &str) -> Result<Value, Box<dyn Error>> {
    run_psg(&[
        "synth",
        "--out",
        path.to_str().ok_or("non-utf8 path")?,
        "--duration",
        duration,
        "--apneas-per-hour",
        "10",
        "--hypopneas-per-hour",
        "5",
        "--seed",
        "11",
    ])
}

#[test]
fn synth_then_ahi_reports_scripted_events() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let edf = dir.path().join("synthetic.edf");
    let written = synth(&edf, "3600")?;
    assert_eq!(written["events"].as_array().map(Vec::len), Some(15));

    let tsv = dir.path().join("sub-01_events.tsv");
    let result = run_psg(&[
        "ahi",
        "--file",
        edf.to_str().ok_or("non-utf8 path")?,
        "--workers",
        "2",
        "--events-tsv",
        tsv.to_str().ok_or("non-utf8 path")?,
    ])?;
    let summary = &result["ahi_analysis"];
    assert_eq!(summary["apnea_count"], 10);
    assert_eq!(summary["hypopnea_count"], 5);
    assert_eq!(summary["ahi_score"].as_f64(), Some(15.0));
    assert_eq!(summary["severity"], "Moderate");
    assert_eq!(result["analysis_parameters"]["num_chunks"], 15);

    let rows = fs::read_to_string(&tsv)?;
    assert_eq!(rows.lines().count(), 16);
    assert!(rows.starts_with("onset\tduration\ttrial_type"));
    assert!(dir.path().join("sub-01_events.json").exists());
    Ok(())
}

#[test]
fn info_lists_channels_and_duration() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let edf = dir.path().join("short.edf");
    run_psg(&[
        "synth",
        "--out",
        edf.to_str().ok_or("non-utf8 path")?,
        "--duration",
        "600",
        "--apneas-per-hour",
        "0",
        "--hypopneas-per-hour",
        "0",
    ])?;
    let info = run_psg(&[
        "info",
        "--file",
        edf.to_str().ok_or("non-utf8 path")?,
        "--preview",
        "4",
    ])?;
    assert_eq!(info["duration_s"].as_f64(), Some(600.0));
    let channels = info["channels"].as_array().ok_or("channels missing")?;
    assert_eq!(channels.len(), 2);
    assert_eq!(channels[0]["label"], "Flow");
    assert_eq!(channels[0]["sample_rate"].as_f64(), Some(32.0));
    assert_eq!(channels[1]["total_samples"], 600);
    assert_eq!(info["preview"]["SpO2"].as_array().map(Vec::len), Some(4));
    Ok(())
}

#[test]
fn multi_chunk_reports_unknown_channel_beside_good_ones() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let edf = dir.path().join("short.edf");
    synth(&edf, "600")?;
    let window = run_psg(&[
        "multi-chunk",
        "--file",
        edf.to_str().ok_or("non-utf8 path")?,
        "--channels",
        "Flow,SpO2,Bogus",
        "--start-sec",
        "60",
        "--end-sec",
        "120",
        "--max-points",
        "100",
    ])?;
    let flow = &window["channels"]["Flow"];
    assert_eq!(flow["data"].as_array().map(Vec::len), Some(100));
    assert_eq!(flow["start_time_sec"].as_f64(), Some(60.0));
    assert_eq!(window["channels"]["SpO2"]["data"].as_array().map(Vec::len), Some(60));
    assert_eq!(window["errors"]["Bogus"]["kind"], "not_found");
    Ok(())
}

#[test]
fn missing_file_prints_error_report() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let missing = dir.path().join("absent.edf");
    let mut cmd = cargo_bin_cmd!("psg");
    cmd.args(["info", "--file", missing.to_str().ok_or("non-utf8 path")?]);
    let output = cmd.assert().code(3).get_output().stdout.clone();
    let body: Value = serde_json::from_slice(&output)?;
    assert_eq!(body["error"]["kind"], "file_unavailable");
    Ok(())
}
