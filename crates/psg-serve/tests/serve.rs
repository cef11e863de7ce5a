use assert_cmd::cargo::cargo_bin_cmd;
use psg_lib::synth::SyntheticPsg;
use serde_json::{json, Value};
use std::error::Error;
use std::fs;
use tempfile::tempdir;

#[test]
fn stdio_session_answers_requests() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let edf = dir.path().join("rec.edf");
    SyntheticPsg::new(300.0, 9).write_edf(&edf)?;
    let path = edf.to_str().ok_or("non-utf8 path")?;

    let requests = [
        json!({ "id": 1, "method": "get_info", "params": { "path": path } }),
        json!({
            "id": 2,
            "method": "get_min_max",
            "params": { "path": path, "channels": ["SpO2", "Bogus"], "start_time_sec": 10.0 }
        }),
        json!({ "id": 3, "method": "get_chunk", "params": { "path": path, "channel": "Flow", "start_sample": 9600, "num_samples": 10 } }),
    ];
    let input: String = requests.iter().map(|r| format!("{}\n", r)).collect();

    let mut cmd = cargo_bin_cmd!("psg-serve");
    cmd.args(["--log-level", "warn", "serve"]).write_stdin(input);
    let output = cmd.assert().success().get_output().stdout.clone();
    let responses: Vec<Value> = String::from_utf8(output)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<_, _>>()?;
    assert_eq!(responses.len(), 3);

    assert_eq!(responses[0]["id"], 1);
    assert_eq!(responses[0]["result"]["duration_s"].as_f64(), Some(300.0));

    let min_max = &responses[1]["result"];
    let spo2 = &min_max["channels"]["SpO2"];
    assert!(spo2["min"].as_f64().ok_or("min missing")? > 95.0);
    assert!(spo2["max"].as_f64().ok_or("max missing")? <= 100.0);
    assert_eq!(min_max["errors"]["Bogus"]["kind"], "not_found");

    assert_eq!(responses[2]["error"]["kind"], "out_of_range");
    Ok(())
}

#[test]
fn run_tool_reads_params_file() -> Result<(), Box<dyn Error>> {
    let dir = tempdir()?;
    let edf = dir.path().join("rec.edf");
    SyntheticPsg::new(600.0, 4)
        .apnea(200.0, 18.0, 5.0)
        .write_edf(&edf)?;
    let params = dir.path().join("params.json");
    fs::write(
        &params,
        serde_json::to_string(&json!({ "path": edf, "flow_channel": "Flow", "spo2_channel": "SpO2" }))?,
    )?;

    let mut cmd = cargo_bin_cmd!("psg-serve");
    cmd.args([
        "run-tool",
        "--name",
        "run_ahi_analysis",
        "--params",
        params.to_str().ok_or("non-utf8 path")?,
    ]);
    let output = cmd.assert().success().get_output().stdout.clone();
    let result: Value = serde_json::from_slice(&output)?;
    assert_eq!(result["ahi_analysis"]["apnea_count"], 1);
    assert_eq!(result["ahi_analysis"]["hypopnea_count"], 0);
    assert_eq!(result["analysis_parameters"]["num_chunks"], 3);
    Ok(())
}
