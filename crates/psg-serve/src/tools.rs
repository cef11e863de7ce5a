use anyhow::{Context, Result};
use log::info;
use psg_lib::{
    access::ChannelAccess, analysis::AhiAnalyzer, config::PsgConfig, error::PsgError,
    io::edf::EdfRecording,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::{path::PathBuf, sync::Arc};

pub struct ToolRegistry {
    config: PsgConfig,
}

impl ToolRegistry {
    pub fn new(config: PsgConfig) -> Self {
        Self { config }
    }

    pub fn supported_tools() -> &'static [&'static str] {
        &[
            "list_tools",
            "get_info",
            "get_chunk",
            "get_chunk_downsampled",
            "get_multi_chunk_downsampled",
            "get_min_max",
            "get_full_stats",
            "run_ahi_analysis",
        ]
    }

    pub fn execute(&self, tool: &str, params: Option<Value>) -> Result<Value> {
        let params = params.unwrap_or_else(|| json!({}));
        match tool {
            "list_tools" => Ok(json!(Self::supported_tools())),
            "get_info" => {
                let access = self.open(&params)?;
                let preview = optional_usize(&params, "preview_samples")?.unwrap_or(0);
                let diagnostics = params
                    .get("diagnostics")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                to_json(&access.summary(preview, diagnostics)?)
            }
            "get_chunk" => {
                let channel = require_str(&params, "channel")?;
                let start = optional_usize(&params, "start_sample")?.unwrap_or(0);
                let count = require_usize(&params, "num_samples")?;
                let access = self.open(&params)?;
                to_json(&json!({
                    "channel": channel,
                    "data": access.get_chunk(&channel, start, count)?,
                }))
            }
            "get_chunk_downsampled" => {
                let channel = require_str(&params, "channel")?;
                let start = optional_usize(&params, "start_sample")?.unwrap_or(0);
                let count = require_usize(&params, "num_samples")?;
                let target = require_usize(&params, "target_points")?;
                let access = self.open(&params)?;
                to_json(&access.get_chunk_downsampled(&channel, start, count, target)?)
            }
            "get_multi_chunk_downsampled" => {
                let channels = require_channels(&params)?;
                let start = require_f64(&params, "start_time_sec")?;
                let end = require_f64(&params, "end_time_sec")?;
                let max_points = optional_usize(&params, "max_points")?;
                let access = self.open(&params)?;
                to_json(&access.get_multi_chunk_downsampled(&channels, start, end, max_points)?)
            }
            "get_min_max" => {
                let channels = require_channels(&params)?;
                let start = optional_f64(&params, "start_time_sec")?.unwrap_or(0.0);
                let end = optional_f64(&params, "end_time_sec")?;
                let access = self.open(&params)?;
                to_json(&access.get_min_max(&channels, start, end)?)
            }
            "get_full_stats" => {
                let channels = require_channels(&params)?;
                let access = self.open(&params)?;
                to_json(&access.get_full_statistics(&channels)?)
            }
            "run_ahi_analysis" => {
                let path = require_path(&params)?;
                let flow = optional_str(&params, "flow_channel").unwrap_or_else(|| "Flow".into());
                let spo2 = optional_str(&params, "spo2_channel").unwrap_or_else(|| "SpO2".into());
                let recording = EdfRecording::open(&path)?
                    .with_stream_block(self.config.access.stream_block_samples);
                let result = AhiAnalyzer::new(self.config.analysis)?
                    .analyze(Arc::new(recording), &flow, &spo2)?;
                info!(
                    "AHI {} for {} ({} events)",
                    result.ahi_analysis.ahi_score,
                    path.display(),
                    result.all_events.len()
                );
                to_json(&result)
            }
            _ => Err(invalid(format!("unsupported tool {}", tool))),
        }
    }

    fn open(&self, params: &Value) -> Result<ChannelAccess<EdfRecording>> {
        let path = require_path(params)?;
        Ok(ChannelAccess::open(&path, self.config.access)?)
    }

    pub fn log_summary(&self) {
        info!("Registered tools: {:?}", Self::supported_tools());
        info!(
            "Analysis: {}s chunks, {}s overlap, {} worker(s)",
            self.config.analysis.chunk_duration_s,
            self.config.analysis.overlap_s,
            self.config.analysis.max_workers
        );
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).context("serializing tool result")
}

fn invalid(message: impl Into<String>) -> anyhow::Error {
    PsgError::invalid(message).into()
}

fn missing(key: &str) -> anyhow::Error {
    invalid(format!("parameter '{}' is required", key))
}

fn optional_str(params: &Value, key: &str) -> Option<String> {
    params.get(key).and_then(Value::as_str).map(str::to_string)
}

fn require_str(params: &Value, key: &str) -> Result<String> {
    optional_str(params, key).ok_or_else(|| missing(key))
}

fn require_path(params: &Value) -> Result<PathBuf> {
    require_str(params, "path").map(PathBuf::from)
}

fn optional_usize(params: &Value, key: &str) -> Result<Option<usize>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(|v| Some(v as usize))
            .ok_or_else(|| invalid(format!("parameter '{}' must be a non-negative integer", key))),
    }
}

fn require_usize(params: &Value, key: &str) -> Result<usize> {
    optional_usize(params, key)?.ok_or_else(|| missing(key))
}

fn optional_f64(params: &Value, key: &str) -> Result<Option<f64>> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_f64()
            .map(Some)
            .ok_or_else(|| invalid(format!("parameter '{}' must be a number", key))),
    }
}

fn require_f64(params: &Value, key: &str) -> Result<f64> {
    optional_f64(params, key)?.ok_or_else(|| missing(key))
}

fn require_channels(params: &Value) -> Result<Vec<String>> {
    let list = params
        .get("channels")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("channels"))?;
    list.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| invalid("parameter 'channels' must be a list of labels"))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use psg_lib::error::{ErrorKind, ErrorReport};
    use psg_lib::synth::SyntheticPsg;
    use tempfile::tempdir;

    fn kind_of(err: &anyhow::Error) -> ErrorKind {
        ErrorReport::from_anyhow(err).kind
    }

    #[test]
    fn missing_parameters_are_invalid_arguments() {
        let registry = ToolRegistry::new(PsgConfig::default());
        let err = registry.execute("get_chunk", None).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidArgument);
        let err = registry.execute("no_such_tool", None).unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidArgument);
        let err = registry
            .execute("get_full_stats", Some(json!({ "path": "x.edf", "channels": [1] })))
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::InvalidArgument);
    }

    #[test]
    fn chunk_tools_read_an_edf() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rec.edf");
        SyntheticPsg::new(120.0, 5).write_edf(&path).unwrap();
        let registry = ToolRegistry::new(PsgConfig::default());
        let path = path.to_str().unwrap();

        let chunk = registry
            .execute(
                "get_chunk",
                Some(json!({ "path": path, "channel": "SpO2", "start_sample": 10, "num_samples": 5 })),
            )
            .unwrap();
        assert_eq!(chunk["data"].as_array().unwrap().len(), 5);

        let reduced = registry
            .execute(
                "get_chunk_downsampled",
                Some(json!({
                    "path": path,
                    "channel": "Flow",
                    "num_samples": 3200,
                    "target_points": 50,
                })),
            )
            .unwrap();
        assert_eq!(reduced["data"].as_array().unwrap().len(), 50);
        assert_eq!(reduced["effective_sample_rate"].as_f64(), Some(0.5));

        let err = registry
            .execute(
                "get_chunk",
                Some(json!({ "path": path, "channel": "Bogus", "num_samples": 5 })),
            )
            .unwrap_err();
        assert_eq!(kind_of(&err), ErrorKind::NotFound);
    }
}
