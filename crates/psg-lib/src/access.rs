use crate::{
    config::AccessConfig,
    error::{ErrorReport, PsgError, PsgResult},
    io::{edf::EdfRecording, RecordingSource},
    metrics::stats::{ChannelStats, MinMax},
    signal::RecordingInfo,
};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Per-channel results of a multi-channel request.
///
/// Channels that failed are reported in `errors` next to the ones that
/// succeeded; the request as a whole only fails when every channel did.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMap<T> {
    pub channels: BTreeMap<String, T>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub errors: BTreeMap<String, ErrorReport>,
}

impl<T> Default for ChannelMap<T> {
    fn default() -> Self {
        Self {
            channels: BTreeMap::new(),
            errors: BTreeMap::new(),
        }
    }
}

impl<T> ChannelMap<T> {
    pub fn is_partial(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Downsampled (or raw, when no reduction was needed) channel data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownsampledSeries {
    pub data: Vec<f64>,
    pub effective_sample_rate: f64,
}

/// One channel of a time-aligned multi-channel window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelWindow {
    pub name: String,
    pub data: Vec<f64>,
    /// Effective rate of `data` after downsampling.
    pub sample_rate: f64,
    pub start_time_sec: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiChannelWindow {
    pub start_time_sec: f64,
    pub end_time_sec: f64,
    #[serde(flatten)]
    pub result: ChannelMap<ChannelWindow>,
}

/// Header summary with optional sample preview and per-channel statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingSummary {
    #[serde(flatten)]
    pub info: RecordingInfo,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub preview: BTreeMap<String, Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<ChannelMap<ChannelStats>>,
}

/// Request-level view over one opened recording.
pub struct ChannelAccess<S> {
    source: S,
    config: AccessConfig,
}

impl ChannelAccess<EdfRecording> {
    /// Open an EDF file for the lifetime of the returned value.
    pub fn open(path: &Path, config: AccessConfig) -> PsgResult<Self> {
        let recording = EdfRecording::open(path)?.with_stream_block(config.stream_block_samples);
        Ok(Self::new(recording, config))
    }
}

impl<S: RecordingSource> ChannelAccess<S> {
    pub fn new(source: S, config: AccessConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn info(&self) -> &RecordingInfo {
        self.source.info()
    }

    pub fn summary(&self, preview_samples: usize, diagnostics: bool) -> PsgResult<RecordingSummary> {
        let info = self.info().clone();
        let mut preview = BTreeMap::new();
        if preview_samples > 0 {
            for (idx, channel) in info.channels.iter().enumerate() {
                let n = preview_samples.min(channel.total_samples);
                preview.insert(channel.label.clone(), self.source.read_samples(idx, 0, n)?);
            }
        }
        let diagnostics = if diagnostics {
            Some(self.get_full_statistics(&info.labels())?)
        } else {
            None
        };
        Ok(RecordingSummary {
            info,
            preview,
            diagnostics,
        })
    }

    /// Raw samples `[start_sample, start_sample + num_samples)`.
    pub fn get_chunk(
        &self,
        channel: &str,
        start_sample: usize,
        num_samples: usize,
    ) -> PsgResult<Vec<f64>> {
        let idx = self.source.resolve(channel)?;
        self.source.read_samples(idx, start_sample, num_samples)
    }

    /// Bucket-mean reduction of a sample range to at most `target_points`.
    pub fn get_chunk_downsampled(
        &self,
        channel: &str,
        start_sample: usize,
        num_samples: usize,
        target_points: usize,
    ) -> PsgResult<DownsampledSeries> {
        if target_points == 0 {
            return Err(PsgError::invalid("target_points must be at least 1"));
        }
        let idx = self.source.resolve(channel)?;
        self.downsample(idx, start_sample, num_samples, target_points)
    }

    fn downsample(
        &self,
        idx: usize,
        start: usize,
        len: usize,
        target: usize,
    ) -> PsgResult<DownsampledSeries> {
        let rate = self.source.descriptor(idx)?.sample_rate;
        let data = self.source.read_downsampled(idx, start, len, target)?;
        let effective_sample_rate = if len == 0 {
            rate
        } else {
            data.len() as f64 / (len as f64 / rate)
        };
        Ok(DownsampledSeries {
            data,
            effective_sample_rate,
        })
    }

    /// Sample span `[start, end)` of channel `idx` covering `[start_sec, end_sec)`.
    ///
    /// `None` for `end_sec` means the end of the channel.
    pub fn window_by_time(
        &self,
        idx: usize,
        start_sec: f64,
        end_sec: Option<f64>,
    ) -> PsgResult<(usize, usize)> {
        validate_time_range(start_sec, end_sec)?;
        let desc = self.source.descriptor(idx)?;
        let start = desc.sample_at(start_sec);
        let end = end_sec.map_or(desc.total_samples, |end| desc.sample_at(end));
        if start > desc.total_samples || end > desc.total_samples {
            return Err(PsgError::OutOfRange {
                channel: desc.label.clone(),
                start,
                end,
                total: desc.total_samples,
            });
        }
        Ok((start, end.max(start)))
    }

    /// Time-aligned, per-channel downsampled views of `[start_sec, end_sec)`.
    /// Every channel maps the window onto its own sample rate.
    pub fn get_multi_chunk_downsampled(
        &self,
        channels: &[String],
        start_sec: f64,
        end_sec: f64,
        max_points: Option<usize>,
    ) -> PsgResult<MultiChannelWindow> {
        validate_time_range(start_sec, Some(end_sec))?;
        let max_points = max_points.unwrap_or(self.config.default_max_points);
        if max_points == 0 {
            return Err(PsgError::invalid("max_points must be at least 1"));
        }
        let result = self.per_channel(channels, |label| {
            let idx = self.source.resolve(label)?;
            let (start, end) = self.window_by_time(idx, start_sec, Some(end_sec))?;
            let series = self.downsample(idx, start, end - start, max_points)?;
            Ok(ChannelWindow {
                name: label.to_string(),
                data: series.data,
                sample_rate: series.effective_sample_rate,
                start_time_sec: start_sec,
            })
        })?;
        Ok(MultiChannelWindow {
            start_time_sec: start_sec,
            end_time_sec: end_sec,
            result,
        })
    }

    pub fn get_min_max(
        &self,
        channels: &[String],
        start_sec: f64,
        end_sec: Option<f64>,
    ) -> PsgResult<ChannelMap<Option<MinMax>>> {
        validate_time_range(start_sec, end_sec)?;
        self.per_channel(channels, |label| {
            let idx = self.source.resolve(label)?;
            let (start, end) = self.window_by_time(idx, start_sec, end_sec)?;
            self.source.min_max(idx, start, end - start)
        })
    }

    /// Whole-recording statistics, stream-reduced per channel.
    pub fn get_full_statistics(&self, channels: &[String]) -> PsgResult<ChannelMap<ChannelStats>> {
        self.per_channel(channels, |label| {
            let idx = self.source.resolve(label)?;
            self.source.full_stats(idx)?.ok_or_else(|| {
                PsgError::invalid(format!("channel '{}' has no samples", label))
            })
        })
    }

    fn per_channel<T>(
        &self,
        channels: &[String],
        mut op: impl FnMut(&str) -> PsgResult<T>,
    ) -> PsgResult<ChannelMap<T>> {
        if channels.is_empty() {
            return Err(PsgError::invalid("at least one channel is required"));
        }
        let mut out = ChannelMap::default();
        let mut first_error = None;
        for label in channels {
            match op(label.as_str()) {
                Ok(value) => {
                    out.channels.insert(label.clone(), value);
                }
                Err(err) => {
                    warn!("channel {}: {}", label, err);
                    out.errors.insert(label.clone(), err.report());
                    first_error.get_or_insert(err);
                }
            }
        }
        if out.channels.is_empty() {
            if let Some(err) = first_error {
                return Err(err);
            }
        }
        debug!(
            "{} of {} channels served",
            out.channels.len(),
            channels.len()
        );
        Ok(out)
    }
}

fn validate_time_range(start_sec: f64, end_sec: Option<f64>) -> PsgResult<()> {
    if !start_sec.is_finite() || start_sec < 0.0 {
        return Err(PsgError::invalid(format!(
            "start time must be a non-negative number of seconds, got {}",
            start_sec
        )));
    }
    if let Some(end) = end_sec {
        if !end.is_finite() || end < start_sec {
            return Err(PsgError::invalid(format!(
                "end time {} precedes start time {}",
                end, start_sec
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::io::memory::MemoryRecording;

    fn access() -> ChannelAccess<MemoryRecording> {
        let flow: Vec<f64> = (0..32 * 60).map(|i| (i as f64 * 0.1).sin()).collect();
        let spo2: Vec<f64> = (0..60).map(|i| 90.0 + (i % 8) as f64).collect();
        let rec = MemoryRecording::new(60.0)
            .with_channel("Flow", 32.0, flow)
            .with_channel("SpO2", 1.0, spo2);
        ChannelAccess::new(rec, AccessConfig::default())
    }

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn downsampling_is_deterministic_and_bounded() {
        let access = access();
        let a = access.get_chunk_downsampled("Flow", 0, 1920, 100).unwrap();
        let b = access.get_chunk_downsampled("Flow", 0, 1920, 100).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.data.len(), 100);
        // 100 points over 60 s.
        assert!((a.effective_sample_rate - 100.0 / 60.0).abs() < 1e-9);

        let raw = access.get_chunk_downsampled("Flow", 10, 50, 500).unwrap();
        assert_eq!(raw.data, access.get_chunk("Flow", 10, 50).unwrap());
        assert_eq!(raw.effective_sample_rate, 32.0);
    }

    #[test]
    fn range_is_never_clamped() {
        let access = access();
        let err = access.get_chunk("SpO2", 55, 10).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert_eq!(access.get_chunk("SpO2", 55, 5).unwrap().len(), 5);
        let err = access.get_chunk("Bogus", 0, 1).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = access.get_chunk_downsampled("Flow", 0, 10, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn zero_length_is_empty_not_an_error() {
        let access = access();
        let series = access.get_chunk_downsampled("Flow", 100, 0, 10).unwrap();
        assert!(series.data.is_empty());
        let window = access
            .get_multi_chunk_downsampled(&labels(&["Flow"]), 5.0, 5.0, None)
            .unwrap();
        assert!(window.result.channels["Flow"].data.is_empty());
    }

    #[test]
    fn multi_channel_maps_time_per_rate() {
        let access = access();
        let window = access
            .get_multi_chunk_downsampled(&labels(&["Flow", "SpO2"]), 10.0, 20.0, Some(1000))
            .unwrap();
        assert!(!window.result.is_partial());
        assert_eq!(window.result.channels["Flow"].data.len(), 320);
        assert_eq!(window.result.channels["SpO2"].data.len(), 10);
        assert_eq!(window.result.channels["SpO2"].data[0], 92.0);
        assert_eq!(window.result.channels["SpO2"].start_time_sec, 10.0);
        assert_eq!(window.start_time_sec, 10.0);
    }

    #[test]
    fn multi_channel_partial_failure() {
        let access = access();
        let window = access
            .get_multi_chunk_downsampled(&labels(&["Flow", "Bogus"]), 0.0, 30.0, Some(100))
            .unwrap();
        assert!(window.result.channels.contains_key("Flow"));
        assert_eq!(window.result.errors["Bogus"].kind, ErrorKind::NotFound);

        let err = access
            .get_multi_chunk_downsampled(&labels(&["Bogus", "Other"]), 0.0, 30.0, Some(100))
            .unwrap_err();
        assert!(matches!(err, PsgError::ChannelNotFound(ref name) if name == "Bogus"));

        let err = access
            .get_multi_chunk_downsampled(&[], 0.0, 30.0, Some(100))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn time_ranges_are_validated() {
        let access = access();
        let chans = labels(&["Flow"]);
        for (start, end) in [(-1.0, 5.0), (10.0, 5.0), (f64::NAN, 1.0)] {
            let err = access
                .get_multi_chunk_downsampled(&chans, start, end, None)
                .unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        }
        let err = access
            .get_multi_chunk_downsampled(&chans, 50.0, 61.0, None)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn min_max_defaults_to_end_of_recording() {
        let access = access();
        let result = access.get_min_max(&labels(&["SpO2"]), 0.0, None).unwrap();
        let mm = result.channels["SpO2"].unwrap();
        assert_eq!(mm.min, 90.0);
        assert_eq!(mm.max, 97.0);
        let narrow = access.get_min_max(&labels(&["SpO2"]), 1.0, Some(3.0)).unwrap();
        assert_eq!(narrow.channels["SpO2"], Some(MinMax { min: 91.0, max: 92.0 }));
    }

    #[test]
    fn summary_carries_preview_and_diagnostics() {
        let access = access();
        let summary = access.summary(5, true).unwrap();
        assert_eq!(summary.preview["SpO2"], vec![90.0, 91.0, 92.0, 93.0, 94.0]);
        let diag = summary.diagnostics.unwrap();
        assert_eq!(diag.channels["Flow"].num_samples, 1920);
        assert_eq!(diag.channels["SpO2"].num_samples, 60);
    }
}
