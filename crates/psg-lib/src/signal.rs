use serde::{Deserialize, Serialize};

/// Slack applied when converting seconds to sample indices so that values such
/// as `0.3 * 10.0` land on sample 3 instead of 2.
const INDEX_EPSILON: f64 = 1e-9;

/// Basic typed time series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeSeries {
    /// Uniform sampling frequency in Hz
    pub fs: f64,
    /// Samples
    pub data: Vec<f64>,
}

impl TimeSeries {
    pub fn len(&self) -> usize {
        self.data.len()
    }
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
    pub fn duration(&self) -> f64 {
        self.data.len() as f64 / self.fs
    }
}

/// A time series anchored at an absolute, recording-relative start time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimedSeries {
    pub start_time: f64,
    pub series: TimeSeries,
}

impl TimedSeries {
    /// Index of the sample covering absolute time `t`, clamped to the series.
    pub fn index_at(&self, t: f64) -> usize {
        let rel = ((t - self.start_time) * self.series.fs + INDEX_EPSILON).floor();
        if rel <= 0.0 {
            0
        } else {
            (rel as usize).min(self.series.len())
        }
    }

    /// Index one past the sample covering absolute time `t`, clamped.
    pub fn index_after(&self, t: f64) -> usize {
        let rel = ((t - self.start_time) * self.series.fs - INDEX_EPSILON).ceil();
        if rel <= 0.0 {
            0
        } else {
            (rel as usize).min(self.series.len())
        }
    }

    pub fn end_time(&self) -> f64 {
        self.start_time + self.series.duration()
    }
}

/// One signal channel of a recording.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelDescriptor {
    pub label: String,
    /// Samples per second
    pub sample_rate: f64,
    pub total_samples: usize,
}

impl ChannelDescriptor {
    /// Build a descriptor whose sample count is `floor(rate * duration)`.
    pub fn with_duration(label: impl Into<String>, sample_rate: f64, duration_s: f64) -> Self {
        Self {
            label: label.into(),
            sample_rate,
            total_samples: seconds_to_samples(duration_s, sample_rate),
        }
    }

    pub fn duration(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate
    }

    /// Sample index at `time_s`, not clamped.
    pub fn sample_at(&self, time_s: f64) -> usize {
        seconds_to_samples(time_s, self.sample_rate)
    }
}

/// Header-level description of a recording.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingInfo {
    pub channels: Vec<ChannelDescriptor>,
    pub duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recording: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<String>,
}

impl RecordingInfo {
    pub fn channel_index(&self, label: &str) -> Option<usize> {
        self.channels
            .iter()
            .position(|channel| channel.label == label)
            .or_else(|| {
                // EDF labels are space padded by writers; tolerate that on lookup.
                let wanted = label.trim();
                self.channels
                    .iter()
                    .position(|channel| channel.label.trim() == wanted)
            })
    }

    pub fn labels(&self) -> Vec<String> {
        self.channels.iter().map(|c| c.label.clone()).collect()
    }

    pub fn duration_hours(&self) -> f64 {
        self.duration_s / 3600.0
    }
}

pub fn seconds_to_samples(seconds: f64, sample_rate: f64) -> usize {
    let samples = (seconds * sample_rate + INDEX_EPSILON).floor();
    if samples <= 0.0 {
        0
    } else {
        samples as usize
    }
}
