use super::RecordingSource;
use crate::error::{PsgError, PsgResult};
use crate::signal::{ChannelDescriptor, RecordingInfo};

/// Recording held entirely in memory. Used for synthetic data and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryRecording {
    info: RecordingInfo,
    signals: Vec<Vec<f64>>,
}

impl MemoryRecording {
    pub fn new(duration_s: f64) -> Self {
        Self {
            info: RecordingInfo {
                duration_s,
                ..RecordingInfo::default()
            },
            signals: Vec::new(),
        }
    }

    /// Append a channel. `data` is truncated to `floor(sample_rate * duration)`
    /// samples; shorter data keeps its own length.
    pub fn with_channel(mut self, label: &str, sample_rate: f64, mut data: Vec<f64>) -> Self {
        let mut desc = ChannelDescriptor::with_duration(label, sample_rate, self.info.duration_s);
        data.truncate(desc.total_samples);
        desc.total_samples = data.len();
        self.info.channels.push(desc);
        self.signals.push(data);
        self
    }

    pub fn with_patient(mut self, patient: &str) -> Self {
        self.info.patient = Some(patient.to_string());
        self
    }

    pub fn signal(&self, channel: usize) -> Option<&[f64]> {
        self.signals.get(channel).map(|s| s.as_slice())
    }
}

impl RecordingSource for MemoryRecording {
    fn info(&self) -> &RecordingInfo {
        &self.info
    }

    fn read_samples(&self, channel: usize, start: usize, len: usize) -> PsgResult<Vec<f64>> {
        self.check_range(channel, start, len)?;
        let signal = self
            .signals
            .get(channel)
            .ok_or_else(|| PsgError::Internal(format!("no samples for channel {}", channel)))?;
        Ok(signal[start..start + len].to_vec())
    }
}
