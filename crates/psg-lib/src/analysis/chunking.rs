use crate::{
    config::AnalysisConfig,
    error::PsgResult,
    io::RecordingSource,
    signal::{TimeSeries, TimedSeries},
};
use serde::{Deserialize, Serialize};

/// One analysis window `[start_s, end_s)` in recording time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChunkWindow {
    pub index: usize,
    pub start_s: f64,
    pub end_s: f64,
    /// Start of the following window; `None` for the last one.
    pub next_start_s: Option<f64>,
}

impl ChunkWindow {
    pub fn duration(&self) -> f64 {
        self.end_s - self.start_s
    }
}

/// Overlapping partition of a recording into detection chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPlan {
    pub chunk_duration_s: f64,
    pub overlap_s: f64,
    pub step_s: f64,
    pub total_duration_s: f64,
    pub windows: Vec<ChunkWindow>,
}

impl ChunkPlan {
    /// `ceil(total / step)` chunks, chunk `i` starting at `i * step` and
    /// truncated to the recording end.
    pub fn new(total_duration_s: f64, cfg: &AnalysisConfig) -> PsgResult<Self> {
        cfg.validate()?;
        let step_s = cfg.chunk_step_s();
        let total = total_duration_s.max(0.0);
        let count = (total / step_s).ceil() as usize;
        let mut windows: Vec<ChunkWindow> = (0..count)
            .map(|index| {
                let start_s = index as f64 * step_s;
                ChunkWindow {
                    index,
                    start_s,
                    end_s: (start_s + cfg.chunk_duration_s).min(total),
                    next_start_s: None,
                }
            })
            .filter(|window| window.start_s < total)
            .collect();
        for idx in 1..windows.len() {
            windows[idx - 1].next_start_s = Some(windows[idx].start_s);
        }
        Ok(Self {
            chunk_duration_s: cfg.chunk_duration_s,
            overlap_s: cfg.overlap_s,
            step_s,
            total_duration_s: total,
            windows,
        })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

/// Fetch `[start_s, end_s)` of a channel reduced to at most `rate_hz`.
///
/// Channels already at or below `rate_hz` are returned raw. The span is
/// clamped to the channel's own sample count.
pub fn fetch_window<S: RecordingSource + ?Sized>(
    source: &S,
    channel: usize,
    start_s: f64,
    end_s: f64,
    rate_hz: f64,
) -> PsgResult<TimedSeries> {
    let desc = source.descriptor(channel)?;
    let rate = desc.sample_rate;
    let start = desc.sample_at(start_s).min(desc.total_samples);
    let end = desc.sample_at(end_s).clamp(start, desc.total_samples);
    let len = end - start;
    let (data, fs) = if rate <= rate_hz || len == 0 {
        (source.read_samples(channel, start, len)?, rate)
    } else {
        let target = ((len as f64 / rate) * rate_hz).ceil().max(1.0) as usize;
        let data = source.read_downsampled(channel, start, len, target)?;
        let fs = data.len() as f64 / (len as f64 / rate);
        (data, fs)
    };
    Ok(TimedSeries {
        start_time: start as f64 / rate,
        series: TimeSeries { fs, data },
    })
}
