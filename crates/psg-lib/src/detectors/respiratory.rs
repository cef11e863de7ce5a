use crate::{
    config::AnalysisConfig,
    error::{PsgError, PsgResult},
    metrics::stats::upper_quartile_median,
    signal::TimedSeries,
};
use serde::{Deserialize, Serialize};

/// AASM flow reduction that fully qualifies an apnea (percent).
const APNEA_TARGET_REDUCTION: f64 = 90.0;
/// AASM flow reduction that fully qualifies a hypopnea (percent).
const HYPOPNEA_TARGET_REDUCTION: f64 = 30.0;
/// SpO2 drop above which a hypopnea is graded severe (percentage points).
const SEVERE_HYPOPNEA_DROP: f64 = 6.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Apnea,
    Hypopnea,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Apnea => "apnea",
            EventType::Hypopnea => "hypopnea",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSeverity {
    Mild,
    Moderate,
    Severe,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            EventSeverity::Mild => "mild",
            EventSeverity::Moderate => "moderate",
            EventSeverity::Severe => "severe",
        }
    }
}

/// Robust normal-breathing amplitude for one flow channel.
///
/// Computed once per analysis and handed to every chunk by value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GlobalBaseline(f64);

impl GlobalBaseline {
    pub fn new(value: f64) -> PsgResult<Self> {
        if value.is_finite() && value > 0.0 {
            Ok(Self(value))
        } else {
            Err(PsgError::upstream(
                "flow baseline is not usable",
                format!("estimated amplitude {}", value),
            ))
        }
    }

    pub fn value(self) -> f64 {
        self.0
    }
}

/// SpO2 figures behind a desaturation decision.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Desaturation {
    pub baseline: f64,
    pub nadir: f64,
    pub drop: f64,
}

/// A detected respiratory event with absolute, recording-relative times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventCandidate {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub start_time: f64,
    pub end_time: f64,
    pub duration: f64,
    /// Reduction relative to baseline at the first sample of the event.
    pub flow_reduction_percent: f64,
    /// Reduction relative to baseline averaged over the event.
    pub mean_flow_reduction_percent: f64,
    pub has_desaturation: bool,
    pub confidence: f64,
    pub severity: EventSeverity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_baseline: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_nadir: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spo2_drop: Option<f64>,
    pub chunk_index: usize,
    #[serde(skip)]
    pub edges: ChunkEdges,
}

/// Whether an event was cut by the start or the end of its chunk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkEdges {
    pub at_start: bool,
    pub at_end: bool,
}

impl EventCandidate {
    /// Overlap of the two spans divided by the longer duration.
    pub fn overlap_ratio(&self, other: &EventCandidate) -> f64 {
        overlap_ratio(
            (self.start_time, self.end_time),
            (other.start_time, other.end_time),
        )
    }

    /// Minimal event for aggregation tests.
    #[cfg(test)]
    pub(crate) fn bare(event_type: EventType, start_time: f64, end_time: f64) -> Self {
        Self {
            event_type,
            start_time,
            end_time,
            duration: end_time - start_time,
            flow_reduction_percent: 95.0,
            mean_flow_reduction_percent: 95.0,
            has_desaturation: true,
            confidence: 0.95,
            severity: EventSeverity::Severe,
            spo2_baseline: None,
            spo2_nadir: None,
            spo2_drop: None,
            chunk_index: 0,
            edges: ChunkEdges::default(),
        }
    }

    /// Merge with `tail`, the rest of the same event as seen by the next
    /// chunk. Onset figures come from `self`, SpO2 figures from whichever
    /// part saw the deeper drop.
    pub fn joined_with(&self, tail: &EventCandidate) -> EventCandidate {
        let start_time = self.start_time;
        let end_time = self.end_time.max(tail.end_time);
        let duration = end_time - start_time;
        let lead = (tail.start_time - start_time).clamp(0.0, duration);
        let mean_flow_reduction_percent = if duration > 0.0 {
            (self.mean_flow_reduction_percent * lead
                + tail.mean_flow_reduction_percent * (duration - lead))
                / duration
        } else {
            self.mean_flow_reduction_percent
        };
        let drop_of = |e: &EventCandidate| e.spo2_drop.unwrap_or(f64::NEG_INFINITY);
        let spo2 = if drop_of(tail) > drop_of(self) { tail } else { self };
        let has_desaturation = self.has_desaturation || tail.has_desaturation;
        EventCandidate {
            event_type: self.event_type,
            start_time,
            end_time,
            duration,
            flow_reduction_percent: self.flow_reduction_percent,
            mean_flow_reduction_percent,
            has_desaturation,
            confidence: confidence(self.event_type, mean_flow_reduction_percent),
            severity: grade(self.event_type, has_desaturation, spo2.spo2_drop),
            spo2_baseline: spo2.spo2_baseline,
            spo2_nadir: spo2.spo2_nadir,
            spo2_drop: spo2.spo2_drop,
            chunk_index: self.chunk_index,
            edges: ChunkEdges {
                at_start: self.edges.at_start,
                at_end: tail.edges.at_end,
            },
        }
    }
}

/// Apneas are severe with a desaturation and mild without; hypopneas are
/// severe past a 6 point drop.
fn grade(event_type: EventType, has_desaturation: bool, spo2_drop: Option<f64>) -> EventSeverity {
    match event_type {
        EventType::Apnea if has_desaturation => EventSeverity::Severe,
        EventType::Apnea => EventSeverity::Mild,
        EventType::Hypopnea if spo2_drop.map_or(false, |d| d > SEVERE_HYPOPNEA_DROP) => {
            EventSeverity::Severe
        }
        EventType::Hypopnea => EventSeverity::Moderate,
    }
}

pub fn overlap_ratio(a: (f64, f64), b: (f64, f64)) -> f64 {
    let overlap = (a.1.min(b.1) - a.0.max(b.0)).max(0.0);
    let longest = (a.1 - a.0).max(b.1 - b.0);
    if longest > 0.0 {
        overlap / longest
    } else {
        0.0
    }
}

/// Half-open sample span `[start, end)` of a below-threshold run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    pub start: usize,
    pub end: usize,
}

impl Run {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }
}

/// Scan `amplitude` for runs at or below `threshold` lasting at least
/// `min_len` samples. A run still open at the end of the data is closed there.
pub fn threshold_runs(amplitude: &[f64], threshold: f64, min_len: usize) -> Vec<Run> {
    let min_len = min_len.max(1);
    let mut runs = Vec::new();
    let mut open: Option<usize> = None;
    for (idx, &value) in amplitude.iter().enumerate() {
        match (open, value <= threshold) {
            (None, true) => open = Some(idx),
            (Some(start), false) => {
                if idx - start >= min_len {
                    runs.push(Run { start, end: idx });
                }
                open = None;
            }
            _ => {}
        }
    }
    if let Some(start) = open {
        if amplitude.len() - start >= min_len {
            runs.push(Run {
                start,
                end: amplitude.len(),
            });
        }
    }
    runs
}

/// Flow and SpO2 sub-series for one chunk, already reduced to the analysis rate.
#[derive(Debug, Clone)]
pub struct ChunkSignals {
    pub index: usize,
    pub flow: TimedSeries,
    pub spo2: TimedSeries,
    /// Start of the following chunk; `None` for the last one.
    pub next_start: Option<f64>,
}

/// Per-chunk detector output.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkEvents {
    pub index: usize,
    pub apneas: Vec<EventCandidate>,
    pub hypopneas: Vec<EventCandidate>,
    pub spo2_baseline: Option<f64>,
}

/// Confidence that a run is a scoreable event given its mean flow reduction.
pub fn confidence(event_type: EventType, mean_reduction_percent: f64) -> f64 {
    let target = match event_type {
        EventType::Apnea => APNEA_TARGET_REDUCTION,
        EventType::Hypopnea => HYPOPNEA_TARGET_REDUCTION,
    };
    if mean_reduction_percent >= target {
        0.95
    } else {
        (0.5 + 0.34 * (mean_reduction_percent / target)).clamp(0.0, 0.84)
    }
}

struct SpO2View<'a> {
    series: &'a TimedSeries,
    baseline: Option<f64>,
    valid_min: f64,
    tail_s: f64,
    drop_threshold: f64,
}

impl<'a> SpO2View<'a> {
    fn new(series: &'a TimedSeries, cfg: &AnalysisConfig) -> Self {
        let valid: Vec<f64> = series
            .series
            .data
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v >= cfg.spo2_valid_min)
            .collect();
        Self {
            series,
            baseline: upper_quartile_median(&valid),
            valid_min: cfg.spo2_valid_min,
            tail_s: cfg.spo2_search_tail_s,
            drop_threshold: cfg.spo2_drop_threshold,
        }
    }

    fn desaturation(&self, start_time: f64, end_time: f64) -> Option<Desaturation> {
        let baseline = self.baseline?;
        let from = self.series.index_at(start_time);
        let to = self.series.index_after(end_time + self.tail_s);
        let nadir = self
            .series
            .series
            .data
            .get(from..to)?
            .iter()
            .copied()
            .filter(|v| v.is_finite() && *v >= self.valid_min)
            .fold(None, |acc: Option<f64>, v| Some(acc.map_or(v, |m| m.min(v))))?;
        Some(Desaturation {
            baseline,
            nadir,
            drop: baseline - nadir,
        })
    }

    fn is_desaturated(&self, desat: Option<&Desaturation>) -> bool {
        desat.map_or(false, |d| d.drop >= self.drop_threshold)
    }
}

/// Run the apnea and hypopnea threshold scans over one chunk.
pub fn detect_chunk_events(
    chunk: &ChunkSignals,
    baseline: GlobalBaseline,
    cfg: &AnalysisConfig,
) -> ChunkEvents {
    let flow = &chunk.flow;
    let fs = flow.series.fs;
    let mut out = ChunkEvents {
        index: chunk.index,
        ..ChunkEvents::default()
    };
    if flow.series.is_empty() || !(fs > 0.0) {
        return out;
    }

    let amplitude: Vec<f64> = flow.series.data.iter().map(|v| v.abs()).collect();
    let min_len = (cfg.min_event_duration_s * fs).round() as usize;
    let spo2 = SpO2View::new(&chunk.spo2, cfg);
    out.spo2_baseline = spo2.baseline;
    let b = baseline.value();

    let n = amplitude.len();
    let make_event = |event_type: EventType, run: Run| -> (EventCandidate, bool) {
        let start_time = flow.start_time + run.start as f64 / fs;
        let end_time = flow.start_time + run.end as f64 / fs;
        let mean_amp = amplitude[run.start..run.end].iter().sum::<f64>() / run.len() as f64;
        let mean_reduction = (b - mean_amp) / b * 100.0;
        let desat = spo2.desaturation(start_time, end_time);
        let has_desaturation = spo2.is_desaturated(desat.as_ref());
        let event = EventCandidate {
            event_type,
            start_time,
            end_time,
            duration: end_time - start_time,
            flow_reduction_percent: (b - amplitude[run.start]) / b * 100.0,
            mean_flow_reduction_percent: mean_reduction,
            has_desaturation,
            confidence: confidence(event_type, mean_reduction),
            severity: grade(event_type, has_desaturation, desat.map(|d| d.drop)),
            spo2_baseline: desat.map(|d| d.baseline),
            spo2_nadir: desat.map(|d| d.nadir),
            spo2_drop: desat.map(|d| d.drop),
            chunk_index: chunk.index,
            edges: ChunkEdges {
                at_start: run.start == 0 && flow.start_time > 0.0,
                at_end: run.end == n && chunk.next_start.is_some(),
            },
        };
        (event, has_desaturation)
    };
    // A run cut by the chunk end that starts inside the next chunk is left to
    // that chunk, which sees it from its real start.
    let deferred = |run: &Run| match chunk.next_start {
        Some(next) => run.end == n && flow.start_time + (run.start as f64 + 0.5) / fs >= next,
        None => false,
    };

    let apnea_runs = threshold_runs(&amplitude, b * cfg.apnea_threshold, min_len);
    for run in apnea_runs.iter().filter(|run| !deferred(run)) {
        out.apneas.push(make_event(EventType::Apnea, *run).0);
    }

    // The hypopnea band includes apnea-level flow; any reduced-flow run that
    // touches an apnea belongs to that apnea.
    for run in threshold_runs(&amplitude, b * cfg.hypopnea_threshold, min_len) {
        if deferred(&run)
            || apnea_runs
                .iter()
                .any(|apnea| apnea.start < run.end && run.start < apnea.end)
        {
            continue;
        }
        let (event, desaturated) = make_event(EventType::Hypopnea, run);
        if desaturated {
            out.hypopneas.push(event);
        }
    }

    out
}
