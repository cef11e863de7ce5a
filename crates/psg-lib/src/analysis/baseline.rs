use super::chunking::fetch_window;
use crate::{
    config::AnalysisConfig,
    detectors::GlobalBaseline,
    error::{PsgError, PsgResult},
    io::RecordingSource,
    metrics::stats::upper_quartile_median,
};
use log::{debug, info, warn};

/// Estimate the normal-breathing flow amplitude from up to
/// `cfg.baseline_windows` consecutive windows at the start of the recording.
///
/// The result depends on the recording and the baseline parameters only, so
/// every chunk of an analysis sees the same value whatever the chunk layout.
pub fn compute_global_baseline<S: RecordingSource + ?Sized>(
    source: &S,
    flow_channel: usize,
    cfg: &AnalysisConfig,
) -> PsgResult<GlobalBaseline> {
    let total = source.info().duration_s;
    let mut pooled = Vec::new();
    let mut used = 0usize;
    let mut last_error = None;

    for k in 0..cfg.baseline_windows {
        let start_s = k as f64 * cfg.baseline_window_s;
        if start_s >= total {
            break;
        }
        let end_s = (start_s + cfg.baseline_window_s).min(total);
        match fetch_window(source, flow_channel, start_s, end_s, cfg.analysis_rate_hz) {
            Ok(window) => {
                debug!(
                    "baseline window {} ({:.0}-{:.0}s): {} samples",
                    k,
                    start_s,
                    end_s,
                    window.series.len()
                );
                pooled.extend(window.series.data);
                used += 1;
            }
            Err(err) => {
                warn!(
                    "skipping baseline window {} ({:.0}-{:.0}s): {}",
                    k, start_s, end_s, err
                );
                last_error = Some(err);
            }
        }
    }

    if used == 0 {
        return Err(match last_error {
            Some(err) => PsgError::upstream("no baseline window could be read", err),
            None => PsgError::upstream("no baseline window could be read", "recording is empty"),
        });
    }
    let value = upper_quartile_median(&pooled).ok_or_else(|| {
        PsgError::upstream("baseline windows contained no samples", format!("{} windows", used))
    })?;
    info!("global flow baseline {:.4} from {} windows", value, used);
    GlobalBaseline::new(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::memory::MemoryRecording;
    use crate::signal::RecordingInfo;

    fn square_flow(amplitude: f64, fs: f64, seconds: f64) -> Vec<f64> {
        (0..(fs * seconds) as usize)
            .map(|i| if (i / 40) % 2 == 0 { amplitude } else { -amplitude })
            .collect()
    }

    #[test]
    fn recovers_known_amplitude_independent_of_chunking() {
        let rec = MemoryRecording::new(3600.0).with_channel(
            "Flow",
            32.0,
            square_flow(0.8, 32.0, 3600.0),
        );
        let base = compute_global_baseline(&rec, 0, &AnalysisConfig::default()).unwrap();
        assert!((base.value() - 0.8).abs() < 1e-6, "baseline {}", base.value());

        let other = AnalysisConfig {
            chunk_duration_s: 120.0,
            overlap_s: 30.0,
            ..AnalysisConfig::default()
        };
        let again = compute_global_baseline(&rec, 0, &other).unwrap();
        assert_eq!(base, again);
    }

    #[test]
    fn ignores_dropouts_and_spikes() {
        let mut flow = square_flow(1.0, 10.0, 1200.0);
        for sample in flow.iter_mut().take(2000) {
            *sample = 0.0;
        }
        flow[5000] = 50.0;
        let rec = MemoryRecording::new(1200.0).with_channel("Flow", 10.0, flow);
        let base = compute_global_baseline(&rec, 0, &AnalysisConfig::default()).unwrap();
        assert_eq!(base.value(), 1.0);
    }

    /// Source whose reads fail for a chosen time span.
    struct Flaky {
        inner: MemoryRecording,
        bad: std::ops::Range<usize>,
    }

    impl RecordingSource for Flaky {
        fn info(&self) -> &RecordingInfo {
            self.inner.info()
        }

        fn read_samples(&self, channel: usize, start: usize, len: usize) -> PsgResult<Vec<f64>> {
            if start < self.bad.end && start + len > self.bad.start {
                return Err(PsgError::upstream("read failed", "injected"));
            }
            self.inner.read_samples(channel, start, len)
        }
    }

    #[test]
    fn failing_windows_are_skipped() {
        let inner = MemoryRecording::new(1200.0).with_channel(
            "Flow",
            10.0,
            square_flow(0.5, 10.0, 1200.0),
        );
        let flaky = Flaky { inner, bad: 0..3000 };
        let base = compute_global_baseline(&flaky, 0, &AnalysisConfig::default()).unwrap();
        assert_eq!(base.value(), 0.5);

        let inner = MemoryRecording::new(600.0).with_channel(
            "Flow",
            10.0,
            square_flow(0.5, 10.0, 600.0),
        );
        let broken = Flaky { inner, bad: 0..6000 };
        let err = compute_global_baseline(&broken, 0, &AnalysisConfig::default()).unwrap_err();
        assert!(matches!(err, PsgError::Upstream { .. }));
    }
}
