use crate::error::{PsgError, PsgResult};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Top-level configuration file layout (`psg.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PsgConfig {
    pub access: AccessConfig,
    pub analysis: AnalysisConfig,
}

/// Parameters for the channel access layer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessConfig {
    /// Point budget used when a visualization request omits one.
    pub default_max_points: usize,
    /// Samples pulled from the reader per streaming step.
    pub stream_block_samples: usize,
}

impl Default for AccessConfig {
    fn default() -> Self {
        Self {
            default_max_points: 2000,
            stream_block_samples: 1 << 16,
        }
    }
}

/// Configurable parameters for the chunked apnea/hypopnea pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Length of one detection chunk (seconds).
    pub chunk_duration_s: f64,
    /// Overlap between consecutive chunks (seconds).
    pub overlap_s: f64,
    /// Maximum number of windows sampled for the global baseline.
    pub baseline_windows: usize,
    /// Length of one baseline window (seconds).
    pub baseline_window_s: f64,
    /// Resolution signals are reduced to before scanning (Hz).
    pub analysis_rate_hz: f64,
    /// Apnea threshold as a fraction of baseline (0.1 = 90% reduction).
    pub apnea_threshold: f64,
    /// Hypopnea threshold as a fraction of baseline (0.7 = 30% reduction).
    pub hypopnea_threshold: f64,
    /// Minimum SpO2 drop (percentage points) that counts as desaturation.
    pub spo2_drop_threshold: f64,
    /// SpO2 readings below this value are treated as sensor dropouts.
    pub spo2_valid_min: f64,
    /// Extra seconds after an event searched for the SpO2 nadir.
    pub spo2_search_tail_s: f64,
    /// Minimum event duration (seconds).
    pub min_event_duration_s: f64,
    /// Overlap ratio above which two candidates are the same event.
    pub dedup_overlap_ratio: f64,
    /// Chunk worker threads; 1 processes chunks one at a time.
    pub max_workers: usize,
    /// Wall-clock budget for a whole analysis (seconds).
    pub analysis_timeout_s: f64,
    /// Wall-clock budget for one chunk (seconds).
    pub chunk_timeout_s: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            chunk_duration_s: 300.0,
            overlap_s: 60.0,
            baseline_windows: 4,
            baseline_window_s: 300.0,
            analysis_rate_hz: 10.0,
            apnea_threshold: 0.10,
            hypopnea_threshold: 0.70,
            spo2_drop_threshold: 3.0,
            spo2_valid_min: 50.0,
            spo2_search_tail_s: 0.0,
            min_event_duration_s: 10.0,
            dedup_overlap_ratio: 0.5,
            max_workers: 1,
            analysis_timeout_s: 600.0,
            chunk_timeout_s: 120.0,
        }
    }
}

impl AnalysisConfig {
    /// Distance between consecutive chunk starts.
    pub fn chunk_step_s(&self) -> f64 {
        self.chunk_duration_s - self.overlap_s
    }

    pub fn validate(&self) -> PsgResult<()> {
        let positive = [
            ("chunk_duration_s", self.chunk_duration_s),
            ("baseline_window_s", self.baseline_window_s),
            ("analysis_rate_hz", self.analysis_rate_hz),
            ("min_event_duration_s", self.min_event_duration_s),
            ("analysis_timeout_s", self.analysis_timeout_s),
            ("chunk_timeout_s", self.chunk_timeout_s),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(PsgError::invalid(format!(
                    "{} must be positive, got {}",
                    name, value
                )));
            }
        }
        if !(self.overlap_s >= 0.0 && self.overlap_s < self.chunk_duration_s) {
            return Err(PsgError::invalid(format!(
                "overlap_s ({}) must be in [0, chunk_duration_s={})",
                self.overlap_s, self.chunk_duration_s
            )));
        }
        if !(self.apnea_threshold > 0.0 && self.apnea_threshold < self.hypopnea_threshold) {
            return Err(PsgError::invalid(
                "apnea_threshold must be positive and below hypopnea_threshold",
            ));
        }
        if self.hypopnea_threshold >= 1.0 {
            return Err(PsgError::invalid("hypopnea_threshold must be below 1.0"));
        }
        if !(self.dedup_overlap_ratio > 0.0 && self.dedup_overlap_ratio < 1.0) {
            return Err(PsgError::invalid("dedup_overlap_ratio must be in (0, 1)"));
        }
        if self.baseline_windows == 0 {
            return Err(PsgError::invalid("baseline_windows must be at least 1"));
        }
        if self.max_workers == 0 {
            return Err(PsgError::invalid("max_workers must be at least 1"));
        }
        if self.spo2_search_tail_s < 0.0 {
            return Err(PsgError::invalid("spo2_search_tail_s cannot be negative"));
        }
        Ok(())
    }
}

impl PsgConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: PsgConfig = toml::from_str(text).context("parsing config")?;
        config.analysis.validate()?;
        if config.access.stream_block_samples == 0 {
            anyhow::bail!("access.stream_block_samples must be at least 1");
        }
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("in config {}", path.display()))
    }

    /// Load from `path` when given, otherwise fall back to defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PsgConfig::from_toml_str(
            r#"
            [analysis]
            chunk_duration_s = 600.0
            max_workers = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.analysis.chunk_duration_s, 600.0);
        assert_eq!(config.analysis.overlap_s, 60.0);
        assert_eq!(config.analysis.max_workers, 4);
        assert_eq!(config.access.default_max_points, 2000);
        assert_eq!(config.analysis.chunk_step_s(), 540.0);
    }

    #[test]
    fn rejects_overlap_longer_than_chunk() {
        let cfg = AnalysisConfig {
            overlap_s: 300.0,
            ..AnalysisConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, PsgError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let err = PsgConfig::from_toml_str(
            r#"
            [analysis]
            apnea_threshold = 0.8
            "#,
        );
        assert!(err.is_err());
    }
}
