use crate::{
    detectors::EventType,
    io::{
        edf_write::{write_edf, EdfHeaderFields, EdfSignal},
        memory::MemoryRecording,
    },
};
use anyhow::{bail, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;

pub const FLOW_LABEL: &str = "Flow";
pub const SPO2_LABEL: &str = "SpO2";

/// Residual flow during an apnea, as a fraction of normal amplitude.
const APNEA_RESIDUAL: f64 = 0.02;
/// Flow during a hypopnea, as a fraction of normal amplitude.
const HYPOPNEA_LEVEL: f64 = 0.4;
/// Seconds SpO2 takes to recover after an event.
const SPO2_RECOVERY_S: f64 = 20.0;

/// A respiratory event written into a synthetic recording.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScriptedEvent {
    pub kind: EventType,
    pub start_s: f64,
    pub duration_s: f64,
    /// SpO2 fall in percentage points, reached at 60% of the event.
    pub spo2_drop: f64,
}

impl ScriptedEvent {
    pub fn end_s(&self) -> f64 {
        self.start_s + self.duration_s
    }
}

/// Seeded generator for flow/SpO2 recordings with known events.
#[derive(Debug, Clone)]
pub struct SyntheticPsg {
    pub duration_s: f64,
    pub flow_rate_hz: f64,
    pub spo2_rate_hz: f64,
    pub breath_period_s: f64,
    pub amplitude: f64,
    pub spo2_baseline: f64,
    pub flow_noise: f64,
    pub spo2_noise: f64,
    pub seed: u64,
    pub events: Vec<ScriptedEvent>,
}

impl SyntheticPsg {
    pub fn new(duration_s: f64, seed: u64) -> Self {
        Self {
            duration_s,
            flow_rate_hz: 32.0,
            spo2_rate_hz: 1.0,
            breath_period_s: 4.0,
            amplitude: 1.0,
            spo2_baseline: 97.0,
            flow_noise: 0.01,
            spo2_noise: 0.2,
            seed,
            events: Vec::new(),
        }
    }

    pub fn with_rates(mut self, flow_rate_hz: f64, spo2_rate_hz: f64) -> Self {
        self.flow_rate_hz = flow_rate_hz;
        self.spo2_rate_hz = spo2_rate_hz;
        self
    }

    pub fn with_amplitude(mut self, amplitude: f64) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn apnea(mut self, start_s: f64, duration_s: f64, spo2_drop: f64) -> Self {
        self.events.push(ScriptedEvent {
            kind: EventType::Apnea,
            start_s,
            duration_s,
            spo2_drop,
        });
        self
    }

    pub fn hypopnea(mut self, start_s: f64, duration_s: f64, spo2_drop: f64) -> Self {
        self.events.push(ScriptedEvent {
            kind: EventType::Hypopnea,
            start_s,
            duration_s,
            spo2_drop,
        });
        self
    }

    /// Spread `apneas_per_hour` and `hypopneas_per_hour` events over the
    /// recording, one per slot, with seeded jitter on start and length.
    pub fn with_event_rates(mut self, apneas_per_hour: f64, hypopneas_per_hour: f64) -> Result<Self> {
        let hours = self.duration_s / 3600.0;
        let apneas = (apneas_per_hour * hours).round() as usize;
        let total = apneas + (hypopneas_per_hour * hours).round() as usize;
        if total == 0 {
            return Ok(self);
        }
        let slot = self.duration_s / total as f64;
        if slot < 60.0 {
            bail!(
                "{} events do not fit in {:.0}s (each needs a 60s slot)",
                total,
                self.duration_s
            );
        }
        let mut rng = StdRng::seed_from_u64(self.seed ^ 0x5eed);
        for i in 0..total {
            let kind = if (i + 1) * apneas / total > i * apneas / total {
                EventType::Apnea
            } else {
                EventType::Hypopnea
            };
            let start_s = i as f64 * slot + 20.0 + rng.gen_range(0.0..=10.0);
            let duration_s = rng.gen_range(12.0..=25.0_f64).min(slot - 35.0);
            let spo2_drop = match kind {
                EventType::Apnea => 5.0,
                EventType::Hypopnea => 4.0,
            };
            self.events.push(ScriptedEvent {
                kind,
                start_s,
                duration_s,
                spo2_drop,
            });
        }
        Ok(self)
    }

    fn event_at(&self, t: f64) -> Option<&ScriptedEvent> {
        self.events.iter().find(|e| t >= e.start_s && t < e.end_s())
    }

    pub fn flow(&self) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed);
        let n = (self.duration_s * self.flow_rate_hz).floor() as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / self.flow_rate_hz;
                let level = match self.event_at(t).map(|e| e.kind) {
                    Some(EventType::Apnea) => APNEA_RESIDUAL,
                    Some(EventType::Hypopnea) => HYPOPNEA_LEVEL,
                    None => 1.0,
                };
                let breath = (2.0 * PI * t / self.breath_period_s).sin();
                let noise = if self.flow_noise > 0.0 {
                    rng.gen_range(-self.flow_noise..=self.flow_noise)
                } else {
                    0.0
                };
                self.amplitude * (level * breath + noise)
            })
            .collect()
    }

    pub fn spo2(&self) -> Vec<f64> {
        let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(1));
        let n = (self.duration_s * self.spo2_rate_hz).floor() as usize;
        (0..n)
            .map(|i| {
                let t = i as f64 / self.spo2_rate_hz;
                let dip = self
                    .events
                    .iter()
                    .map(|e| spo2_dip(e, t))
                    .fold(0.0, f64::max);
                let noise = if self.spo2_noise > 0.0 {
                    rng.gen_range(-self.spo2_noise..=self.spo2_noise)
                } else {
                    0.0
                };
                (self.spo2_baseline - dip + noise).min(100.0)
            })
            .collect()
    }

    pub fn recording(&self) -> MemoryRecording {
        MemoryRecording::new(self.duration_s)
            .with_channel(FLOW_LABEL, self.flow_rate_hz, self.flow())
            .with_channel(SPO2_LABEL, self.spo2_rate_hz, self.spo2())
            .with_patient("X X X Synthetic")
    }

    pub fn write_edf(&self, path: &Path) -> Result<()> {
        write_edf(
            path,
            &EdfHeaderFields {
                patient: "X X X Synthetic".into(),
                recording: format!("Startdate X X X seed={}", self.seed),
                ..EdfHeaderFields::default()
            },
            &[
                EdfSignal::new(FLOW_LABEL, "L/s", self.flow_rate_hz, self.flow()),
                EdfSignal::new(SPO2_LABEL, "%", self.spo2_rate_hz, self.spo2()),
            ],
        )
    }

    pub fn count(&self, kind: EventType) -> usize {
        self.events.iter().filter(|e| e.kind == kind).count()
    }
}

/// SpO2 depression contributed by one event at time `t`.
fn spo2_dip(event: &ScriptedEvent, t: f64) -> f64 {
    let ramp_end = event.start_s + 0.6 * event.duration_s;
    if t < event.start_s || t >= event.end_s() + SPO2_RECOVERY_S {
        0.0
    } else if t < ramp_end {
        event.spo2_drop * (t - event.start_s) / (ramp_end - event.start_s)
    } else if t < event.end_s() {
        event.spo2_drop
    } else {
        event.spo2_drop * (1.0 - (t - event.end_s()) / SPO2_RECOVERY_S)
    }
}
