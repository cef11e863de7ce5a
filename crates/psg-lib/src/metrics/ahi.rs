use super::stats::round_to;
use crate::detectors::EventCandidate;
use serde::{Deserialize, Serialize};

/// Clinical AHI severity bands (events per hour).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AhiSeverity {
    Normal,
    Mild,
    Moderate,
    Severe,
}

impl AhiSeverity {
    pub fn from_score(score: f64) -> Self {
        if score < 5.0 {
            AhiSeverity::Normal
        } else if score < 15.0 {
            AhiSeverity::Mild
        } else if score < 30.0 {
            AhiSeverity::Moderate
        } else {
            AhiSeverity::Severe
        }
    }

    /// Display colour used by report clients.
    pub fn color(self) -> &'static str {
        match self {
            AhiSeverity::Normal => "green",
            AhiSeverity::Mild => "yellow",
            AhiSeverity::Moderate => "orange",
            AhiSeverity::Severe => "red",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EventsPerHour {
    pub apnea_per_hour: f64,
    pub hypopnea_per_hour: f64,
}

/// AHI score with the derived summary figures. Durations are in seconds
/// unless the field name says otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AhiResult {
    pub ahi_score: f64,
    pub severity: AhiSeverity,
    pub severity_color: String,
    pub total_events: usize,
    pub apnea_count: usize,
    pub hypopnea_count: usize,
    pub recording_duration_hours: f64,
    pub total_event_duration_minutes: f64,
    pub event_percentage: f64,
    pub avg_apnea_duration: f64,
    pub avg_hypopnea_duration: f64,
    pub events_per_hour_breakdown: EventsPerHour,
}

fn total_duration(events: &[EventCandidate]) -> f64 {
    events.iter().map(|event| event.duration).sum()
}

fn mean_duration(events: &[EventCandidate]) -> f64 {
    if events.is_empty() {
        0.0
    } else {
        total_duration(events) / events.len() as f64
    }
}

/// Aggregate deduplicated apneas and hypopneas into an AHI report.
///
/// A non-positive recording length gives a score of zero and zero rates.
pub fn compute_ahi(
    apneas: &[EventCandidate],
    hypopneas: &[EventCandidate],
    recording_duration_hours: f64,
) -> AhiResult {
    let total_events = apneas.len() + hypopneas.len();
    let event_seconds = total_duration(apneas) + total_duration(hypopneas);
    let hours = recording_duration_hours.max(0.0);
    let per_hour = |count: usize| {
        if hours > 0.0 {
            count as f64 / hours
        } else {
            0.0
        }
    };
    let ahi_score = round_to(per_hour(total_events), 1);
    let event_percentage = if hours > 0.0 {
        round_to(event_seconds / (hours * 3600.0) * 100.0, 1)
    } else {
        0.0
    };
    let severity = AhiSeverity::from_score(ahi_score);

    AhiResult {
        ahi_score,
        severity,
        severity_color: severity.color().to_string(),
        total_events,
        apnea_count: apneas.len(),
        hypopnea_count: hypopneas.len(),
        recording_duration_hours: round_to(hours, 2),
        total_event_duration_minutes: round_to(event_seconds / 60.0, 1),
        event_percentage,
        avg_apnea_duration: round_to(mean_duration(apneas), 1),
        avg_hypopnea_duration: round_to(mean_duration(hypopneas), 1),
        events_per_hour_breakdown: EventsPerHour {
            apnea_per_hour: round_to(per_hour(apneas.len()), 1),
            hypopnea_per_hour: round_to(per_hour(hypopneas.len()), 1),
        },
    }
}
