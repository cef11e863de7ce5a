use crate::detectors::EventCandidate;
use anyhow::{Context, Result};
use csv::WriterBuilder;
use std::fs;
use std::path::Path;

const COLUMNS: [&str; 8] = [
    "onset",
    "duration",
    "trial_type",
    "severity",
    "flow_reduction_percent",
    "spo2_drop",
    "confidence",
    "chunk_index",
];

/// Write detected events as a BIDS-style `events.tsv`.
pub fn write_events_tsv(path: &Path, events: &[EventCandidate]) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = WriterBuilder::new().delimiter(b'\t').from_writer(file);
    writer.write_record(COLUMNS)?;
    for event in events {
        writer.write_record(&[
            format!("{:.3}", event.start_time),
            format!("{:.3}", event.duration),
            event.event_type.as_str().to_string(),
            event.severity.as_str().to_string(),
            format!("{:.1}", event.flow_reduction_percent),
            event
                .spo2_drop
                .map(|v| format!("{:.1}", v))
                .unwrap_or_else(|| "n/a".into()),
            format!("{:.2}", event.confidence),
            event.chunk_index.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Column descriptions for the `events.json` sidecar.
pub fn write_events_json(path: &Path) -> Result<()> {
    let metadata = serde_json::json!({
        "onset": { "Description": "Event start", "Units": "s" },
        "duration": { "Description": "Event length", "Units": "s" },
        "trial_type": {
            "Description": "Respiratory event type",
            "Levels": {
                "apnea": "flow reduced by 90% or more",
                "hypopnea": "flow reduced by 30% or more with desaturation"
            }
        },
        "severity": { "Description": "Per-event grade (mild, moderate, severe)" },
        "flow_reduction_percent": { "Description": "Flow reduction at event onset", "Units": "%" },
        "spo2_drop": { "Description": "SpO2 baseline minus nadir", "Units": "%" },
        "confidence": { "Description": "Detector confidence in [0, 1]" },
        "chunk_index": { "Description": "Analysis chunk that reported the event" },
    });
    fs::write(path, serde_json::to_string_pretty(&metadata)?)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detectors::EventType;
    use csv::{ReaderBuilder, Trim};
    use tempfile::tempdir;

    #[test]
    fn writes_one_row_per_event() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.tsv");
        let mut hypopnea = EventCandidate::bare(EventType::Hypopnea, 130.0, 145.5);
        hypopnea.spo2_drop = Some(4.2);
        let events = vec![EventCandidate::bare(EventType::Apnea, 12.0, 24.0), hypopnea];
        write_events_tsv(&path, &events).unwrap();

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .trim(Trim::All)
            .from_path(&path)
            .unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "onset");
        assert_eq!(&headers[2], "trial_type");
        let rows: Vec<csv::StringRecord> = reader.records().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(&rows[0][2], "apnea");
        assert_eq!(&rows[0][5], "n/a");
        assert_eq!(&rows[1][1], "15.500");
        assert_eq!(&rows[1][3], "severe");
        assert_eq!(&rows[1][5], "4.2");
    }
}
