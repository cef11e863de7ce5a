use anyhow::{bail, Context, Result};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

const DIGITAL_MIN: f64 = -32768.0;
const DIGITAL_MAX: f64 = 32767.0;
const RECORD_SECONDS: usize = 1;

/// One signal to be written. The sample rate must be a whole number of Hz.
#[derive(Debug, Clone)]
pub struct EdfSignal {
    pub label: String,
    pub physical_dimension: String,
    pub sample_rate: f64,
    pub data: Vec<f64>,
}

impl EdfSignal {
    pub fn new(label: &str, physical_dimension: &str, sample_rate: f64, data: Vec<f64>) -> Self {
        Self {
            label: label.to_string(),
            physical_dimension: physical_dimension.to_string(),
            sample_rate,
            data,
        }
    }
}

/// Identification fields of the main header.
#[derive(Debug, Clone)]
pub struct EdfHeaderFields {
    pub patient: String,
    pub recording: String,
    /// dd.mm.yy
    pub start_date: String,
    /// hh.mm.ss
    pub start_time: String,
}

impl Default for EdfHeaderFields {
    fn default() -> Self {
        Self {
            patient: "X X X X".into(),
            recording: "Startdate X X X X".into(),
            start_date: "01.01.00".into(),
            start_time: "00.00.00".into(),
        }
    }
}

/// Write a space-padded ASCII field of exact width.
fn write_field<W: Write>(out: &mut W, value: &str, width: usize) -> Result<()> {
    let mut buf = value.as_bytes().to_vec();
    buf.resize(width, b' ');
    buf.truncate(width);
    out.write_all(&buf)?;
    Ok(())
}

fn to_digital(value: f64, phys_min: f64, phys_max: f64) -> i16 {
    let scaled =
        DIGITAL_MIN + (value - phys_min) / (phys_max - phys_min) * (DIGITAL_MAX - DIGITAL_MIN);
    scaled.round().clamp(DIGITAL_MIN, DIGITAL_MAX) as i16
}

/// Format a number for an 8-character header field.
fn format_edf_num(val: f64) -> String {
    for precision in (0..=6).rev() {
        let s = format!("{:.prec$}", val, prec = precision);
        if s.len() <= 8 {
            return s;
        }
    }
    format!("{:.0}", val)
}

/// Physical range that is never degenerate and survives header formatting.
fn physical_range(data: &[f64]) -> (f64, f64) {
    let lo = data.iter().cloned().fold(f64::INFINITY, f64::min);
    let hi = data.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    if !lo.is_finite() || !hi.is_finite() {
        return (-1.0, 1.0);
    }
    let margin = ((hi - lo) * 0.01).max(0.1);
    let lo: f64 = format_edf_num(lo - margin).parse().unwrap_or(lo - margin);
    let hi: f64 = format_edf_num(hi + margin).parse().unwrap_or(hi + margin);
    (lo, hi)
}

/// Write a plain EDF file with one-second data records. Signals may have
/// different rates; each is padded with its last sample to a whole record.
pub fn write_edf(path: &Path, fields: &EdfHeaderFields, signals: &[EdfSignal]) -> Result<()> {
    if signals.is_empty() {
        bail!("an EDF file needs at least one signal");
    }
    let mut per_record = Vec::with_capacity(signals.len());
    for signal in signals {
        let n = signal.sample_rate * RECORD_SECONDS as f64;
        if n < 1.0 || (n - n.round()).abs() > 1e-9 {
            bail!(
                "signal {} has rate {} Hz, which is not a whole number of samples per record",
                signal.label,
                signal.sample_rate
            );
        }
        per_record.push(n.round() as usize);
    }
    let n_records = signals
        .iter()
        .zip(&per_record)
        .map(|(signal, &n)| (signal.data.len() + n - 1) / n)
        .max()
        .unwrap_or(0);
    let ranges: Vec<(f64, f64)> = signals.iter().map(|s| physical_range(&s.data)).collect();

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut out = BufWriter::new(file);

    write_field(&mut out, "0", 8)?;
    write_field(&mut out, &fields.patient, 80)?;
    write_field(&mut out, &fields.recording, 80)?;
    write_field(&mut out, &fields.start_date, 8)?;
    write_field(&mut out, &fields.start_time, 8)?;
    write_field(&mut out, &(256 + signals.len() * 256).to_string(), 8)?;
    write_field(&mut out, "", 44)?;
    write_field(&mut out, &n_records.to_string(), 8)?;
    write_field(&mut out, &RECORD_SECONDS.to_string(), 8)?;
    write_field(&mut out, &signals.len().to_string(), 4)?;

    // Signal headers are interleaved field by field.
    for signal in signals {
        write_field(&mut out, &signal.label, 16)?;
    }
    for _ in signals {
        write_field(&mut out, "", 80)?;
    }
    for signal in signals {
        write_field(&mut out, &signal.physical_dimension, 8)?;
    }
    for (lo, _) in &ranges {
        write_field(&mut out, &format_edf_num(*lo), 8)?;
    }
    for (_, hi) in &ranges {
        write_field(&mut out, &format_edf_num(*hi), 8)?;
    }
    for _ in signals {
        write_field(&mut out, "-32768", 8)?;
    }
    for _ in signals {
        write_field(&mut out, "32767", 8)?;
    }
    for _ in signals {
        write_field(&mut out, "", 80)?;
    }
    for n in &per_record {
        write_field(&mut out, &n.to_string(), 8)?;
    }
    for _ in signals {
        write_field(&mut out, "", 32)?;
    }

    for rec in 0..n_records {
        for ((signal, &n), &(lo, hi)) in signals.iter().zip(&per_record).zip(&ranges) {
            let pad = signal.data.last().copied().unwrap_or(0.0);
            for idx in rec * n..(rec + 1) * n {
                let value = signal.data.get(idx).copied().unwrap_or(pad);
                out.write_all(&to_digital(value, lo, hi).to_le_bytes())?;
            }
        }
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_size_matches_signal_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("two.edf");
        write_edf(
            &path,
            &EdfHeaderFields::default(),
            &[
                EdfSignal::new("Flow", "L/s", 10.0, vec![0.5; 25]),
                EdfSignal::new("SpO2", "%", 1.0, vec![97.0; 3]),
            ],
        )
        .unwrap();
        let bytes = std::fs::read(&path).unwrap();
        // 3 records of (10 + 1) two-byte samples after a 768-byte header.
        assert_eq!(bytes.len(), 768 + 3 * 11 * 2);
        assert_eq!(&bytes[184..187], b"768");
        assert_eq!(&bytes[236..237], b"3");
    }

    #[test]
    fn rejects_fractional_rates() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_edf(
            &dir.path().join("bad.edf"),
            &EdfHeaderFields::default(),
            &[EdfSignal::new("Flow", "L/s", 12.5, vec![0.0; 10])],
        );
        assert!(err.is_err());
    }

    #[test]
    fn digital_mapping_spans_full_range() {
        assert_eq!(to_digital(-1.0, -1.0, 1.0), -32768);
        assert_eq!(to_digital(1.0, -1.0, 1.0), 32767);
        assert_eq!(format_edf_num(-1234.56789), "-1234.57");
    }
}
