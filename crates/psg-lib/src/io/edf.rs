use super::{RecordingSource, DEFAULT_STREAM_BLOCK};
use crate::error::{PsgError, PsgResult};
use crate::signal::{ChannelDescriptor, RecordingInfo};
use edf_reader::file_reader::SyncFileReader;
use edf_reader::sync_reader::SyncEDFReader;
use log::debug;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const ANNOTATION_LABEL: &str = "EDF Annotations";

/// EDF reader backend over one open file handle.
///
/// The handle stays open for as long as the recording does, so a concurrent
/// cleanup that unlinks the path cannot cut a read short.
struct DiskFileReader {
    path: PathBuf,
    file: Mutex<File>,
}

impl DiskFileReader {
    fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(File::open(path)?),
        })
    }
}

impl SyncFileReader for DiskFileReader {
    fn read(&self, offset: u64, length: u64) -> Result<Vec<u8>, std::io::Error> {
        let mut file = self.file.lock().map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("file handle for {} is poisoned", self.path.display()),
            )
        })?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// An EDF file opened for the duration of one or more requests.
pub struct EdfRecording {
    path: PathBuf,
    reader: SyncEDFReader<DiskFileReader>,
    info: RecordingInfo,
    /// Index into the EDF signal list for every exposed channel.
    signal_index: Vec<usize>,
    samples_per_record: Vec<usize>,
    record_ms: u64,
    records: u64,
    stream_block: usize,
}

impl EdfRecording {
    pub fn open(path: &Path) -> PsgResult<Self> {
        let file_reader = DiskFileReader::open(path).map_err(|err| PsgError::FileUnavailable {
            path: path.display().to_string(),
            reason: err.to_string(),
        })?;
        // Fixed-width identification fields of the 256-byte main header.
        let ident = file_reader.read(0, 184).map_err(|err| {
            PsgError::upstream(
                format!("{} is too short to be an EDF file", path.display()),
                err,
            )
        })?;
        let reader = SyncEDFReader::init_with_file_reader(file_reader).map_err(|err| {
            PsgError::upstream(format!("failed to parse EDF header of {}", path.display()), err)
        })?;

        let header = &reader.edf_header;
        let record_ms = header.block_duration as u64;
        let records = header.number_of_blocks as u64;
        if record_ms == 0 {
            return Err(PsgError::upstream(
                format!("{} declares a zero-length data record", path.display()),
                "block duration is 0 ms",
            ));
        }

        let mut channels = Vec::new();
        let mut signal_index = Vec::new();
        let mut samples_per_record = Vec::new();
        for (idx, channel) in header.channels.iter().enumerate() {
            let label = channel.label.trim().to_string();
            if label == ANNOTATION_LABEL {
                continue;
            }
            let per_record = channel.number_of_samples_in_data_record as usize;
            let sample_rate = per_record as f64 * 1000.0 / record_ms as f64;
            channels.push(ChannelDescriptor {
                label,
                sample_rate,
                total_samples: per_record * records as usize,
            });
            signal_index.push(idx);
            samples_per_record.push(per_record);
        }

        let info = RecordingInfo {
            channels,
            duration_s: (record_ms * records) as f64 / 1000.0,
            patient: ascii_field(&ident, 8, 88),
            recording: ascii_field(&ident, 88, 168),
            start_date: ascii_field(&ident, 168, 176),
            start_time: ascii_field(&ident, 176, 184),
        };
        debug!(
            "opened {} ({} channels, {} records of {} ms)",
            path.display(),
            info.channels.len(),
            records,
            record_ms
        );

        Ok(Self {
            path: path.to_path_buf(),
            reader,
            info,
            signal_index,
            samples_per_record,
            record_ms,
            records,
            stream_block: DEFAULT_STREAM_BLOCK,
        })
    }

    /// Override the number of samples pulled per streaming step.
    pub fn with_stream_block(mut self, samples: usize) -> Self {
        self.stream_block = samples.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordingSource for EdfRecording {
    fn info(&self) -> &RecordingInfo {
        &self.info
    }

    fn read_samples(&self, channel: usize, start: usize, len: usize) -> PsgResult<Vec<f64>> {
        self.check_range(channel, start, len)?;
        if len == 0 {
            return Ok(Vec::new());
        }
        let per_record = self.samples_per_record[channel];
        let first_record = (start / per_record) as u64;
        let last_record = ((start + len + per_record - 1) / per_record) as u64;
        // One trailing record of slack keeps the slice safe if the reader
        // rounds the window end down.
        let end_record = (last_record + 1).min(self.records);
        let window = self
            .reader
            .read_data_window(
                first_record * self.record_ms,
                (end_record - first_record) * self.record_ms,
            )
            .map_err(|err| {
                PsgError::upstream(
                    format!(
                        "failed to read records {}..{} of {}",
                        first_record,
                        end_record,
                        self.path.display()
                    ),
                    err,
                )
            })?;
        let samples = window.get(self.signal_index[channel]).ok_or_else(|| {
            PsgError::upstream(
                "EDF reader returned no data for channel",
                self.info.channels[channel].label.clone(),
            )
        })?;
        let offset = start - first_record as usize * per_record;
        if offset + len > samples.len() {
            return Err(PsgError::upstream(
                "EDF reader returned fewer samples than requested",
                format!(
                    "{}: needed {} samples from offset {}, got {}",
                    self.info.channels[channel].label,
                    len,
                    offset,
                    samples.len()
                ),
            ));
        }
        Ok(samples[offset..offset + len]
            .iter()
            .map(|value| *value as f64)
            .collect())
    }

    fn preferred_block(&self, channel: usize) -> usize {
        let per_record = self.samples_per_record.get(channel).copied().unwrap_or(1).max(1);
        (self.stream_block / per_record).max(1) * per_record
    }
}

fn ascii_field(bytes: &[u8], start: usize, end: usize) -> Option<String> {
    let field = bytes.get(start..end.min(bytes.len()))?;
    let text = String::from_utf8_lossy(field).trim().to_string();
    (!text.is_empty()).then_some(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::edf_write::{write_edf, EdfHeaderFields, EdfSignal};

    fn write_fixture(dir: &Path) -> PathBuf {
        let path = dir.join("fixture.edf");
        let flow: Vec<f64> = (0..32 * 20).map(|i| ((i % 64) as f64 - 32.0) / 32.0).collect();
        let spo2: Vec<f64> = (0..20).map(|i| 90.0 + (i % 10) as f64).collect();
        write_edf(
            &path,
            &EdfHeaderFields {
                patient: "X F 01-JAN-1970 Test_Patient".into(),
                recording: "Startdate 01-JAN-2024 PSG".into(),
                ..EdfHeaderFields::default()
            },
            &[
                EdfSignal::new("Flow", "L/s", 32.0, flow),
                EdfSignal::new("SpO2", "%", 1.0, spo2),
            ],
        )
        .expect("write fixture");
        path
    }

    #[test]
    fn reads_header_and_per_channel_rates() {
        let dir = tempfile::tempdir().unwrap();
        let rec = EdfRecording::open(&write_fixture(dir.path())).expect("open EDF");
        let info = rec.info();
        assert_eq!(info.labels(), vec!["Flow".to_string(), "SpO2".to_string()]);
        assert!((info.duration_s - 20.0).abs() < 1e-9);
        assert_eq!(info.channels[0].sample_rate, 32.0);
        assert_eq!(info.channels[0].total_samples, 640);
        assert_eq!(info.channels[1].total_samples, 20);
        assert_eq!(info.patient.as_deref(), Some("X F 01-JAN-1970 Test_Patient"));
    }

    #[test]
    fn extracts_unaligned_ranges() {
        let dir = tempfile::tempdir().unwrap();
        let rec = EdfRecording::open(&write_fixture(dir.path())).unwrap();
        let samples = rec.read_samples(0, 70, 100).unwrap();
        assert_eq!(samples.len(), 100);
        for (i, value) in samples.iter().enumerate() {
            let expected = (((70 + i) % 64) as f64 - 32.0) / 32.0;
            assert!((value - expected).abs() < 1e-3, "sample {}: {}", i, value);
        }
        let tail = rec.read_samples(1, 15, 5).unwrap();
        assert!((tail[0] - 95.0).abs() < 1e-2);
    }

    #[test]
    fn range_past_end_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rec = EdfRecording::open(&write_fixture(dir.path())).unwrap();
        assert!(matches!(
            rec.read_samples(1, 15, 6),
            Err(PsgError::OutOfRange { .. })
        ));
        assert_eq!(rec.read_samples(1, 20, 0).unwrap(), Vec::<f64>::new());
    }

    #[test]
    fn missing_file_is_unavailable() {
        let err = EdfRecording::open(Path::new("/definitely/not/here.edf"))
            .err()
            .expect("open should fail");
        assert!(matches!(err, PsgError::FileUnavailable { .. }));
    }
}
