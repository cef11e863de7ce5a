pub mod edf;
pub mod edf_write;
pub mod events_tsv;
pub mod memory;

use crate::error::{PsgError, PsgResult};
use crate::metrics::stats::{BucketMeans, ChannelStats, MinMax, RunningStats};
use crate::signal::{ChannelDescriptor, RecordingInfo};

/// Samples pulled per step when a source has no better block size.
pub const DEFAULT_STREAM_BLOCK: usize = 1 << 16;

/// Reader capability set for one opened recording.
///
/// Implementors provide header info and raw range extraction; the reductions
/// (downsampled range, min/max, full statistics) stream over `read_samples`
/// one block at a time so that no call materialises a whole channel.
pub trait RecordingSource {
    fn info(&self) -> &RecordingInfo;

    /// Raw samples `[start, start + len)` of the channel at `channel`
    /// (an index into `info().channels`).
    fn read_samples(&self, channel: usize, start: usize, len: usize) -> PsgResult<Vec<f64>>;

    /// Streaming block size for `channel`.
    fn preferred_block(&self, _channel: usize) -> usize {
        DEFAULT_STREAM_BLOCK
    }

    fn resolve(&self, label: &str) -> PsgResult<usize> {
        self.info()
            .channel_index(label)
            .ok_or_else(|| PsgError::ChannelNotFound(label.to_string()))
    }

    fn descriptor(&self, channel: usize) -> PsgResult<&ChannelDescriptor> {
        self.info()
            .channels
            .get(channel)
            .ok_or_else(|| PsgError::ChannelNotFound(format!("#{}", channel)))
    }

    fn check_range(&self, channel: usize, start: usize, len: usize) -> PsgResult<()> {
        let desc = self.descriptor(channel)?;
        let end = start.checked_add(len).ok_or_else(|| {
            PsgError::invalid(format!("range {}+{} overflows", start, len))
        })?;
        if end > desc.total_samples {
            return Err(PsgError::OutOfRange {
                channel: desc.label.clone(),
                start,
                end,
                total: desc.total_samples,
            });
        }
        Ok(())
    }

    /// Feed `[start, start + len)` to `sink` in reader-sized blocks.
    fn for_each_block(
        &self,
        channel: usize,
        start: usize,
        len: usize,
        sink: &mut dyn FnMut(&[f64]),
    ) -> PsgResult<()> {
        self.check_range(channel, start, len)?;
        let block = self.preferred_block(channel).max(1);
        let end = start + len;
        let mut cursor = start;
        while cursor < end {
            let take = block.min(end - cursor);
            let samples = self.read_samples(channel, cursor, take)?;
            if samples.len() != take {
                return Err(PsgError::upstream(
                    "reader returned a short block",
                    format!("expected {} samples at {}, got {}", take, cursor, samples.len()),
                ));
            }
            sink(&samples);
            cursor += take;
        }
        Ok(())
    }

    /// Bucket-mean reduction of `[start, start + len)` to at most `target` points.
    fn read_downsampled(
        &self,
        channel: usize,
        start: usize,
        len: usize,
        target: usize,
    ) -> PsgResult<Vec<f64>> {
        if target >= len {
            self.check_range(channel, start, len)?;
            return self.read_samples(channel, start, len);
        }
        let mut reducer = BucketMeans::new(len, target);
        self.for_each_block(channel, start, len, &mut |block: &[f64]| reducer.push(block))?;
        Ok(reducer.finish())
    }

    fn min_max(&self, channel: usize, start: usize, len: usize) -> PsgResult<Option<MinMax>> {
        let mut stats = RunningStats::default();
        self.for_each_block(channel, start, len, &mut |block: &[f64]| stats.extend(block))?;
        Ok(stats.min_max())
    }

    fn full_stats(&self, channel: usize) -> PsgResult<Option<ChannelStats>> {
        let total = self.descriptor(channel)?.total_samples;
        let mut stats = RunningStats::default();
        self.for_each_block(channel, 0, total, &mut |block: &[f64]| stats.extend(block))?;
        Ok(stats.finish())
    }
}

impl<T: RecordingSource + ?Sized> RecordingSource for std::sync::Arc<T> {
    fn info(&self) -> &RecordingInfo {
        (**self).info()
    }

    fn read_samples(&self, channel: usize, start: usize, len: usize) -> PsgResult<Vec<f64>> {
        (**self).read_samples(channel, start, len)
    }

    fn preferred_block(&self, channel: usize) -> usize {
        (**self).preferred_block(channel)
    }
}
