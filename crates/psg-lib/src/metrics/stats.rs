use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MinMax {
    pub min: f64,
    pub max: f64,
}

/// Whole-channel summary statistics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelStats {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub num_samples: usize,
}

/// Single-pass min/max/mean/variance accumulator (Welford).
#[derive(Debug, Clone, Copy)]
pub struct RunningStats {
    count: usize,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl Default for RunningStats {
    fn default() -> Self {
        Self {
            count: 0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl RunningStats {
    pub fn push(&mut self, x: f64) {
        self.count += 1;
        let delta = x - self.mean;
        self.mean += delta / self.count as f64;
        self.m2 += delta * (x - self.mean);
        self.min = self.min.min(x);
        self.max = self.max.max(x);
    }

    pub fn extend(&mut self, block: &[f64]) {
        for &x in block {
            self.push(x);
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn min_max(&self) -> Option<MinMax> {
        (self.count > 0).then_some(MinMax {
            min: self.min,
            max: self.max,
        })
    }

    pub fn finish(&self) -> Option<ChannelStats> {
        if self.count == 0 {
            return None;
        }
        Some(ChannelStats {
            min: self.min,
            max: self.max,
            mean: self.mean,
            std_dev: (self.m2 / self.count as f64).sqrt(),
            num_samples: self.count,
        })
    }
}

/// Streaming bucket-mean reducer.
///
/// `total` input samples are split into `min(target, total)` buckets, bucket
/// `i` covering `[floor(i*total/buckets), floor((i+1)*total/buckets))`, the
/// same partition the plot decimator uses. Each bucket emits its mean, so the
/// output is deterministic and keeps temporal order. Samples may be pushed in
/// blocks of any size.
#[derive(Debug, Clone)]
pub struct BucketMeans {
    total: usize,
    buckets: usize,
    current: usize,
    seen: usize,
    next_end: usize,
    sum: f64,
    count: usize,
    out: Vec<f64>,
}

impl BucketMeans {
    pub fn new(total: usize, target: usize) -> Self {
        let buckets = target.min(total);
        let mut reducer = Self {
            total,
            buckets,
            current: 0,
            seen: 0,
            next_end: 0,
            sum: 0.0,
            count: 0,
            out: Vec::with_capacity(buckets),
        };
        reducer.next_end = reducer.bucket_end(0);
        reducer
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    fn bucket_end(&self, bucket: usize) -> usize {
        if self.buckets == 0 {
            return 0;
        }
        ((bucket as u128 + 1) * self.total as u128 / self.buckets as u128) as usize
    }

    pub fn push(&mut self, block: &[f64]) {
        for &x in block {
            if self.current >= self.buckets {
                return;
            }
            self.sum += x;
            self.count += 1;
            self.seen += 1;
            if self.seen == self.next_end {
                self.out.push(self.sum / self.count as f64);
                self.sum = 0.0;
                self.count = 0;
                self.current += 1;
                self.next_end = self.bucket_end(self.current);
            }
        }
    }

    /// Emitted means. A partially filled trailing bucket is flushed as well.
    pub fn finish(mut self) -> Vec<f64> {
        if self.count > 0 && self.current < self.buckets {
            self.out.push(self.sum / self.count as f64);
        }
        self.out
    }
}

/// Bucket-mean reduction of an in-memory slice.
pub fn bucket_means(data: &[f64], target: usize) -> Vec<f64> {
    let mut reducer = BucketMeans::new(data.len(), target);
    reducer.push(data);
    reducer.finish()
}

/// Median of `values` (mean of the middle pair for even lengths).
pub fn median(values: &mut [f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    values.sort_unstable_by(f64::total_cmp);
    Some(median_sorted(values))
}

fn median_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        0.5 * (sorted[n / 2 - 1] + sorted[n / 2])
    }
}

/// Robust amplitude estimate: the median of the absolute values at or above
/// the 25th percentile (`sorted[floor(0.25 * n)]`). Flat dropouts fall below
/// the cut and rare spikes cannot move a median.
pub fn upper_quartile_median(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut magnitudes: Vec<f64> = values.iter().map(|v| v.abs()).collect();
    magnitudes.sort_unstable_by(f64::total_cmp);
    let cut = magnitudes[(0.25 * magnitudes.len() as f64).floor() as usize];
    let first = magnitudes.partition_point(|&v| v < cut);
    Some(median_sorted(&magnitudes[first..]))
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
