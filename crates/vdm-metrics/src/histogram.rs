//! Histogram over integer observations (virtual-time ticks or microseconds)

/// Histogram for tracking value distributions.
///
/// Bucket `i` counts observations `<= bounds[i]`; the final overflow bucket
/// counts everything larger than the last bound.
#[derive(Debug, Clone)]
pub struct Histogram {
    bounds: Vec<u64>,
    counts: Vec<u64>,
    sum: u64,
    count: u64,
    min: Option<u64>,
    max: Option<u64>,
}

impl Histogram {
    /// Create histogram with default power-of-two buckets
    pub fn new() -> Self {
        Self::with_buckets(vec![0, 1, 2, 4, 8, 16, 32, 64, 128, 256, 512, 1024])
    }

    /// Create histogram with custom bucket bounds (sorted ascending)
    pub fn with_buckets(mut bounds: Vec<u64>) -> Self {
        bounds.sort_unstable();
        bounds.dedup();
        let counts = vec![0; bounds.len() + 1];
        Histogram {
            bounds,
            counts,
            sum: 0,
            count: 0,
            min: None,
            max: None,
        }
    }

    /// Record a value
    pub fn observe(&mut self, value: u64) {
        self.sum = self.sum.saturating_add(value);
        self.count += 1;
        self.min = Some(self.min.map_or(value, |m| m.min(value)));
        self.max = Some(self.max.map_or(value, |m| m.max(value)));

        let idx = self.bounds.partition_point(|bound| *bound < value);
        self.counts[idx] += 1;
    }

    /// Get mean value
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        self.sum as f64 / self.count as f64
    }

    /// Get total count
    pub fn total_count(&self) -> u64 {
        self.count
    }

    /// Smallest observation
    pub fn min(&self) -> Option<u64> {
        self.min
    }

    /// Largest observation
    pub fn max(&self) -> Option<u64> {
        self.max
    }

    /// Bucket bounds paired with their counts; the overflow bucket has no bound
    pub fn buckets(&self) -> Vec<(Option<u64>, u64)> {
        self.bounds
            .iter()
            .map(|b| Some(*b))
            .chain(std::iter::once(None))
            .zip(self.counts.iter().copied())
            .collect()
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}
