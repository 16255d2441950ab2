//! Metrics registry

use crate::Histogram;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[derive(Default)]
struct Registry {
    counters: BTreeMap<String, u64>,
    gauges: BTreeMap<String, i64>,
    histograms: BTreeMap<String, Histogram>,
}

/// Thread-safe metrics storage.
///
/// Names are kept in sorted maps so snapshots of two identical runs compare
/// equal byte for byte.
#[derive(Default)]
pub struct Metrics {
    inner: RwLock<Registry>,
}

impl Metrics {
    /// Create a new metrics store
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment a counter
    pub fn counter(&self, name: &str, delta: u64) {
        let mut inner = self.inner.write();
        *inner.counters.entry(name.to_string()).or_insert(0) += delta;
    }

    /// Set a gauge value
    pub fn gauge(&self, name: &str, value: i64) {
        self.inner.write().gauges.insert(name.to_string(), value);
    }

    /// Record a histogram observation
    pub fn observe(&self, name: &str, value: u64) {
        let mut inner = self.inner.write();
        inner
            .histograms
            .entry(name.to_string())
            .or_default()
            .observe(value);
    }

    /// Get counter value
    pub fn get_counter(&self, name: &str) -> Option<u64> {
        self.inner.read().counters.get(name).copied()
    }

    /// Get gauge value
    pub fn get_gauge(&self, name: &str) -> Option<i64> {
        self.inner.read().gauges.get(name).copied()
    }

    /// Get histogram mean for a metric
    pub fn get_histogram_mean(&self, name: &str) -> Option<f64> {
        self.inner.read().histograms.get(name).map(|h| h.mean())
    }

    /// Get histogram observation count
    pub fn histogram_count(&self, name: &str) -> Option<u64> {
        self.inner.read().histograms.get(name).map(|h| h.total_count())
    }

    /// Copy of a histogram
    pub fn histogram(&self, name: &str) -> Option<Histogram> {
        self.inner.read().histograms.get(name).cloned()
    }

    /// All counter names and values, sorted by name
    pub fn all_counters(&self) -> Vec<(String, u64)> {
        self.inner
            .read()
            .counters
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// All gauge names and values, sorted by name
    pub fn all_gauges(&self) -> Vec<(String, i64)> {
        self.inner
            .read()
            .gauges
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }

    /// All histograms, sorted by name
    pub fn all_histograms(&self) -> Vec<(String, Histogram)> {
        self.inner
            .read()
            .histograms
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Forget every metric
    pub fn clear(&self) {
        *self.inner.write() = Registry::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter() {
        let metrics = Metrics::new();
        metrics.counter("test", 1);
        metrics.counter("test", 2);
        assert_eq!(metrics.get_counter("test"), Some(3));
        assert_eq!(metrics.get_counter("missing"), None);
    }

    #[test]
    fn test_gauge() {
        let metrics = Metrics::new();
        metrics.gauge("test", 42);
        assert_eq!(metrics.get_gauge("test"), Some(42));
        metrics.gauge("test", -10);
        assert_eq!(metrics.get_gauge("test"), Some(-10));
    }

    #[test]
    fn test_histogram() {
        let metrics = Metrics::new();
        metrics.observe("test", 100);
        metrics.observe("test", 200);
        assert_eq!(metrics.get_histogram_mean("test"), Some(150.0));
        assert_eq!(metrics.histogram("test").and_then(|h| h.max()), Some(200));
    }

    #[test]
    fn test_all_counters_sorted() {
        let metrics = Metrics::new();
        metrics.counter("b", 1);
        metrics.counter("a", 1);
        let names: Vec<String> = metrics.all_counters().into_iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_clear() {
        let metrics = Metrics::new();
        metrics.counter("a", 1);
        metrics.clear();
        assert!(metrics.all_counters().is_empty());
    }
}
