use crate::{MetricKind, MetricObserver, Observation};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// An observation of a single `u64` value that may go up and down.
#[derive(Debug, Clone, Default)]
pub struct U64Gauge {
    state: Arc<AtomicU64>,
}

impl U64Gauge {
    /// Sets the value of this gauge.
    pub fn set(&self, value: u64) {
        self.state.store(value, Ordering::Relaxed);
    }

    /// Increments the value of this gauge by `delta`.
    pub fn inc(&self, delta: u64) {
        self.state.fetch_add(delta, Ordering::Relaxed);
    }

    /// Decrements the value of this gauge by `delta`, wrapping on
    /// underflow.
    pub fn dec(&self, delta: u64) {
        self.state.fetch_sub(delta, Ordering::Relaxed);
    }

    /// Fetches the current value.
    pub fn fetch(&self) -> u64 {
        self.state.load(Ordering::Relaxed)
    }
}

impl MetricObserver for U64Gauge {
    type Recorder = Self;

    fn kind() -> MetricKind {
        MetricKind::U64Gauge
    }

    fn recorder(&self) -> Self::Recorder {
        self.clone()
    }

    fn observe(&self) -> Observation {
        Observation::U64Gauge(self.fetch())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge() {
        let gauge = U64Gauge::default();
        assert_eq!(gauge.observe(), Observation::U64Gauge(0));

        gauge.set(345);
        assert_eq!(gauge.observe(), Observation::U64Gauge(345));

        gauge.set(23);
        gauge.inc(10);
        gauge.dec(5);
        assert_eq!(gauge.observe(), Observation::U64Gauge(28));
    }
}
