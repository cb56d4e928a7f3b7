//! Rolling metric windows.
//!
//! Each window keeps the most recent *N* samples; older samples fall off the
//! front as new ones arrive.
//!
//! ```rust
//! use overwatch_safety::metrics::MetricWindow;
//!
//! let mut cpu = MetricWindow::new(3);
//! cpu.push(10.0);
//! cpu.push(20.0);
//! cpu.push(30.0);
//! cpu.push(40.0); // 10.0 is evicted
//! assert_eq!(cpu.mean(), Some(30.0));
//! ```

use std::collections::VecDeque;

use crate::threshold::Metric;

// ─────────────────────────────────────────────────────────────────────────────
// MetricWindow
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MetricWindow {
    capacity: usize,
    samples: VecDeque<f64>,
}

impl MetricWindow {
    /// A `capacity` of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, sample: f64) {
        self.samples.push_back(sample);
        while self.samples.len() > self.capacity {
            self.samples.pop_front();
        }
    }

    /// `None` while the window is empty.
    pub fn mean(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<f64>() / self.samples.len() as f64)
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    pub fn samples(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().copied()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// AgentMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// The four windows kept per agent. The error window holds `1.0` for a
/// failed operation and `0.0` for a successful one, so its mean is the
/// error rate in `[0, 1]`.
#[derive(Debug, Clone)]
pub struct AgentMetrics {
    pub cpu: MetricWindow,
    pub memory: MetricWindow,
    pub latency: MetricWindow,
    pub errors: MetricWindow,
}

impl AgentMetrics {
    pub fn new(window: usize) -> Self {
        Self {
            cpu: MetricWindow::new(window),
            memory: MetricWindow::new(window),
            latency: MetricWindow::new(window),
            errors: MetricWindow::new(window),
        }
    }

    pub fn value(&self, metric: Metric) -> Option<f64> {
        match metric {
            Metric::Cpu => self.cpu.mean(),
            Metric::Memory => self.memory.mean(),
            Metric::Latency => self.latency.mean(),
            Metric::ErrorRate => self.errors.mean(),
        }
    }

    pub fn clear(&mut self) {
        self.cpu.clear();
        self.memory.clear();
        self.latency.clear();
        self.errors.clear();
    }
}

/// Mean over every sample of every window yielded by `windows`.
pub fn pooled_mean<'a>(windows: impl Iterator<Item = &'a MetricWindow>) -> Option<f64> {
    let (sum, n) = windows
        .flat_map(|w| w.samples())
        .fold((0.0, 0usize), |(s, n), x| (s + x, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_no_mean() {
        let w = MetricWindow::new(4);
        assert!(w.mean().is_none());
        assert_eq!(w.samples().count(), 0);
    }

    #[test]
    fn window_is_bounded() {
        let mut w = MetricWindow::new(2);
        for v in [1.0, 2.0, 3.0] {
            w.push(v);
        }
        assert_eq!(w.samples().collect::<Vec<_>>(), vec![2.0, 3.0]);
        assert_eq!(w.mean(), Some(2.5));
    }

    #[test]
    fn zero_capacity_keeps_one_sample() {
        let mut w = MetricWindow::new(0);
        w.push(5.0);
        w.push(7.0);
        assert_eq!(w.mean(), Some(7.0));
    }

    #[test]
    fn error_rate_is_mean_of_outcomes() {
        let mut m = AgentMetrics::new(4);
        for failed in [true, false, false, true] {
            m.errors.push(if failed { 1.0 } else { 0.0 });
        }
        assert_eq!(m.value(Metric::ErrorRate), Some(0.5));
        assert!(m.value(Metric::Cpu).is_none());
    }

    #[test]
    fn pooled_mean_weights_by_sample() {
        let mut a = MetricWindow::new(4);
        a.push(1.0);
        let mut b = MetricWindow::new(4);
        b.push(0.0);
        b.push(0.0);
        b.push(0.0);
        assert_eq!(pooled_mean([&a, &b].into_iter()), Some(0.25));
        assert!(pooled_mean(std::iter::empty()).is_none());
    }
}
