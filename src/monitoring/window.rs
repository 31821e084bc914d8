use std::collections::VecDeque;

/// Bounded sliding window of samples with percentile readout.
///
/// Reads never mutate the live buffer: aggregation sorts a copy.
#[derive(Debug)]
pub struct SampleWindow {
    cap: usize,
    values: VecDeque<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct WindowSummary {
    pub count: usize,
    pub mean: f64,
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            values: VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: f64) {
        if !value.is_finite() {
            return;
        }
        if self.values.len() == self.cap {
            self.values.pop_front();
        }
        self.values.push_back(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Percentile by sorted-index: element at `⌊p·N⌋` of the sorted copy.
    pub fn summary(&self) -> Option<WindowSummary> {
        if self.values.is_empty() {
            return None;
        }

        let mut sorted: Vec<f64> = self.values.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let n = sorted.len();
        let at = |p: f64| sorted[(((p * n as f64).floor()) as usize).min(n - 1)];

        Some(WindowSummary {
            count: n,
            mean: sorted.iter().sum::<f64>() / n as f64,
            p50: at(0.50),
            p95: at(0.95),
            p99: at(0.99),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_window_has_no_summary() {
        assert!(SampleWindow::new(10).summary().is_none());
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut w = SampleWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            w.push(v);
        }
        assert_eq!(w.len(), 3);
        let s = w.summary().unwrap();
        assert_eq!(s.p50, 3.0);
        assert!((s.mean - 3.0).abs() < 1e-12);
    }

    #[test]
    fn non_finite_samples_are_ignored() {
        let mut w = SampleWindow::new(10);
        w.push(f64::NAN);
        w.push(f64::INFINITY);
        assert!(w.is_empty());
    }

    #[test]
    fn percentile_uses_floor_index_of_sorted_copy() {
        let mut w = SampleWindow::new(100);
        // 0..100 shuffled-ish insertion order; summary must sort a copy.
        for v in (0..100).rev() {
            w.push(v as f64);
        }
        let s = w.summary().unwrap();
        assert_eq!(s.p50, 50.0);
        assert_eq!(s.p95, 95.0);
        assert_eq!(s.p99, 99.0);
    }

    #[test]
    fn summary_does_not_mutate_the_buffer() {
        let mut w = SampleWindow::new(10);
        for v in [3.0, 1.0, 2.0] {
            w.push(v);
        }
        let _ = w.summary();
        let order: Vec<f64> = w.values.iter().copied().collect();
        assert_eq!(order, vec![3.0, 1.0, 2.0]);
    }

    proptest! {
        #[test]
        fn p95_matches_sorted_index(samples in proptest::collection::vec(0.0f64..1_000.0, 1..200)) {
            let mut w = SampleWindow::new(1_000);
            for s in &samples {
                w.push(*s);
            }

            let mut sorted = samples.clone();
            sorted.sort_by(|a, b| a.partial_cmp(b).unwrap());
            let n = sorted.len();
            let expected = sorted[(((0.95 * n as f64).floor()) as usize).min(n - 1)];

            prop_assert_eq!(w.summary().unwrap().p95, expected);
        }
    }
}
