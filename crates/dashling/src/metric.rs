use std::collections::VecDeque;

/// Sliding window of samples with an incrementally maintained average.
///
/// `min` and `max` cover every sample ever added since the last reset, while
/// `average` only covers the samples still inside the window.
#[derive(Debug, Clone)]
pub struct MetricSet {
    capacity: usize,
    values: VecDeque<f64>,
    average: f64,
    min: Option<f64>,
    max: Option<f64>,
}

impl MetricSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            values: VecDeque::with_capacity(capacity),
            average: 0.0,
            min: None,
            max: None,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.values.push_back(value);
        self.average += (value - self.average) / self.values.len() as f64;

        if self.values.len() > self.capacity {
            if let Some(evicted) = self.values.pop_front() {
                self.average += (self.average - evicted) / self.values.len() as f64;
            }
        }

        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
    }

    pub fn average(&self) -> Option<f64> {
        (!self.values.is_empty()).then_some(self.average)
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn reset(&mut self) {
        self.values.clear();
        self.average = 0.0;
        self.min = None;
        self.max = None;
    }
}
