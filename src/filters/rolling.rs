use std::collections::VecDeque;

/// Fixed-capacity FIFO of recently accepted deltas (meters).
///
/// Only the odometer pushes into it, and only for accepted or adjusted
/// deltas; the mean drives the policy engine's rolling-average cap.
#[derive(Clone, Debug)]
pub struct RollingWindow {
    values: VecDeque<f64>,
    capacity: usize,
}

impl RollingWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        RollingWindow {
            values: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a value, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, value: f64) {
        self.values.push_back(value);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    /// Arithmetic mean, or `None` while empty.
    pub fn mean(&self) -> Option<f64> {
        if self.values.is_empty() {
            return None;
        }
        Some(self.values.iter().sum::<f64>() / self.values.len() as f64)
    }

    /// Change capacity, dropping the oldest entries if it shrinks.
    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
        while self.values.len() > self.capacity {
            self.values.pop_front();
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
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

    /// Oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.values.iter()
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.iter().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_mean() {
        let window = RollingWindow::new(5);
        assert!(window.mean().is_none());
        assert!(window.is_empty());
    }

    #[test]
    fn test_mean() {
        let mut window = RollingWindow::new(5);
        window.push(2.0);
        window.push(4.0);
        assert_eq!(window.mean(), Some(3.0));
    }

    #[test]
    fn test_fifo_eviction() {
        let mut window = RollingWindow::new(3);
        for v in [1.0, 2.0, 3.0, 4.0] {
            window.push(v);
        }
        assert_eq!(window.len(), 3);
        assert_eq!(window.to_vec(), vec![2.0, 3.0, 4.0]);
        assert_eq!(window.mean(), Some(3.0));
    }

    #[test]
    fn test_resize_drops_oldest() {
        let mut window = RollingWindow::new(5);
        for v in 1..=5 {
            window.push(v as f64);
        }
        window.resize(3);
        assert_eq!(window.capacity(), 3);
        assert_eq!(window.to_vec(), vec![3.0, 4.0, 5.0]);
    }

    #[test]
    fn test_clear() {
        let mut window = RollingWindow::new(3);
        window.push(1.0);
        window.clear();
        assert!(window.mean().is_none());
    }
}
