use std::sync::atomic::{AtomicU64, Ordering};

/// Lifetime counters maintained by whoever starts and stops virtual users.
#[derive(Debug, Default)]
pub struct ThreadTracker {
    started: AtomicU64,
    finished: AtomicU64,
}

impl ThreadTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn thread_started(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn thread_finished(&self) {
        self.finished.fetch_add(1, Ordering::Relaxed);
    }

    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Relaxed)
    }

    pub fn finished(&self) -> u64 {
        self.finished.load(Ordering::Relaxed)
    }

    pub fn active(&self) -> u64 {
        self.started().saturating_sub(self.finished())
    }
}

/// Active-thread observations within one interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThreadStats {
    pub min_active: u64,
    pub max_active: u64,
    pub mean_active: u64,
    pub started: u64,
    pub finished: u64,
}

#[derive(Debug, Default)]
pub struct ThreadMetric {
    min: u64,
    max: u64,
    sum: u64,
    observations: u64,
}

impl ThreadMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, active: u64) {
        if self.observations == 0 {
            self.min = active;
            self.max = active;
        } else {
            self.min = self.min.min(active);
            self.max = self.max.max(active);
        }
        self.sum += active;
        self.observations += 1;
    }

    /// With no observations this interval, the tracker's current active
    /// count stands in for min, max and mean.
    pub fn stats(&self, tracker: &ThreadTracker) -> ThreadStats {
        let (min_active, max_active, mean_active) = if self.observations == 0 {
            let active = tracker.active();
            (active, active, active)
        } else {
            (
                self.min,
                self.max,
                (self.sum as f64 / self.observations as f64).round() as u64,
            )
        };
        ThreadStats {
            min_active,
            max_active,
            mean_active,
            started: tracker.started(),
            finished: tracker.finished(),
        }
    }

    pub fn reset_for_time_interval(&mut self) {
        *self = Self::default();
    }
}
