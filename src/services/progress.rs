use std::sync::Mutex;

/// Receives step labels and completion percentages. Fire-and-forget.
pub trait ProgressSink: Send + Sync {
    fn report(&self, step: &str, percent: u8);
}

// The high-water mark and the forward share one lock, so concurrent
// reports reach the sink in non-decreasing order.
pub struct ProgressTracker<'a> {
    sink: &'a dyn ProgressSink,
    high: Mutex<u8>,
}

impl<'a> ProgressTracker<'a> {
    pub fn new(sink: &'a dyn ProgressSink) -> Self {
        Self {
            sink,
            high: Mutex::new(0),
        }
    }

    /// Reports `step` at `percent` (capped at 100) or the current mark,
    /// whichever is higher. Returns the value forwarded.
    pub fn report(&self, step: &str, percent: u8) -> u8 {
        let mut high = match self.high.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *high = (*high).max(percent.min(100));
        self.sink.report(step, *high);
        *high
    }
}

/// Linear position of `done` out of `total` inside `start..=end`.
pub fn interpolate(start: u8, end: u8, done: usize, total: usize) -> u8 {
    if total == 0 || end <= start {
        return end.max(start);
    }
    let span = (end - start) as usize;
    start + (span * done.min(total) / total) as u8
}
