//! Progress reporting for long-running device operations

/// Progress update callbacks
///
/// Both the ESP32 loader and the DFU transfer report progress in bytes; the
/// flashing dispatcher turns these into a percentage.
pub trait ProgressCallbacks {
    /// Initialize some progress report
    fn init(&mut self, total: usize);
    /// Update some progress report
    fn update(&mut self, current: usize);
    /// Finish some progress report
    fn finish(&mut self);
}

/// Progress sink which discards every update
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressCallbacks for NoProgress {
    fn init(&mut self, _total: usize) {}

    fn update(&mut self, _current: usize) {}

    fn finish(&mut self) {}
}

/// Convert a byte count into a percentage of `total`.
///
/// An empty transfer counts as complete.
pub fn percentage(current: usize, total: usize) -> f32 {
    if total == 0 {
        return 100.0;
    }

    (current.min(total) as f32 / total as f32) * 100.0
}
