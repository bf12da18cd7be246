//! Timestamp index: per-major-block least-squares fit of a straight line
//! through the block's minor-block relative timestamps (spec 4.4.2).
//!
//! The symmetric x-axis `t_i = 2i - (count-1)` is used specifically so
//! that `Σt = 0`, which is what makes the closed forms below valid; do
//! not change that encoding without re-deriving them.

/// Result of fitting a line through one major block's recorded
/// timestamps.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fit {
    pub start_timestamp: u64,
    pub duration: u32,
}

/// Accumulates the relative timestamp of each minor block within the
/// current major block, and fits a line through them once the major
/// block is complete.
#[derive(Debug, Default)]
pub struct TimestampIndex {
    first_timestamp: u64,
    relative: Vec<i64>,
}

impl TimestampIndex {
    pub fn new() -> Self {
        TimestampIndex::default()
    }

    /// Record one minor block's timestamp.
    pub fn record(&mut self, timestamp: u64) {
        if self.relative.is_empty() {
            self.first_timestamp = timestamp;
        }
        self.relative
            .push(timestamp.wrapping_sub(self.first_timestamp) as i64);
    }

    pub fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    pub fn len(&self) -> usize {
        self.relative.len()
    }

    pub fn is_empty(&self) -> bool {
        self.relative.is_empty()
    }

    pub fn reset(&mut self) {
        self.first_timestamp = 0;
        self.relative.clear();
    }

    /// Fit `y = a*t + b` over `t_i = 2i - (count-1)` and return the
    /// block's estimated start timestamp and duration. `None` if fewer
    /// than two points have been recorded (a line is undefined).
    pub fn fit(&self) -> Option<Fit> {
        let count = self.relative.len();
        if count < 2 {
            return None;
        }

        let count_f = count as f64;
        let sum_t2 = count_f * (count_f * count_f - 1.0) / 3.0;

        let mut sum_xt = 0.0f64;
        let mut sum_x = 0.0f64;
        for (i, &x) in self.relative.iter().enumerate() {
            let t = 2.0 * i as f64 - (count_f - 1.0);
            sum_xt += x as f64 * t;
            sum_x += x as f64;
        }
        let mean_x = sum_x / count_f;

        let duration = 2.0 * count_f * sum_xt / sum_t2;
        let start_offset = mean_x - (count_f + 1.0) * sum_xt / sum_t2;

        Some(Fit {
            start_timestamp: (self.first_timestamp as f64 + start_offset).round() as u64,
            duration: duration.round().max(0.0) as u32,
        })
    }
}

/// IIR-smoothed running estimate of block duration, persisted in the
/// disk header's `last_duration` field: `last = round(α·duration +
/// (1-α)·last)`.
#[derive(Debug, Clone, Copy)]
pub struct SmoothedDuration {
    alpha: f64,
    value: u32,
}

impl SmoothedDuration {
    pub const ALPHA: f64 = 0.1;

    pub fn new(initial: u32) -> Self {
        SmoothedDuration {
            alpha: Self::ALPHA,
            value: initial,
        }
    }

    pub fn update(&mut self, duration: u32) -> u32 {
        let updated = Self::ALPHA * duration as f64 + (1.0 - self.alpha) * self.value as f64;
        self.value = updated.round() as u32;
        self.value
    }

    pub fn get(&self) -> u32 {
        self.value
    }
}
