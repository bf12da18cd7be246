//! Rolling min/max/mean/std accumulator for one BPM axis, used by both
//! decimation stages (spec 4.4.1).
//!
//! 128-bit arithmetic is required for the sum-of-squares: a 32-bit
//! signed sample squared is at most 2^62, and summing up to 2^16 of
//! those needs roughly 78 bits. `i128`/`u128` give us that natively, so
//! unlike the spec's note about targets lacking native 128-bit ints, no
//! manual carry propagation is needed here.

/// One decimated (min, max, mean, std) slot for a single axis.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AxisSlot {
    pub min: i32,
    pub max: i32,
    pub mean: i32,
    pub std: i32,
}

/// A decimated slot for both BPM axes: 32 bytes on disk (4 × i32 × 2).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct DecimatedSlot {
    pub x: AxisSlot,
    pub y: AxisSlot,
}

/// Running accumulator for one axis. `count` samples accumulated so far;
/// `finish` consumes it and expects `count` to be a power of two (the
/// decimation factor).
#[derive(Debug, Clone, Copy)]
struct AxisAccumulator {
    min: i32,
    max: i32,
    sum: i64,
    sum_sq: u128,
    count: u32,
}

impl Default for AxisAccumulator {
    fn default() -> Self {
        AxisAccumulator {
            min: i32::MAX,
            max: i32::MIN,
            sum: 0,
            sum_sq: 0,
            count: 0,
        }
    }
}

impl AxisAccumulator {
    fn add(&mut self, v: i32) {
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        self.sum += v as i64;
        // (i32 as i64)^2 fits in i64, widen to u128 to accumulate without
        // overflow across up to 2^16 terms.
        let sq = (v as i64) * (v as i64);
        self.sum_sq += sq as u128;
        self.count += 1;
    }

    fn finish(&self, log2_count: u32) -> AxisSlot {
        let mean = (self.sum >> log2_count) as i32;
        let mean_sq_shifted = (self.sum_sq >> log2_count) as i128;
        let var = mean_sq_shifted - (mean as i128) * (mean as i128);
        let var = if var < 0 { 0.0 } else { var as f64 };
        let std = var.sqrt().floor() as i32;
        AxisSlot {
            min: self.min,
            max: self.max,
            mean,
            std,
        }
    }
}

/// Accumulates one (x, y) axis pair for a group of `2^log2_count`
/// samples and finalizes it into a [`DecimatedSlot`].
#[derive(Debug, Clone, Copy, Default)]
pub struct VarianceAccumulator {
    x: AxisAccumulator,
    y: AxisAccumulator,
}

impl VarianceAccumulator {
    pub fn add(&mut self, x: i32, y: i32) {
        self.x.add(x);
        self.y.add(y);
    }

    pub fn count(&self) -> u32 {
        self.x.count
    }

    /// Finalize the group into a slot and reset this accumulator.
    pub fn finish_and_reset(&mut self, log2_count: u32) -> DecimatedSlot {
        let slot = DecimatedSlot {
            x: self.x.finish(log2_count),
            y: self.y.finish(log2_count),
        };
        *self = VarianceAccumulator::default();
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_max_and_mean_match_the_sample_set() {
        let mut acc = VarianceAccumulator::default();
        for &(x, y) in &[(1, -1), (5, -5), (3, -3), (7, -7)] {
            acc.add(x, y);
        }
        let slot = acc.finish_and_reset(2);
        assert_eq!(slot.x.min, 1);
        assert_eq!(slot.x.max, 7);
        assert_eq!(slot.x.mean, 4);
        assert_eq!(slot.y.min, -7);
        assert_eq!(slot.y.max, -1);
    }

    #[test]
    fn constant_samples_have_zero_std() {
        let mut acc = VarianceAccumulator::default();
        for _ in 0..8 {
            acc.add(42, -42);
        }
        let slot = acc.finish_and_reset(3);
        assert_eq!(slot.x.std, 0);
        assert_eq!(slot.y.std, 0);
    }

    #[test]
    fn std_matches_known_population_variance() {
        // x = {0, 4}: mean=2, variance=((0-2)^2+(4-2)^2)/2 = 4, std = 2
        let mut acc = VarianceAccumulator::default();
        acc.add(0, 0);
        acc.add(4, 0);
        let slot = acc.finish_and_reset(1);
        assert_eq!(slot.x.mean, 2);
        assert_eq!(slot.x.std, 2);
    }

    #[test]
    fn resets_after_finish() {
        let mut acc = VarianceAccumulator::default();
        acc.add(1, 1);
        acc.add(2, 2);
        acc.finish_and_reset(1);
        assert_eq!(acc.count(), 0);
    }
}
