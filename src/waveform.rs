//! Typed, timestamped sample sequences.
//!
//! A [Waveform] is the common currency between decode stages: a voltage
//! trace from an instrument, a recovered logic-level stream, or a decoded
//! protocol-symbol stream are all waveforms with a different sample type.

/// Femtoseconds per second.
pub const FS_PER_SECOND: i64 = 1_000_000_000_000_000;

/// An ordered sequence of samples, each with a start offset and duration in
/// integer ticks of the waveform's time base.
///
/// Two layouts exist:
///
/// * *dense-packed*: `offsets[i] == i` and `durations[i] == 1`. Instruments
///   produce analog captures in this form and it enables branch-free fast
///   paths.
/// * *sparse-packed*: arbitrary non-decreasing offsets and durations, as
///   produced by variable-rate recovery and protocol framing.
///
/// Offsets are non-negative and non-decreasing. All three vectors always
/// have the same length.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform<T> {
    /// Femtoseconds per tick.
    pub timescale: i64,
    /// Start of the acquisition, rounded down to whole epoch seconds.
    pub start_timestamp: i64,
    /// Fractional start time, femtoseconds past `start_timestamp`.
    pub start_femtoseconds: i64,
    /// Offset, in femtoseconds, from the trigger to the sampling clock.
    /// Used to align waveforms captured on different channels.
    pub trigger_phase: i64,

    pub offsets: Vec<i64>,
    pub durations: Vec<i64>,
    pub samples: Vec<T>,

    dense: bool,
}

/// A voltage trace.
pub type AnalogWaveform = Waveform<f32>;
/// A recovered logic-level stream.
pub type DigitalWaveform = Waveform<bool>;

impl<T> Waveform<T> {
    /// Create an empty sparse waveform with the given tick size.
    #[must_use]
    pub fn new(timescale: i64) -> Self {
        Waveform {
            timescale,
            start_timestamp: 0,
            start_femtoseconds: 0,
            trigger_phase: 0,
            offsets: Vec::new(),
            durations: Vec::new(),
            samples: Vec::new(),
            dense: false,
        }
    }

    /// Create a dense-packed waveform from contiguous samples: one sample
    /// per tick, offsets equal to indices.
    #[must_use]
    pub fn new_dense(timescale: i64, samples: Vec<T>) -> Self {
        let n = samples.len();
        Waveform {
            timescale,
            start_timestamp: 0,
            start_femtoseconds: 0,
            trigger_phase: 0,
            offsets: (0..n as i64).collect(),
            durations: vec![1; n],
            samples,
            dense: true,
        }
    }

    /// Create an empty sparse waveform sharing `other`'s time base, the
    /// normal way a decode stage sets up its output.
    #[must_use]
    pub fn with_timebase_of<U>(other: &Waveform<U>) -> Self {
        Waveform {
            timescale: other.timescale,
            start_timestamp: other.start_timestamp,
            start_femtoseconds: other.start_femtoseconds,
            trigger_phase: other.trigger_phase,
            offsets: Vec::new(),
            durations: Vec::new(),
            samples: Vec::new(),
            dense: false,
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    #[must_use]
    pub fn is_dense(&self) -> bool {
        self.dense
    }

    /// Append a sample. Offsets must be non-decreasing; this is only
    /// checked in debug builds.
    pub fn push(&mut self, offset: i64, duration: i64, value: T) {
        debug_assert!(offset >= 0 && duration >= 0);
        debug_assert!(!self.offsets.last().is_some_and(|last| *last > offset));
        if self.dense && (offset != self.samples.len() as i64 || duration != 1) {
            self.dense = false;
        }
        self.offsets.push(offset);
        self.durations.push(duration);
        self.samples.push(value);
    }

    /// Start time of sample `i` in femtoseconds relative to the capture
    /// start, trigger phase included.
    #[must_use]
    pub fn time_of(&self, i: usize) -> i64 {
        self.offsets[i] * self.timescale + self.trigger_phase
    }

    /// End time of sample `i` in femtoseconds relative to the capture start.
    #[must_use]
    pub fn end_of(&self, i: usize) -> i64 {
        (self.offsets[i] + self.durations[i]) * self.timescale + self.trigger_phase
    }

    /// Split a femtosecond position within this capture into absolute
    /// (epoch seconds, microseconds), as used by capture-file records.
    #[must_use]
    pub fn abs_seconds_micros(&self, fs: i64) -> (u32, u32) {
        let mut sec = self.start_timestamp;
        let mut frac = self.start_femtoseconds + fs;
        if frac >= FS_PER_SECOND {
            sec += frac / FS_PER_SECOND;
            frac %= FS_PER_SECOND;
        }
        (sec as u32, (frac / 1_000_000_000) as u32)
    }

    /// Check the layout invariants: equal vector lengths, non-decreasing
    /// offsets, and the dense-packed contract when flagged dense.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        if self.offsets.len() != self.samples.len() || self.durations.len() != self.samples.len() {
            return false;
        }
        if self.offsets.windows(2).any(|w| w[0] > w[1]) {
            return false;
        }
        if self.dense {
            return self.offsets.iter().enumerate().all(|(i, o)| *o == i as i64)
                && self.durations.iter().all(|d| *d == 1);
        }
        true
    }
}

impl AnalogWaveform {
    /// Convert to a logic-level waveform: true wherever the sample exceeds
    /// `threshold`.
    ///
    /// Uses an AVX2 inner loop when the CPU supports it; the scalar path is
    /// the reference implementation and produces identical output.
    #[must_use]
    pub fn to_digital(&self, threshold: f32) -> DigitalWaveform {
        let mut out = DigitalWaveform::with_timebase_of(self);
        out.offsets = self.offsets.clone();
        out.durations = self.durations.clone();
        out.dense = self.dense;

        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                // Safety: gated on runtime AVX2 support.
                unsafe { threshold_avx2(&self.samples, threshold, &mut out.samples) };
                return out;
            }
        }

        threshold_scalar(&self.samples, threshold, &mut out.samples);
        out
    }
}

pub(crate) fn threshold_scalar(samples: &[f32], threshold: f32, out: &mut Vec<bool>) {
    out.reserve(samples.len());
    for &s in samples {
        out.push(s > threshold);
    }
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2")]
unsafe fn threshold_avx2(samples: &[f32], threshold: f32, out: &mut Vec<bool>) {
    use std::arch::x86_64::{
        _mm256_cmp_ps, _mm256_loadu_ps, _mm256_movemask_ps, _mm256_set1_ps, _CMP_GT_OQ,
    };

    out.reserve(samples.len());
    let thresh = _mm256_set1_ps(threshold);
    let chunks = samples.len() / 8;
    for c in 0..chunks {
        let v = _mm256_loadu_ps(samples.as_ptr().add(c * 8));
        let mask = _mm256_movemask_ps(_mm256_cmp_ps::<_CMP_GT_OQ>(v, thresh));
        for bit in 0..8 {
            out.push((mask >> bit) & 1 != 0);
        }
    }
    for &s in &samples[chunks * 8..] {
        out.push(s > threshold);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_layout() {
        let w = Waveform::new_dense(1_000_000, vec![0.0f32, 1.0, 2.0]);
        assert!(w.is_dense());
        assert!(w.is_consistent());
        assert_eq!(w.offsets, vec![0, 1, 2]);
        assert_eq!(w.durations, vec![1, 1, 1]);
    }

    #[test]
    fn push_sparse_clears_dense() {
        let mut w = Waveform::new_dense(1, vec![true, false]);
        w.push(10, 5, true);
        assert!(!w.is_dense());
        assert!(w.is_consistent());
    }

    #[test]
    fn time_includes_trigger_phase() {
        let mut w: Waveform<bool> = Waveform::new(1_000_000);
        w.trigger_phase = 500;
        w.push(3, 2, true);
        assert_eq!(w.time_of(0), 3_000_500);
        assert_eq!(w.end_of(0), 5_000_500);
    }

    #[test]
    fn abs_time_carries_into_seconds() {
        let mut w: Waveform<f32> = Waveform::new(1);
        w.start_timestamp = 1000;
        w.start_femtoseconds = FS_PER_SECOND - 1_000_000_000;
        let (sec, usec) = w.abs_seconds_micros(2_000_000_000);
        assert_eq!(sec, 1001);
        assert_eq!(usec, 1);
    }

    #[test]
    fn threshold_scalar_reference() {
        let w = Waveform::new_dense(1, vec![-2.0f32, 0.5, 1.5, -0.1, 3.0]);
        let d = w.to_digital(1.0);
        assert_eq!(d.samples, vec![false, false, true, false, true]);
        assert!(d.is_dense());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn threshold_simd_matches_scalar() {
        use rand::{Rng, SeedableRng};
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let samples: Vec<f32> = (0..1027).map(|_| rng.gen_range(-3.0..3.0)).collect();

        let w = Waveform::new_dense(1, samples.clone());
        let fast = w.to_digital(0.25);

        let mut reference = Vec::new();
        threshold_scalar(&samples, 0.25, &mut reference);
        assert_eq!(fast.samples, reference);
    }
}
