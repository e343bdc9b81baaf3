//! Physical-layer bit recovery for self-clocked two-level (Manchester)
//! coding, as used by 10baseT Ethernet.
//!
//! The recovered output is a timestamped byte stream, one run per frame
//! burst, which a MAC-layer framing FSM then turns into fields.

use tracing::trace;
use typed_builder::TypedBuilder;

use crate::edges::{next_above, next_below};
use crate::waveform::AnalogWaveform;

/// Configuration for the bit-recovery state machine.
///
/// Defaults are the 10baseT line rate: 100 ns unit interval, 10 ns of
/// jitter tolerance around the eye center, and a ±1 V differential
/// decision threshold.
#[derive(Debug, Clone, TypedBuilder)]
pub struct ManchesterConfig {
    /// Nominal unit interval, femtoseconds.
    #[builder(default = 100_000_000)]
    pub ui_fs: i64,
    /// Tolerated deviation of the mid-bit edge from the eye center,
    /// femtoseconds.
    #[builder(default = 10_000_000)]
    pub jitter_tol_fs: i64,
    /// Differential decision threshold, volts.
    #[builder(default = 1.0)]
    pub threshold: f32,
}

impl Default for ManchesterConfig {
    fn default() -> Self {
        ManchesterConfig::builder().build()
    }
}

/// A run of recovered bytes with per-byte start and end timestamps
/// (femtoseconds). One run covers one contiguous frame burst on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ByteStream {
    pub bytes: Vec<u8>,
    pub starts: Vec<i64>,
    pub ends: Vec<i64>,
}

/// Find the next sample at or after `from` parked beyond the threshold in
/// the direction of `level`.
fn find_level(din: &AnalogWaveform, from: usize, level: bool, threshold: f32) -> Option<usize> {
    if level {
        next_above(din, from, threshold)
    } else {
        next_below(din, from, -threshold)
    }
}

/// Recover the Manchester bitstream from a differential voltage trace.
///
/// Frames start at a falling edge. Within a frame, each bit is decoded
/// from the opposite-polarity edge expected inside the eye window
/// `[UI/2 - tol, UI/2 + tol]` after the unit-interval start; a rising
/// mid-bit edge is a 1, and bits accumulate LSB first.
///
/// An edge landing outside the eye window triggers resynchronization
/// rather than failure: the cursor advances to half a unit interval past
/// the found edge, the expected polarity flips, and the partially
/// assembled byte is dropped so byte alignment resumes at the next valid
/// unit interval. A gap of more than ten unit intervals with no edge ends
/// the frame normally. A capture ending mid-byte discards the partial
/// byte but keeps the bytes already recovered.
#[must_use]
pub fn recover_bytes(cfg: &ManchesterConfig, din: &AnalogWaveform) -> Vec<ByteStream> {
    let ui = cfg.ui_fs;
    let half = ui / 2;
    let eye_start = half - cfg.jitter_tol_fs;
    let eye_end = half + cfg.jitter_tol_fs;
    let thr = cfg.threshold;

    let len = din.len();
    let mut runs = Vec::new();
    let mut i = 0usize;
    let mut done = false;

    while i < len && !done {
        // Falling edge of the first preamble bit marks start of frame
        let Some(j) = next_below(din, i, -thr) else {
            trace!("capture ended before finding another frame");
            break;
        };
        i = j;

        let mut run = ByteStream::default();
        let mut current_state = false;
        let mut ui_start = din.time_of(i);
        let mut byte_start = ui_start;
        let mut current_byte = 0u8;
        let mut bitcount = 0u32;

        loop {
            // Expect an opposite-polarity edge at the center of the bit
            let Some(j) = find_level(din, i, !current_state, thr) else {
                trace!("capture ended while looking for middle of a bit");
                done = true;
                break;
            };
            i = j;
            let edgepos = din.time_of(i);
            let delta = edgepos - ui_start;

            // A delta of more than ten UIs means a new frame. Back up to
            // half a UI before the found edge so the next frame hunt sees
            // that frame's opening edge whichever polarity it has.
            if delta > 10 * ui {
                trace!("premature end of frame (middle of a bit)");
                let target = edgepos - half;
                while i > 0 && din.time_of(i - 1) >= target {
                    i -= 1;
                }
                break;
            }

            // Out-of-window edge: resynchronize instead of failing. Move
            // half a UI past the found edge, flip the expected polarity,
            // and drop the partial byte so alignment recovers cleanly.
            if delta < eye_start || delta > eye_end {
                trace!(delta, "edge outside the eye window, resynchronizing");
                let target = edgepos + half;
                while i < len && din.time_of(i) < target {
                    i += 1;
                }
                if i >= len {
                    done = true;
                    break;
                }
                ui_start = din.time_of(i);
                current_state = !current_state;
                current_byte = 0;
                bitcount = 0;
                continue;
            }

            let i_middle = i;
            let ui_middle = edgepos;

            // Edge is in the right spot. Rising edge in the middle of the
            // bit is a 1; bits are sent LSB first.
            if bitcount == 0 {
                byte_start = ui_start;
            }
            current_byte = (current_byte >> 1) | if current_state { 0 } else { 0x80 };
            bitcount += 1;
            if bitcount == 8 {
                run.bytes.push(current_byte);
                run.starts.push(byte_start);
                run.ends.push(ui_start + ui);
                current_byte = 0;
                bitcount = 0;
            }

            // See if there is an edge at the end of this bit period
            let Some(j) = find_level(din, i, current_state, thr) else {
                trace!("capture ended while looking for end of a bit");
                done = true;
                break;
            };
            i = j;
            let edgepos = din.time_of(i);
            let delta = edgepos - ui_middle;

            if delta > 10 * ui {
                trace!("normal end of frame");
                let target = edgepos - half;
                while i > 0 && din.time_of(i - 1) >= target {
                    i -= 1;
                }
                break;
            }

            if delta > eye_end {
                // No edge at the end of this bit: the next bit has the
                // same first-half polarity and this edge is its middle.
                // Back up to half a UI past our center edge.
                current_state = !current_state;
                i = i_middle;
                let target = ui_middle + half;
                while i < len && din.time_of(i) < target {
                    i += 1;
                }
                if i >= len {
                    done = true;
                    break;
                }
            }
            // Otherwise i already points at the boundary edge.

            ui_start = din.time_of(i);
        }

        if !run.bytes.is_empty() {
            runs.push(run);
        }
    }

    runs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waveform::Waveform;

    const TS: i64 = 1_000_000; // 1 ns ticks
    const HALF_SAMPLES: usize = 50; // 50 ns per half UI

    /// Encode bits as a ±2.5 V differential Manchester burst with leading
    /// and trailing idle.
    fn encode(bits: &[u8], idle_tail: usize) -> AnalogWaveform {
        let mut samples = vec![0.0f32; 20];
        for &b in bits {
            let first = if b == 1 { -2.5 } else { 2.5 };
            samples.extend(std::iter::repeat(first).take(HALF_SAMPLES));
            samples.extend(std::iter::repeat(-first).take(HALF_SAMPLES));
        }
        samples.extend(std::iter::repeat(0.0).take(idle_tail));
        Waveform::new_dense(TS, samples)
    }

    fn bits_lsb_first(bytes: &[u8]) -> Vec<u8> {
        bytes
            .iter()
            .flat_map(|b| (0..8).map(move |i| (b >> i) & 1))
            .collect()
    }

    #[test]
    fn empty_and_idle_inputs_yield_nothing() {
        let cfg = ManchesterConfig::default();
        assert!(recover_bytes(&cfg, &Waveform::new_dense(TS, vec![])).is_empty());
        assert!(recover_bytes(&cfg, &Waveform::new_dense(TS, vec![0.0; 5000])).is_empty());
    }

    #[test]
    fn single_byte_round_trip() {
        let cfg = ManchesterConfig::default();
        let din = encode(&bits_lsb_first(&[0xd5]), 0);
        let runs = recover_bytes(&cfg, &din);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].bytes, vec![0xd5]);
        // byte spans exactly 8 UIs
        assert_eq!(runs[0].ends[0] - runs[0].starts[0], 8 * cfg.ui_fs);
    }

    #[test]
    fn partial_byte_at_capture_end_is_discarded() {
        let cfg = ManchesterConfig::default();
        let mut bits = bits_lsb_first(&[0x55, 0xa3]);
        bits.truncate(8 + 3); // second byte cut off mid-way
        let din = encode(&bits, 0);
        let runs = recover_bytes(&cfg, &din);
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].bytes, vec![0x55]);
    }

    #[test]
    fn gap_of_ten_uis_splits_frames() {
        let cfg = ManchesterConfig::default();
        let mut first = encode(&bits_lsb_first(&[0x55, 0x55]), 15 * 100);
        let second = encode(&bits_lsb_first(&[0xd5]), 40);
        let base = first.samples.len() as i64;
        first.samples.extend_from_slice(&second.samples);
        first.offsets.extend(second.offsets.iter().map(|o| o + base));
        first.durations.extend_from_slice(&second.durations);

        let runs = recover_bytes(&cfg, &first);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].bytes, vec![0x55, 0x55]);
        assert_eq!(runs[1].bytes, vec![0xd5]);
    }

    #[test]
    fn displaced_edge_resyncs_on_byte_boundary() {
        let cfg = ManchesterConfig::default();
        // bytes chosen so the displaced mid-bit edge of byte 2 bit 6 makes
        // resync land exactly on the byte 3 boundary
        let payload = [0x55u8, 0x55, 0x55, 0xd5, 0x01, 0x02, 0x03];
        let bits = bits_lsb_first(&payload);
        let mut din = encode(&bits, 40);

        // Displace the mid-bit rising edge of bit 22 (byte 2, bit 6, a 1)
        // 20 ns early: 30 ns into the bit instead of 50.
        let bit_base = 20 + 22 * 2 * HALF_SAMPLES;
        for s in &mut din.samples[bit_base + 30..bit_base + HALF_SAMPLES] {
            *s = 2.5;
        }

        let runs = recover_bytes(&cfg, &din);
        assert_eq!(runs.len(), 1);
        let n = runs[0].bytes.len();
        // bytes after the glitch are intact
        assert_eq!(&runs[0].bytes[n - 4..], &[0xd5, 0x01, 0x02, 0x03]);
        // bytes before it too
        assert_eq!(&runs[0].bytes[..2], &[0x55, 0x55]);
    }
}
