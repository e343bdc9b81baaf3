//! Edge and transition location.
//!
//! All locators take a cursor and scan forward only; a decode pass never
//! re-scans behind its cursor and needs no state beyond the cursor itself.

use crate::waveform::{AnalogWaveform, DigitalWaveform, Waveform};

/// Direction of a logic transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    Rising,
    Falling,
    Any,
}

/// Find the next sample at or after `from` whose value exceeds `level`.
///
/// Analog bit-boundary detection works on levels rather than strict
/// crossings: a differential line parked beyond the threshold is already
/// "after" the edge as far as symbol recovery is concerned.
#[must_use]
pub fn next_above(w: &AnalogWaveform, from: usize, level: f32) -> Option<usize> {
    w.samples[from.min(w.len())..]
        .iter()
        .position(|&s| s > level)
        .map(|p| from + p)
}

/// Find the next sample at or after `from` whose value is below `level`.
#[must_use]
pub fn next_below(w: &AnalogWaveform, from: usize, level: f32) -> Option<usize> {
    w.samples[from.min(w.len())..]
        .iter()
        .position(|&s| s < level)
        .map(|p| from + p)
}

/// Find the index of the first sample after `from` that begins a transition
/// of the requested direction, i.e. differs from the sample before it.
#[must_use]
pub fn find_edge(w: &DigitalWaveform, from: usize, edge: Edge) -> Option<usize> {
    let mut i = from.max(1);
    while i < w.len() {
        let prev = w.samples[i - 1];
        let cur = w.samples[i];
        let hit = match edge {
            Edge::Rising => !prev && cur,
            Edge::Falling => prev && !cur,
            Edge::Any => prev != cur,
        };
        if hit {
            return Some(i);
        }
        i += 1;
    }
    None
}

/// Timestamps (femtoseconds) of every transition of the requested direction.
///
/// Feeds unit-interval recovery, which wants the full set of reference-clock
/// edges up front.
#[must_use]
pub fn edge_timestamps(w: &DigitalWaveform, edge: Edge) -> Vec<i64> {
    let mut out = Vec::new();
    let mut i = 0;
    while let Some(j) = find_edge(w, i + 1, edge) {
        out.push(w.time_of(j));
        i = j;
    }
    out
}

/// Timestamp (femtoseconds) of the next sample boundary after the cursor,
/// or `now` when the channel has no more events.
///
/// Returning `now` unchanged lets a multi-channel walk detect that no
/// channel can advance and terminate.
#[must_use]
pub fn next_event_timestamp<T>(w: &Waveform<T>, cursor: usize, now: i64) -> i64 {
    if cursor + 1 < w.len() {
        w.time_of(cursor + 1)
    } else {
        now
    }
}

/// Advance `cursor` to the last sample starting at or before `t`.
pub fn advance_to_timestamp<T>(w: &Waveform<T>, cursor: &mut usize, t: i64) {
    while *cursor + 1 < w.len() && w.time_of(*cursor + 1) <= t {
        *cursor += 1;
    }
}

/// Sample `data` on each rising edge of `clock`, producing a sparse logic
/// waveform with femtosecond resolution (timescale 1).
///
/// Each output sample holds the data-line value at the clock edge and
/// extends until the next edge. This is the front half of any decoder for a
/// source-synchronous bus (SD command, parallel buses, ...).
#[must_use]
pub fn sample_on_rising_edges(data: &DigitalWaveform, clock: &DigitalWaveform) -> DigitalWaveform {
    let mut out = DigitalWaveform::with_timebase_of(clock);
    out.timescale = 1;
    // Offsets below are full femtosecond times with the phase already
    // applied, so the output carries none of its own.
    out.trigger_phase = 0;

    let mut ndata = 0usize;
    let dlen = data.len();
    for i in 1..clock.len() {
        if !(clock.samples[i] && !clock.samples[i - 1]) {
            continue;
        }

        let clkstart = clock.time_of(i);
        while ndata + 1 < dlen && data.time_of(ndata + 1) < clkstart {
            ndata += 1;
        }
        if ndata >= dlen {
            break;
        }

        // Extend the previous sample's duration to our start
        if let Some(last) = out.offsets.len().checked_sub(1) {
            out.durations[last] = clkstart - out.offsets[last];
        }

        out.push(clkstart, 1, data.samples[ndata]);
    }
    out
}
