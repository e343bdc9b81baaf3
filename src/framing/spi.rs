//! SPI byte framing.
//!
//! Walks the clock, chip-select, and data channels in lockstep by
//! timestamp and shifts in one byte per eight sampling edges while the
//! select line is asserted.

use serde::{Deserialize, Serialize};
use tracing::trace;
use typed_builder::TypedBuilder;

use super::SymbolColor;
use crate::edges::{advance_to_timestamp, next_event_timestamp};
use crate::packet::{Packet, PacketColor};
use crate::waveform::{DigitalWaveform, Waveform};

#[derive(Debug, Clone, TypedBuilder)]
pub struct SpiConfig {
    /// Select is normally active low; set for active-high slaves.
    #[builder(default = false)]
    pub cs_active_high: bool,
}

impl Default for SpiConfig {
    fn default() -> Self {
        SpiConfig::builder().build()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpiSymbol {
    Select,
    Data(u8),
    Deselect,
    Error,
}

impl SpiSymbol {
    #[must_use]
    pub fn color(&self) -> SymbolColor {
        match self {
            SpiSymbol::Select | SpiSymbol::Deselect => SymbolColor::Control,
            SpiSymbol::Data(_) => SymbolColor::Data,
            SpiSymbol::Error => SymbolColor::Error,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        match self {
            SpiSymbol::Select => "SELECT".to_string(),
            SpiSymbol::Deselect => "DESELECT".to_string(),
            SpiSymbol::Data(b) => format!("{b:02x}"),
            SpiSymbol::Error => "ERROR".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpiDecoder {
    pub config: SpiConfig,
}

enum State {
    Idle,
    Deselected,
    SelectedClkLo,
    SelectedClkHi,
}

impl SpiDecoder {
    #[must_use]
    pub fn new(config: SpiConfig) -> Self {
        SpiDecoder { config }
    }

    /// Decode one capture of clock / chip-select / data channels.
    /// Replaces any previous output wholesale.
    ///
    /// Bits are sampled on the rising clock edge, MSB first. The decode
    /// starts in an idle state that waits for a deselect so a partial
    /// transaction at the start of the capture is never misread.
    #[must_use]
    pub fn decode(
        &mut self,
        clk: &DigitalWaveform,
        csn: &DigitalWaveform,
        data: &DigitalWaveform,
    ) -> (Waveform<SpiSymbol>, Vec<Packet>) {
        let mut cap: Waveform<SpiSymbol> = Waveform::with_timebase_of(clk);
        let mut packets = Vec::new();
        if clk.is_empty() || csn.is_empty() || data.is_empty() {
            return (cap, packets);
        }

        let active = |cs: bool| {
            if self.config.cs_active_high {
                cs
            } else {
                !cs
            }
        };
        let ticks = |fs: i64| (fs - clk.trigger_phase) / clk.timescale;

        let mut state = State::Idle;
        let mut current_byte = 0u8;
        let mut bitcount = 0u32;
        let mut bytestart = 0i64;
        let mut first = false;

        let mut pack = Packet::new(0);
        let mut have_window = false;

        let mut ics = 0usize;
        let mut iclk = 0usize;
        let mut idata = 0usize;
        let mut timestamp = 0i64;

        loop {
            let cur_cs = csn.samples[ics];
            let cur_clk = clk.samples[iclk];
            let cur_data = data.samples[idata];

            match state {
                // Wait for a deselect first so we never decode a partial
                // transaction at the start of the capture
                State::Idle => {
                    if !active(cur_cs) {
                        state = State::Deselected;
                    }
                }

                State::Deselected => {
                    if active(cur_cs) {
                        state = State::SelectedClkLo;
                        current_byte = 0;
                        bitcount = 0;
                        bytestart = timestamp;
                        first = true;

                        pack = Packet::new(timestamp);
                        have_window = true;
                    }
                }

                // Wait for a rising clock edge
                State::SelectedClkLo => {
                    if cur_clk {
                        if bitcount == 0 {
                            if first {
                                cap.push(
                                    ticks(bytestart),
                                    ticks(timestamp) - ticks(bytestart),
                                    SpiSymbol::Select,
                                );
                                first = false;
                            } else if let Some(last) = cap.len().checked_sub(1) {
                                // Extend the previous byte until this edge
                                if matches!(cap.samples[last], SpiSymbol::Data(_)) {
                                    cap.durations[last] = ticks(timestamp) - cap.offsets[last];
                                }
                            }
                            bytestart = timestamp;
                        }

                        state = State::SelectedClkHi;

                        bitcount += 1;
                        current_byte = (current_byte << 1) | u8::from(cur_data);

                        if bitcount == 8 {
                            cap.push(
                                ticks(bytestart),
                                ticks(timestamp) - ticks(bytestart),
                                SpiSymbol::Data(current_byte),
                            );
                            pack.data.push(current_byte);
                            bitcount = 0;
                            current_byte = 0;
                            bytestart = timestamp;
                        }
                    } else if !active(cur_cs) {
                        // End of transaction
                        if bitcount != 0 {
                            trace!(bits = bitcount, "select dropped mid-byte");
                        }
                        cap.push(
                            ticks(bytestart),
                            ticks(timestamp) - ticks(bytestart),
                            SpiSymbol::Deselect,
                        );
                        bytestart = timestamp;
                        state = State::Deselected;

                        if have_window {
                            pack.len = timestamp - pack.offset;
                            pack.set_header("Length", format!("{}", pack.data.len()));
                            pack.color = PacketColor::DataWrite;
                            packets.push(std::mem::take(&mut pack));
                            have_window = false;
                        }
                    }
                }

                State::SelectedClkHi => {
                    if !cur_clk {
                        state = State::SelectedClkLo;
                    } else if !active(cur_cs) {
                        cap.push(
                            ticks(bytestart),
                            ticks(timestamp) - ticks(bytestart),
                            SpiSymbol::Deselect,
                        );
                        bytestart = timestamp;
                        state = State::Deselected;

                        if have_window {
                            pack.len = timestamp - pack.offset;
                            pack.set_header("Length", format!("{}", pack.data.len()));
                            pack.color = PacketColor::DataWrite;
                            packets.push(std::mem::take(&mut pack));
                            have_window = false;
                        }
                    }
                }
            }

            // Advance to the next event on the clock or select lines; the
            // data line is only ever sampled, so its events don't gate
            // progress.
            let next_cs = next_event_timestamp(csn, ics, timestamp);
            let next_clk = next_event_timestamp(clk, iclk, timestamp);
            let Some(next) = [next_cs, next_clk].into_iter().filter(|&t| t > timestamp).min()
            else {
                // Neither gating channel can move forward
                break;
            };
            timestamp = next;
            advance_to_timestamp(csn, &mut ics, timestamp);
            advance_to_timestamp(clk, &mut iclk, timestamp);
            advance_to_timestamp(data, &mut idata, timestamp);
        }

        (cap, packets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digital(samples: &[(i64, i64, bool)]) -> DigitalWaveform {
        let mut w = DigitalWaveform::new(1);
        for &(off, dur, v) in samples {
            w.push(off, dur, v);
        }
        w
    }

    /// One byte clocked across 8 rising edges inside a select window.
    fn one_byte_capture(byte: u8) -> (DigitalWaveform, DigitalWaveform, DigitalWaveform) {
        let csn = digital(&[(0, 100, true), (100, 900, false), (1000, 100, true)]);

        let mut clk_samples = vec![(0i64, 200i64, false)];
        for k in 0..8 {
            clk_samples.push((200 + 100 * k, 50, true));
            clk_samples.push((250 + 100 * k, 50, false));
        }
        let clk = digital(&clk_samples);

        let mut mosi_samples = vec![(0i64, 150i64, false)];
        for k in 0..8u32 {
            let bit = (byte >> (7 - k)) & 1 == 1;
            mosi_samples.push((150 + 100 * i64::from(k), 100, bit));
        }
        let mosi = digital(&mosi_samples);

        (clk, csn, mosi)
    }

    #[test]
    fn one_byte_select_window() {
        let (clk, csn, mosi) = one_byte_capture(0xa5);
        let (cap, packets) = SpiDecoder::default().decode(&clk, &csn, &mosi);

        assert_eq!(
            cap.samples,
            vec![SpiSymbol::Select, SpiSymbol::Data(0xa5), SpiSymbol::Deselect]
        );
        // The three symbols tile the active-select window exactly
        let total: i64 = cap.durations.iter().sum();
        assert_eq!(total, 900);
        assert_eq!(cap.offsets[0], 100);
        assert_eq!(cap.offsets[2] + cap.durations[2], 1000);

        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].data, vec![0xa5]);
        assert_eq!(packets[0].header("Length"), Some("1"));
        assert_eq!(packets[0].offset, 100);
        assert_eq!(packets[0].len, 900);
    }

    #[test]
    fn capture_starting_mid_transaction_waits_for_deselect() {
        // Select already active at t=0: nothing decodes until the next
        // full window.
        let csn = digital(&[(0, 500, false), (500, 100, true), (600, 400, false)]);
        let clk = digital(&[(0, 100, false), (100, 50, true), (150, 850, false)]);
        let mosi = digital(&[(0, 1000, true)]);
        let (cap, packets) = SpiDecoder::default().decode(&clk, &csn, &mosi);
        // Only the second window's select shows up; it has no clock edges
        // and never completes a byte.
        assert!(cap.samples.iter().all(|s| *s != SpiSymbol::Data(0xff)));
        assert!(packets.iter().all(|p| p.data.is_empty()));
    }

    #[test]
    fn deselect_mid_byte_discards_partial_byte() {
        let csn = digital(&[(0, 100, true), (100, 300, false), (400, 100, true)]);
        // only 3 rising edges inside the window
        let clk = digital(&[
            (0, 150, false),
            (150, 50, true),
            (200, 50, false),
            (250, 50, true),
            (300, 50, false),
            (350, 30, true),
            (380, 120, false),
        ]);
        let mosi = digital(&[(0, 500, true)]);
        let (cap, packets) = SpiDecoder::default().decode(&clk, &csn, &mosi);
        assert!(!cap.samples.contains(&SpiSymbol::Data(0x07)));
        assert_eq!(packets.len(), 1);
        assert!(packets[0].data.is_empty());
    }

    #[test]
    fn empty_inputs_give_empty_output() {
        let e = DigitalWaveform::new(1);
        let (cap, packets) = SpiDecoder::default().decode(&e, &e, &e);
        assert!(cap.is_empty());
        assert!(packets.is_empty());
    }
}
