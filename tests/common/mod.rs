//! Shared synthesis helpers for the end-to-end decode tests.

use buswave::integrity::eth_fcs;
use buswave::waveform::{AnalogWaveform, Waveform};

/// 1 ns per tick.
pub const TS: i64 = 1_000_000;
/// Samples per Manchester half unit interval at 10 Mb/s and 1 GS/s.
pub const HALF_SAMPLES: usize = 50;

pub fn bits_lsb_first(bytes: &[u8]) -> Vec<u8> {
    bytes
        .iter()
        .flat_map(|b| (0..8).map(move |i| (b >> i) & 1))
        .collect()
}

/// Encode bytes as a ±2.5 V differential Manchester burst: a 1 is low
/// then high (rising mid-bit edge), a 0 the opposite.
pub fn manchester_encode(bytes: &[u8], idle_head: usize, idle_tail: usize) -> AnalogWaveform {
    let mut samples = vec![0.0f32; idle_head];
    for b in bits_lsb_first(bytes) {
        let first = if b == 1 { -2.5 } else { 2.5 };
        samples.extend(std::iter::repeat(first).take(HALF_SAMPLES));
        samples.extend(std::iter::repeat(-first).take(HALF_SAMPLES));
    }
    samples.extend(std::iter::repeat(0.0).take(idle_tail));
    Waveform::new_dense(TS, samples)
}

/// A correctly-framed Ethernet frame: preamble, SFD, addresses, IPv4
/// ethertype, `payload`, and a valid FCS.
pub fn ethernet_frame(dst: [u8; 6], src: [u8; 6], payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.extend_from_slice(&[0x55; 7]);
    frame.push(0xd5);
    let body = frame.len();
    frame.extend_from_slice(&dst);
    frame.extend_from_slice(&src);
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.extend_from_slice(payload);
    let fcs = eth_fcs(&frame[body..]).to_le_bytes();
    frame.extend_from_slice(&fcs);
    frame
}
