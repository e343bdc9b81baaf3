//! Ethernet MAC-layer framing.
//!
//! Consumes the timestamped byte runs recovered by the physical-layer
//! decoder ([manchester](super::manchester)), walks each run through the
//! MAC framing state machine, validates the frame check sequence, and
//! produces the field-level symbol waveform plus one [Packet] per complete
//! frame. Completed frames can optionally be streamed to a pcap sink.

use std::io::Write;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::trace;

use super::manchester::{recover_bytes, ByteStream, ManchesterConfig};
use super::SymbolColor;
use crate::integrity::check_eth_fcs;
use crate::packet::{Packet, PacketColor};
use crate::pcap::{PcapWriter, LINKTYPE_ETHERNET};
use crate::waveform::{AnalogWaveform, Waveform};
use crate::Result;

/// One field of an Ethernet frame. Each decoded symbol spans the bytes it
/// was assembled from, with timestamps taken from the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EthernetSymbol {
    Preamble,
    Sfd,
    DstMac([u8; 6]),
    SrcMac([u8; 6]),
    Ethertype(u16),
    VlanTag(u16),
    Payload(u8),
    FcsGood(u32),
    FcsBad(u32),
    Error,
}

impl EthernetSymbol {
    #[must_use]
    pub fn color(&self) -> SymbolColor {
        match self {
            EthernetSymbol::Preamble | EthernetSymbol::Sfd => SymbolColor::Preamble,
            EthernetSymbol::DstMac(_) | EthernetSymbol::SrcMac(_) => SymbolColor::Address,
            EthernetSymbol::Ethertype(_) | EthernetSymbol::VlanTag(_) => SymbolColor::Control,
            EthernetSymbol::Payload(_) => SymbolColor::Data,
            EthernetSymbol::FcsGood(_) => SymbolColor::ChecksumOk,
            EthernetSymbol::FcsBad(_) => SymbolColor::ChecksumBad,
            EthernetSymbol::Error => SymbolColor::Error,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        match self {
            EthernetSymbol::Preamble => "PREAMBLE".to_string(),
            EthernetSymbol::Sfd => "SFD".to_string(),
            EthernetSymbol::DstMac(m) => format!("To {}", format_mac(m)),
            EthernetSymbol::SrcMac(m) => format!("From {}", format_mac(m)),
            EthernetSymbol::Ethertype(v) => format!("Type: {}", ethertype_name(*v)),
            EthernetSymbol::VlanTag(tag) => {
                let mut s = format!("VLAN {}, PCP {}", tag & 0xfff, tag >> 13);
                if tag & 0x1000 != 0 {
                    s.push_str(", DE");
                }
                s
            }
            EthernetSymbol::Payload(b) => format!("{b:02x}"),
            EthernetSymbol::FcsGood(v) | EthernetSymbol::FcsBad(v) => format!("CRC: {v:08x}"),
            EthernetSymbol::Error => "ERROR".to_string(),
        }
    }
}

fn format_mac(m: &[u8; 6]) -> String {
    format!(
        "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
        m[0], m[1], m[2], m[3], m[4], m[5]
    )
}

fn ethertype_name(ethertype: u16) -> String {
    match ethertype {
        0x0800 => "IPv4".to_string(),
        0x0806 => "ARP".to_string(),
        0x8100 => "802.1q".to_string(),
        0x86dd => "IPv6".to_string(),
        0x88cc => "LLDP".to_string(),
        0x88f7 => "PTP".to_string(),
        v => format!("0x{v:04x}"),
    }
}

/// Decodes 10baseT Ethernet from a differential analog capture.
pub struct EthernetDecoder {
    pub config: ManchesterConfig,
    capture: Option<PcapWriter<Box<dyn Write + Send>>>,
}

impl Default for EthernetDecoder {
    fn default() -> Self {
        EthernetDecoder {
            config: ManchesterConfig::default(),
            capture: None,
        }
    }
}

/// Result of framing one byte run. Symbols carry femtosecond start/end
/// times; conversion to output ticks happens during final assembly.
struct FramedRun {
    symbols: Vec<(i64, i64, EthernetSymbol)>,
    packet: Option<Packet>,
    /// Frame bytes (destination MAC through FCS) and the femtosecond start
    /// time, for capture-file export. Only present for complete frames.
    frame: Option<(i64, Vec<u8>)>,
}

impl EthernetDecoder {
    #[must_use]
    pub fn new(config: ManchesterConfig) -> Self {
        EthernetDecoder {
            config,
            capture: None,
        }
    }

    /// Stream every completed frame to `sink` as a pcap capture file.
    ///
    /// # Errors
    /// I/O errors writing the capture-file global header.
    pub fn set_capture_sink<W: Write + Send + 'static>(&mut self, sink: W) -> Result<()> {
        self.capture = Some(PcapWriter::new(
            Box::new(sink) as Box<dyn Write + Send>,
            LINKTYPE_ETHERNET,
        )?);
        Ok(())
    }

    /// Decode the capture. Replaces any previous output wholesale.
    ///
    /// # Errors
    /// I/O errors from the capture sink, if one is configured. Malformed
    /// signal content is reported in-band, never as an error.
    pub fn decode(
        &mut self,
        din: &AnalogWaveform,
    ) -> Result<(Waveform<EthernetSymbol>, Vec<Packet>)> {
        let runs = recover_bytes(&self.config, din);

        // Each byte run is one frame burst and frames independently of the
        // others, so this loop is data-parallel.
        let framed: Vec<FramedRun> = runs.par_iter().map(frame_run).collect();

        let mut cap: Waveform<EthernetSymbol> = Waveform::with_timebase_of(din);
        let mut packets = Vec::new();
        for f in framed {
            for (start, end, sym) in f.symbols {
                cap.push(
                    (start - din.trigger_phase) / din.timescale,
                    (end - start) / din.timescale,
                    sym,
                );
            }
            if let Some((start_fs, bytes)) = f.frame {
                if let Some(pcap) = self.capture.as_mut() {
                    let (sec, usec) = din.abs_seconds_micros(start_fs);
                    pcap.write_record(sec, usec, &bytes)?;
                }
            }
            packets.extend(f.packet);
        }
        Ok((cap, packets))
    }
}

enum State {
    Idle,
    Preamble,
    DstMac,
    SrcMac,
    Ethertype,
    VlanTag,
    Payload,
    Fcs,
}

/// Run the MAC framing state machine over one recovered byte run.
fn frame_run(run: &ByteStream) -> FramedRun {
    let bytes = &run.bytes;
    let len = bytes.len();
    let mut out = FramedRun {
        symbols: Vec::new(),
        packet: None,
        frame: None,
    };

    let mut state = State::Idle;
    let mut field: Vec<u8> = Vec::new();
    let mut field_start = 0i64;
    let mut pack = Packet::new(0);

    // Byte index of the first byte after the SFD, and of the first FCS
    // byte. The run length is known up front, so the FCS boundary is
    // computed rather than guessed at.
    let mut crc_start = 0usize;
    let mut fcs_pos = usize::MAX;
    let mut sfd_start = 0i64;

    for i in 0..len {
        let b = bytes[i];
        match state {
            State::Idle => {
                // In between frames; look for a preamble byte
                if b == 0x55 {
                    field_start = run.starts[i];
                    pack.offset = run.starts[i];
                    state = State::Preamble;
                } else {
                    trace!(byte = b, "skipping unknown byte before preamble");
                }
            }

            State::Preamble => {
                if b == 0xd5 {
                    out.symbols
                        .push((field_start, run.starts[i], EthernetSymbol::Preamble));
                    out.symbols
                        .push((run.starts[i], run.ends[i], EthernetSymbol::Sfd));
                    sfd_start = run.starts[i];
                    crc_start = i + 1;
                    // Runts shorter than a minimal header + FCS never get
                    // an FCS boundary and simply truncate.
                    if len >= crc_start + 18 {
                        fcs_pos = len - 4;
                    }
                    field.clear();
                    state = State::DstMac;
                } else if b != 0x55 {
                    trace!(byte = b, "garbage inside preamble");
                }
            }

            State::DstMac => {
                if field.is_empty() {
                    field_start = run.starts[i];
                }
                field.push(b);
                if field.len() == 6 {
                    let mac: [u8; 6] = field[..].try_into().unwrap();
                    out.symbols
                        .push((field_start, run.ends[i], EthernetSymbol::DstMac(mac)));
                    pack.set_header("Dest MAC", format_mac(&mac));
                    field.clear();
                    state = State::SrcMac;
                }
            }

            State::SrcMac => {
                if field.is_empty() {
                    field_start = run.starts[i];
                }
                field.push(b);
                if field.len() == 6 {
                    let mac: [u8; 6] = field[..].try_into().unwrap();
                    out.symbols
                        .push((field_start, run.ends[i], EthernetSymbol::SrcMac(mac)));
                    pack.set_header("Src MAC", format_mac(&mac));
                    field.clear();
                    state = State::Ethertype;
                }
            }

            State::Ethertype => {
                if field.is_empty() {
                    field_start = run.starts[i];
                }
                field.push(b);
                if field.len() == 2 {
                    let ethertype = u16::from_be_bytes([field[0], field[1]]);
                    out.symbols.push((
                        field_start,
                        run.ends[i],
                        EthernetSymbol::Ethertype(ethertype),
                    ));

                    // Below 1500 it is a length, not an ethertype: an LLC
                    // frame. Peek at the LSAP to label the common case.
                    let text = if ethertype < 1500 {
                        if bytes.get(i + 1) == Some(&0x42) {
                            "STP".to_string()
                        } else {
                            "LLC".to_string()
                        }
                    } else {
                        ethertype_name(ethertype)
                    };
                    pack.set_header("Ethertype", text);

                    field.clear();
                    state = if ethertype == 0x8100 {
                        State::VlanTag
                    } else if i + 1 >= fcs_pos {
                        State::Fcs
                    } else {
                        State::Payload
                    };
                }
            }

            State::VlanTag => {
                if field.is_empty() {
                    field_start = run.starts[i];
                }
                field.push(b);
                if field.len() == 2 {
                    let tag = u16::from_be_bytes([field[0], field[1]]);
                    out.symbols
                        .push((field_start, run.ends[i], EthernetSymbol::VlanTag(tag)));
                    pack.set_header("VLAN", format!("{}", tag & 0xfff));
                    field.clear();
                    // The real ethertype follows the tag
                    state = State::Ethertype;
                }
            }

            State::Payload => {
                // Each payload byte is its own symbol
                out.symbols
                    .push((run.starts[i], run.ends[i], EthernetSymbol::Payload(b)));
                pack.data.push(b);
                if i + 1 >= fcs_pos {
                    field.clear();
                    state = State::Fcs;
                }
            }

            State::Fcs => {
                if field.is_empty() {
                    field_start = run.starts[i];
                }
                field.push(b);
                if field.len() == 4 {
                    let wire: [u8; 4] = field[..].try_into().unwrap();
                    let good = check_eth_fcs(&bytes[crc_start..fcs_pos], wire);
                    let shown = u32::from_be_bytes(wire);
                    let sym = if good {
                        EthernetSymbol::FcsGood(shown)
                    } else {
                        pack.color = PacketColor::Error;
                        EthernetSymbol::FcsBad(shown)
                    };
                    out.symbols.push((field_start, run.ends[i], sym));

                    pack.len = run.ends[i] - pack.offset;
                    out.packet = Some(pack);
                    out.frame = Some((sfd_start, bytes[crc_start..].to_vec()));
                    return out;
                }
            }
        }
    }

    // Ran out of bytes mid-frame: keep the field symbols already emitted
    // but produce no packet and no capture record.
    trace!("byte run ended mid-frame, discarding partial packet");
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::eth_fcs;

    /// Build a byte run with 100 ns per byte and arbitrary epoch.
    fn run_of(bytes: Vec<u8>) -> ByteStream {
        let n = bytes.len() as i64;
        ByteStream {
            bytes,
            starts: (0..n).map(|i| i * 800_000_000).collect(),
            ends: (0..n).map(|i| (i + 1) * 800_000_000).collect(),
        }
    }

    fn test_frame(payload_len: usize) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x55; 7]);
        frame.push(0xd5);
        let body_start = frame.len();
        frame.extend_from_slice(&[0xff, 0xff, 0xff, 0xff, 0xff, 0xff]); // dst
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]); // src
        frame.extend_from_slice(&[0x08, 0x00]); // IPv4
        frame.extend((0..payload_len).map(|i| i as u8));
        let fcs = eth_fcs(&frame[body_start..]).to_le_bytes();
        frame.extend_from_slice(&fcs);
        frame
    }

    #[test]
    fn frames_a_valid_run() {
        let f = frame_run(&run_of(test_frame(46)));
        let pack = f.packet.expect("expected a packet");
        assert_eq!(pack.header("Dest MAC"), Some("ff:ff:ff:ff:ff:ff"));
        assert_eq!(pack.header("Src MAC"), Some("00:11:22:33:44:55"));
        assert_eq!(pack.header("Ethertype"), Some("IPv4"));
        assert_eq!(pack.color, PacketColor::Default);
        assert_eq!(pack.data, (0..46).map(|i| i as u8).collect::<Vec<_>>());

        let (_, frame_bytes) = f.frame.expect("expected a capture record");
        assert_eq!(frame_bytes.len(), 14 + 46 + 4);

        assert!(matches!(
            f.symbols.last().unwrap().2,
            EthernetSymbol::FcsGood(_)
        ));
    }

    #[test]
    fn corrupt_fcs_is_surfaced_not_dropped() {
        let mut bytes = test_frame(46);
        let n = bytes.len();
        bytes[n - 2] ^= 0x10;
        let f = frame_run(&run_of(bytes));
        let pack = f.packet.expect("bad-FCS frames still produce a packet");
        assert_eq!(pack.color, PacketColor::Error);
        assert!(matches!(
            f.symbols.last().unwrap().2,
            EthernetSymbol::FcsBad(_)
        ));
    }

    #[test]
    fn vlan_tagged_frame() {
        let mut frame = Vec::new();
        frame.extend_from_slice(&[0x55; 7]);
        frame.push(0xd5);
        let body_start = frame.len();
        frame.extend_from_slice(&[0xff; 6]);
        frame.extend_from_slice(&[0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
        frame.extend_from_slice(&[0x81, 0x00]); // 802.1q
        frame.extend_from_slice(&[0x20, 0x7b]); // PCP 1, VLAN 123
        frame.extend_from_slice(&[0x08, 0x06]); // ARP
        frame.extend([0u8; 46]);
        let fcs = eth_fcs(&frame[body_start..]).to_le_bytes();
        frame.extend_from_slice(&fcs);

        let f = frame_run(&run_of(frame));
        let pack = f.packet.unwrap();
        assert_eq!(pack.header("VLAN"), Some("123"));
        assert_eq!(pack.header("Ethertype"), Some("ARP"));
        assert!(f
            .symbols
            .iter()
            .any(|(_, _, s)| matches!(s, EthernetSymbol::VlanTag(0x207b))));
    }

    #[test]
    fn truncated_run_yields_no_packet() {
        let mut bytes = test_frame(46);
        bytes.truncate(20); // mid src MAC
        let f = frame_run(&run_of(bytes));
        assert!(f.packet.is_none());
        assert!(f.frame.is_none());
        // field symbols up to the truncation point survive
        assert!(f
            .symbols
            .iter()
            .any(|(_, _, s)| matches!(s, EthernetSymbol::DstMac(_))));
    }

    #[test]
    fn field_timestamps_come_from_the_byte_stream() {
        let run = run_of(test_frame(46));
        let f = frame_run(&run);
        // preamble spans bytes 0..7, SFD is byte 7, dst MAC bytes 8..14
        assert_eq!(f.symbols[0], (run.starts[0], run.starts[7], EthernetSymbol::Preamble));
        assert_eq!(f.symbols[1], (run.starts[7], run.ends[7], EthernetSymbol::Sfd));
        let (s, e, _) = f.symbols[2];
        assert_eq!((s, e), (run.starts[8], run.ends[13]));
    }
}
