//! USB 1.x/2.0 packet framing.
//!
//! Consumes the symbol stream of an upstream physical-coding-sublayer
//! decoder (SYNC / data byte / EOP), assembles packet fields, validates
//! token CRC-5 and data CRC-16, and groups packets into transactions.
//!
//! Data packets need the deferred-CRC mechanic: bytes are provisionally
//! payload until the EOP terminator reveals that the last two were the
//! CRC-16. Provisional symbols are held in a working list and only
//! committed to the published output at frame end, so a capture that ends
//! mid-packet discards the unterminated tail instead of publishing it.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::SymbolColor;
use crate::integrity::{check_usb_crc16, check_usb_crc5};
use crate::packet::{Packet, PacketColor};
use crate::waveform::Waveform;

/// Output of a USB2 PCS decoder, the input symbol type here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usb2PcsSymbol {
    Sync,
    Data(u8),
    Eop,
    Error,
}

/// USB packet identifiers (low nibble of the PID byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Pid {
    Reserved = 0x0,
    Out = 0x1,
    Ack = 0x2,
    Data0 = 0x3,
    Ping = 0x4,
    Sof = 0x5,
    Nyet = 0x6,
    Data2 = 0x7,
    Split = 0x8,
    In = 0x9,
    Nak = 0xa,
    Data1 = 0xb,
    PreErr = 0xc,
    Setup = 0xd,
    Stall = 0xe,
    Mdata = 0xf,
}

impl Pid {
    #[must_use]
    pub fn from_nibble(nibble: u8) -> Pid {
        match nibble & 0xf {
            0x1 => Pid::Out,
            0x2 => Pid::Ack,
            0x3 => Pid::Data0,
            0x4 => Pid::Ping,
            0x5 => Pid::Sof,
            0x6 => Pid::Nyet,
            0x7 => Pid::Data2,
            0x8 => Pid::Split,
            0x9 => Pid::In,
            0xa => Pid::Nak,
            0xb => Pid::Data1,
            0xc => Pid::PreErr,
            0xd => Pid::Setup,
            0xe => Pid::Stall,
            0xf => Pid::Mdata,
            _ => Pid::Reserved,
        }
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Pid::Reserved => "RESERVED",
            Pid::Out => "OUT",
            Pid::Ack => "ACK",
            Pid::Data0 => "DATA0",
            Pid::Ping => "PING",
            Pid::Sof => "SOF",
            Pid::Nyet => "NYET",
            Pid::Data2 => "DATA2",
            Pid::Split => "SPLIT",
            Pid::In => "IN",
            Pid::Nak => "NAK",
            Pid::Data1 => "DATA1",
            Pid::PreErr => "PRE/ERR",
            Pid::Setup => "SETUP",
            Pid::Stall => "STALL",
            Pid::Mdata => "MDATA",
        }
    }
}

/// One field of a USB packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Usb2PacketSymbol {
    /// Full PID byte, check nibble included.
    Pid(u8),
    Addr(u8),
    Endp(u8),
    /// SOF frame number (11 bits).
    Nframe(u16),
    Data(u8),
    /// CRC-5 check field in wire bit order.
    Crc5Good(u8),
    Crc5Bad(u8),
    /// CRC-16 as transmitted, first byte high.
    Crc16Good(u16),
    Crc16Bad(u16),
    Error,
}

impl Usb2PacketSymbol {
    #[must_use]
    pub fn color(&self) -> SymbolColor {
        match self {
            Usb2PacketSymbol::Pid(_) => SymbolColor::Preamble,
            Usb2PacketSymbol::Addr(_) | Usb2PacketSymbol::Endp(_) => SymbolColor::Address,
            Usb2PacketSymbol::Nframe(_) => SymbolColor::Control,
            Usb2PacketSymbol::Data(_) => SymbolColor::Data,
            Usb2PacketSymbol::Crc5Good(_) | Usb2PacketSymbol::Crc16Good(_) => {
                SymbolColor::ChecksumOk
            }
            Usb2PacketSymbol::Crc5Bad(_) | Usb2PacketSymbol::Crc16Bad(_) => {
                SymbolColor::ChecksumBad
            }
            Usb2PacketSymbol::Error => SymbolColor::Error,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        match self {
            Usb2PacketSymbol::Pid(b) => Pid::from_nibble(*b).name().to_string(),
            Usb2PacketSymbol::Addr(a) => format!("Dev {a}"),
            Usb2PacketSymbol::Endp(e) => format!("EP {e}"),
            Usb2PacketSymbol::Nframe(n) => format!("Frame {n}"),
            Usb2PacketSymbol::Data(b) => format!("{b:02x}"),
            Usb2PacketSymbol::Crc5Good(c) | Usb2PacketSymbol::Crc5Bad(c) => {
                format!("CRC: {c:02x}")
            }
            Usb2PacketSymbol::Crc16Good(c) | Usb2PacketSymbol::Crc16Bad(c) => {
                format!("CRC: {c:04x}")
            }
            Usb2PacketSymbol::Error => "ERROR".to_string(),
        }
    }
}

/// Frames USB packets from PCS symbols and groups them into transactions.
#[derive(Debug, Clone, Copy, Default)]
pub struct Usb2PacketDecoder;

enum State {
    Idle,
    Pid,
    End,
    Token0,
    Token1,
    Sof0,
    Sof1,
    Data,
}

/// A symbol not yet committed to the output waveform. Offsets and
/// durations are in input ticks.
struct WorkingSymbol {
    off: i64,
    dur: i64,
    sym: Usb2PacketSymbol,
}

impl Usb2PacketDecoder {
    /// Decode the PCS symbol stream. Replaces any previous output
    /// wholesale.
    #[must_use]
    pub fn decode(
        &mut self,
        din: &Waveform<Usb2PcsSymbol>,
    ) -> (Waveform<Usb2PacketSymbol>, Vec<Packet>) {
        let mut cap: Waveform<Usb2PacketSymbol> = Waveform::with_timebase_of(din);

        let mut state = State::Idle;
        let mut last = 0u8;
        let mut last_offset = 0i64;
        let mut crc5_in = [0u8; 2];
        let mut packet_data: Vec<u8> = Vec::new();
        // Provisionally-payload symbols, committed at frame end
        let mut tentative: Vec<WorkingSymbol> = Vec::new();

        for i in 0..din.len() {
            let sin = din.samples[i];
            let off = din.offsets[i];
            let dur = din.durations[i];
            let halfdur = dur / 2;

            match state {
                State::Idle => match sin {
                    Usb2PcsSymbol::Sync => state = State::Pid,
                    _ => cap.push(off, dur, Usb2PacketSymbol::Error),
                },

                State::Pid => {
                    let Usb2PcsSymbol::Data(d) = sin else {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    };
                    // Low nibble must be the complement of the high nibble
                    if (d >> 4) != (!d & 0xf) {
                        debug!(byte = d, "bad PID check nibble");
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    }
                    cap.push(off, dur, Usb2PacketSymbol::Pid(d));

                    state = match Pid::from_nibble(d) {
                        Pid::Ack | Pid::Stall | Pid::Nak | Pid::Nyet | Pid::PreErr => State::End,
                        Pid::In | Pid::Out | Pid::Setup | Pid::Ping | Pid::Split => State::Token0,
                        Pid::Sof => State::Sof0,
                        Pid::Data0 | Pid::Data1 | Pid::Data2 | Pid::Mdata => {
                            packet_data.clear();
                            State::Data
                        }
                        Pid::Reserved => {
                            cap.push(off, dur, Usb2PacketSymbol::Error);
                            State::Idle
                        }
                    };
                }

                State::End => {
                    if sin != Usb2PcsSymbol::Eop {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                    }
                }

                // Token fields cross byte boundaries: 7 bits of address,
                // 4 of endpoint, 5 of CRC packed into two bytes.
                State::Token0 => {
                    let Usb2PcsSymbol::Data(d) = sin else {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    };
                    cap.push(off, dur, Usb2PacketSymbol::Addr(d & 0x7f));
                    crc5_in[0] = d;
                    last = d;
                    state = State::Token1;
                }

                State::Token1 => {
                    let Usb2PcsSymbol::Data(d) = sin else {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    };
                    cap.push(
                        off,
                        halfdur,
                        Usb2PacketSymbol::Endp((last >> 7) | ((d & 0x7) << 1)),
                    );
                    crc5_in[1] = d;
                    let field = d >> 3;
                    let sym = if check_usb_crc5(crc5_in) {
                        Usb2PacketSymbol::Crc5Good(field)
                    } else {
                        Usb2PacketSymbol::Crc5Bad(field)
                    };
                    cap.push(off + halfdur, halfdur, sym);
                    state = State::End;
                }

                State::Sof0 => {
                    let Usb2PcsSymbol::Data(d) = sin else {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    };
                    last = d;
                    last_offset = off;
                    crc5_in[0] = d;
                    state = State::Sof1;
                }

                State::Sof1 => {
                    let Usb2PcsSymbol::Data(d) = sin else {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    };
                    // Frame number is the whole previous byte plus our low
                    // three bits
                    cap.push(
                        last_offset,
                        off - last_offset + halfdur,
                        Usb2PacketSymbol::Nframe(u16::from(d & 0x7) << 8 | u16::from(last)),
                    );
                    crc5_in[1] = d;
                    let field = d >> 3;
                    let sym = if check_usb_crc5(crc5_in) {
                        Usb2PacketSymbol::Crc5Good(field)
                    } else {
                        Usb2PacketSymbol::Crc5Bad(field)
                    };
                    cap.push(off + halfdur, halfdur, sym);
                    state = State::End;
                }

                State::Data => match sin {
                    // Provisionally payload; might turn out to be the CRC
                    Usb2PcsSymbol::Data(d) => {
                        tentative.push(WorkingSymbol {
                            off,
                            dur,
                            sym: Usb2PacketSymbol::Data(d),
                        });
                        packet_data.push(d);
                    }

                    // The terminator: the last two provisional bytes were
                    // actually the CRC-16. Retype them into one merged
                    // check symbol, then commit the whole frame.
                    Usb2PcsSymbol::Eop => {
                        if tentative.len() >= 2 {
                            let second = tentative.pop().unwrap();
                            let first = tentative.pop().unwrap();
                            let (Usb2PacketSymbol::Data(b0), Usb2PacketSymbol::Data(b1)) =
                                (first.sym, second.sym)
                            else {
                                unreachable!("only data symbols are tentative")
                            };
                            packet_data.pop();
                            packet_data.pop();

                            let shown = u16::from_be_bytes([b0, b1]);
                            let sym = if check_usb_crc16(&packet_data, [b0, b1]) {
                                Usb2PacketSymbol::Crc16Good(shown)
                            } else {
                                Usb2PacketSymbol::Crc16Bad(shown)
                            };
                            tentative.push(WorkingSymbol {
                                off: first.off,
                                dur: first.dur + second.dur,
                                sym,
                            });
                        } else {
                            trace!("data packet too short to hold a CRC16");
                            tentative.push(WorkingSymbol {
                                off,
                                dur,
                                sym: Usb2PacketSymbol::Error,
                            });
                        }
                        for w in tentative.drain(..) {
                            cap.push(w.off, w.dur, w.sym);
                        }
                    }

                    _ => {
                        cap.push(off, dur, Usb2PacketSymbol::Error);
                        state = State::Idle;
                        continue;
                    }
                },
            }

            // EOP always returns us to idle
            if sin == Usb2PcsSymbol::Eop {
                state = State::Idle;
            }
        }

        if !tentative.is_empty() {
            trace!(
                dropped = tentative.len(),
                "capture ended mid data packet, discarding tentative symbols"
            );
            tentative.clear();
        }

        let packets = find_packets(&cap);
        (cap, packets)
    }
}

/// Group the framed symbols into transaction-level packets.
fn find_packets(cap: &Waveform<Usb2PacketSymbol>) -> Vec<Packet> {
    let mut packets = Vec::new();
    if cap.len() < 2 {
        return packets;
    }

    let mut i = 0;
    while i + 2 < cap.len() {
        let istart = i;
        let Usb2PacketSymbol::Pid(pid) = cap.samples[i] else {
            // Every transaction starts with a PID; discard unknown garbage
            i += 1;
            continue;
        };
        i += 1;

        match Pid::from_nibble(pid) {
            Pid::Sof => {
                if let Some(p) = decode_sof(cap, istart, &mut i) {
                    packets.push(p);
                }
            }
            Pid::Setup => {
                if let Some(p) = decode_setup(cap, istart, &mut i) {
                    packets.push(p);
                }
            }
            Pid::In | Pid::Out => {
                if let Some(p) = decode_data(cap, istart, &mut i) {
                    packets.push(p);
                }
            }
            other => {
                trace!(pid = ?other, "unexpected transaction-start PID");
            }
        }
    }
    packets
}

fn decode_sof(cap: &Waveform<Usb2PacketSymbol>, istart: usize, i: &mut usize) -> Option<Packet> {
    if *i + 1 >= cap.len() {
        trace!("truncated SOF");
        return None;
    }
    let Usb2PacketSymbol::Nframe(n) = cap.samples[*i] else {
        return None;
    };
    *i += 1;
    let icrc = *i;
    *i += 1;
    let Usb2PacketSymbol::Crc5Good(_) = cap.samples[icrc] else {
        return None;
    };

    let mut pack = Packet::new(cap.time_of(istart));
    pack.len = cap.end_of(icrc) - pack.offset;
    pack.set_header("Type", "SOF");
    pack.set_header("Device", "--");
    pack.set_header("Endpoint", "--");
    pack.set_header("Length", "2");
    pack.set_header("Details", format!("Sequence = {n}"));
    pack.color = PacketColor::Status;
    Some(pack)
}

/// Pull the ADDR / ENDP / CRC5 fields of a token. Returns the CRC-good
/// flag so callers can classify the transaction.
fn token_fields(cap: &Waveform<Usb2PacketSymbol>, i: &mut usize) -> Option<(u8, u8, bool)> {
    if *i + 2 >= cap.len() {
        trace!("truncated token");
        return None;
    }
    let Usb2PacketSymbol::Addr(addr) = cap.samples[*i] else {
        return None;
    };
    *i += 1;
    let Usb2PacketSymbol::Endp(endp) = cap.samples[*i] else {
        return None;
    };
    *i += 1;
    let good = match cap.samples[*i] {
        Usb2PacketSymbol::Crc5Good(_) => true,
        Usb2PacketSymbol::Crc5Bad(_) => false,
        _ => return None,
    };
    *i += 1;
    Some((addr, endp, good))
}

fn decode_setup(cap: &Waveform<Usb2PacketSymbol>, istart: usize, i: &mut usize) -> Option<Packet> {
    let (addr, endp, crc_ok) = token_fields(cap, i)?;

    // Expect DATA0 with the 8-byte request, then a CRC16
    if *i + 9 >= cap.len() {
        trace!("truncated SETUP data stage");
        return None;
    }
    let Usb2PacketSymbol::Pid(dpid) = cap.samples[*i] else {
        return None;
    };
    if Pid::from_nibble(dpid) != Pid::Data0 {
        return None;
    }
    *i += 1;

    let mut req = [0u8; 8];
    for byte in &mut req {
        let Usb2PacketSymbol::Data(d) = cap.samples[*i] else {
            return None;
        };
        *byte = d;
        *i += 1;
    }
    let idcrc = *i;
    *i += 1;
    let data_crc_ok = matches!(cap.samples[idcrc], Usb2PacketSymbol::Crc16Good(_));

    // Expect a handshake
    let mut ack = "none";
    let mut iend = idcrc;
    if *i < cap.len() {
        if let Usb2PacketSymbol::Pid(hpid) = cap.samples[*i] {
            ack = Pid::from_nibble(hpid).name();
            iend = *i;
            *i += 1;
        }
    }

    let bm_request_type = req[0];
    let b_request = req[1];
    let w_value = u16::from_le_bytes([req[2], req[3]]);
    let w_index = u16::from_le_bytes([req[4], req[5]]);
    let w_length = u16::from_le_bytes([req[6], req[7]]);
    let dir = if bm_request_type & 0x80 != 0 { "IN" } else { "OUT" };
    let rtype = match (bm_request_type >> 5) & 3 {
        0 => "Standard",
        1 => "Class",
        2 => "Vendor",
        _ => "Reserved",
    };

    let mut pack = Packet::new(cap.time_of(istart));
    pack.len = cap.end_of(iend) - pack.offset;
    pack.set_header("Type", "SETUP");
    pack.set_header("Device", format!("{addr}"));
    pack.set_header("Endpoint", format!("{endp}"));
    pack.set_header("Length", "8");
    pack.set_header(
        "Details",
        format!(
            "{rtype} {dir} bRequest=0x{b_request:02x} wValue=0x{w_value:04x} \
             wIndex=0x{w_index:04x} wLength={w_length} [{ack}]"
        ),
    );
    pack.data = req.to_vec();
    pack.color = if crc_ok && data_crc_ok {
        PacketColor::Control
    } else {
        PacketColor::Error
    };
    Some(pack)
}

fn decode_data(cap: &Waveform<Usb2PacketSymbol>, istart: usize, i: &mut usize) -> Option<Packet> {
    let Usb2PacketSymbol::Pid(tpid) = cap.samples[istart] else {
        return None;
    };
    let token = Pid::from_nibble(tpid);
    let (addr, endp, crc_ok) = token_fields(cap, i)?;

    let mut pack = Packet::new(cap.time_of(istart));
    pack.set_header("Type", token.name());
    pack.set_header("Device", format!("{addr}"));
    pack.set_header("Endpoint", format!("{endp}"));
    pack.color = match token {
        Pid::In => PacketColor::DataRead,
        _ => PacketColor::DataWrite,
    };

    // The function may answer with a handshake (NAK/STALL) instead of data
    if *i >= cap.len() {
        trace!("truncated transaction");
        return None;
    }
    let Usb2PacketSymbol::Pid(p2) = cap.samples[*i] else {
        return None;
    };
    let mut iend = *i;
    *i += 1;
    match Pid::from_nibble(p2) {
        Pid::Nak | Pid::Stall => {
            pack.set_header("Length", "0");
            pack.set_header("Details", Pid::from_nibble(p2).name());
            pack.len = cap.end_of(iend) - pack.offset;
            return Some(pack);
        }
        Pid::Data0 | Pid::Data1 => {}
        _ => return None,
    }

    // Data stage: bytes up to the CRC16 symbol
    let mut data_crc_ok = false;
    while *i < cap.len() {
        match cap.samples[*i] {
            Usb2PacketSymbol::Data(d) => {
                pack.data.push(d);
                *i += 1;
            }
            Usb2PacketSymbol::Crc16Good(_) => {
                data_crc_ok = true;
                iend = *i;
                *i += 1;
                break;
            }
            Usb2PacketSymbol::Crc16Bad(_) => {
                iend = *i;
                *i += 1;
                break;
            }
            _ => return None,
        }
    }

    // Handshake, if captured
    let mut ack = "none";
    if *i < cap.len() {
        if let Usb2PacketSymbol::Pid(hpid) = cap.samples[*i] {
            ack = Pid::from_nibble(hpid).name();
            iend = *i;
            *i += 1;
        }
    }

    pack.set_header("Length", format!("{}", pack.data.len()));
    pack.set_header("Details", ack);
    pack.len = cap.end_of(iend) - pack.offset;
    if !crc_ok || !data_crc_ok {
        pack.color = PacketColor::Error;
    }
    Some(pack)
}
