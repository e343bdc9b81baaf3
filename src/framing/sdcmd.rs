//! SD card command-bus framing.
//!
//! The CMD line carries 48-bit command and response frames, sampled on the
//! rising edge of CLK: start bit, transmitter bit, 6-bit index, 32-bit
//! argument, CRC-7, stop bit. CMD2 responses are 136 bits with no CRC, and
//! ACMD41 responses carry a constant 0x7f in place of a real check.
//!
//! Reference: SD Physical Layer Simplified Specification v8.00, 4.7-4.9.

use serde::{Deserialize, Serialize};
use tracing::trace;

use super::SymbolColor;
use crate::edges::sample_on_rising_edges;
use crate::integrity::sd_crc7;
use crate::packet::{Packet, PacketColor};
use crate::waveform::{DigitalWaveform, Waveform};

/// One field of an SD command or response frame.
///
/// Command codes are stored with application commands offset by 100, so
/// ACMD41 is 141. This keeps ACMDs distinct from the plain command with
/// the same index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SdCmdSymbol {
    /// Start of frame; true for a host command, false for a card response.
    Header { command: bool },
    Command(u8),
    CommandArgs(u32),
    ResponseArgs(u32),
    /// The 128-bit payload of an R2 (CID/CSD) response.
    ResponseArgs128([u32; 4]),
    CrcOk(u8),
    CrcBad(u8),
    Error,
}

impl SdCmdSymbol {
    #[must_use]
    pub fn color(&self) -> SymbolColor {
        match self {
            SdCmdSymbol::Header { .. } => SymbolColor::Preamble,
            SdCmdSymbol::Command(_) => SymbolColor::Address,
            SdCmdSymbol::CommandArgs(_)
            | SdCmdSymbol::ResponseArgs(_)
            | SdCmdSymbol::ResponseArgs128(_) => SymbolColor::Data,
            SdCmdSymbol::CrcOk(_) => SymbolColor::ChecksumOk,
            SdCmdSymbol::CrcBad(_) => SymbolColor::ChecksumBad,
            SdCmdSymbol::Error => SymbolColor::Error,
        }
    }

    #[must_use]
    pub fn text(&self) -> String {
        match self {
            SdCmdSymbol::Header { command: true } => "CMD".to_string(),
            SdCmdSymbol::Header { command: false } => "REPLY".to_string(),
            SdCmdSymbol::Command(c) => match command_name(*c) {
                Some(name) => name.to_string(),
                None => code_of(*c),
            },
            SdCmdSymbol::CommandArgs(a) | SdCmdSymbol::ResponseArgs(a) => format!("{a:08x}"),
            SdCmdSymbol::ResponseArgs128(w) => {
                format!("{:08x}{:08x}{:08x}{:08x}", w[0], w[1], w[2], w[3])
            }
            SdCmdSymbol::CrcOk(c) => format!("CRC: {c:02x}"),
            SdCmdSymbol::CrcBad(c) => format!("CRC BAD: {c:02x}"),
            SdCmdSymbol::Error => "ERROR".to_string(),
        }
    }
}

/// "CMDn" / "ACMDn" for a (possibly ACMD-offset) command code.
fn code_of(code: u8) -> String {
    if code >= 100 {
        format!("ACMD{}", code - 100)
    } else {
        format!("CMD{code}")
    }
}

/// Names for the commands commonly seen on generic SD cards.
fn command_name(code: u8) -> Option<&'static str> {
    Some(match code {
        0 => "GO_IDLE_STATE",
        2 => "ALL_SEND_CID",
        3 => "SEND_RELATIVE_ADDR",
        6 => "SWITCH_FUNCTION",
        7 => "SELECT_CARD",
        8 => "SEND_IF_COND",
        9 => "SEND_CSD",
        10 => "SEND_CID",
        12 => "STOP_TRANSMISSION",
        13 => "SEND_STATUS",
        16 => "SET_BLOCKLEN",
        17 => "READ_SINGLE_BLOCK",
        18 => "READ_MULTIPLE_BLOCK",
        24 => "WRITE_BLOCK",
        25 => "WRITE_MULTIPLE_BLOCK",
        55 => "APP_CMD",
        106 => "SET_BUS_WIDTH",
        113 => "SD_STATUS",
        141 => "SD_SEND_OP_COND",
        151 => "SEND_SCR",
        _ => return None,
    })
}

/// Decodes the SD card command bus from CLK and CMD logic channels.
#[derive(Debug, Clone, Copy, Default)]
pub struct SdCmdDecoder;

enum State {
    Idle,
    Type,
    CommandHeader,
    ResponseHeader,
    CommandBody,
    ResponseBody,
    Crc,
    Stop,
}

impl SdCmdDecoder {
    /// Decode one capture. Replaces any previous output wholesale.
    #[must_use]
    pub fn decode(
        &mut self,
        clk: &DigitalWaveform,
        cmd: &DigitalWaveform,
    ) -> (Waveform<SdCmdSymbol>, Vec<Packet>) {
        // CMD is sampled on rising CLK edges; the sampled stream uses
        // femtosecond timestamps so offsets below need no scaling.
        let dcmd = sample_on_rising_edges(cmd, clk);

        let mut cap: Waveform<SdCmdSymbol> = Waveform::with_timebase_of(&dcmd);
        let mut packets: Vec<Packet> = Vec::new();

        let mut state = State::Idle;
        let mut tstart = 0i64;
        let mut nbit = 0u32;
        let mut data = 0u32;
        let mut extdata = [0u32; 4];

        // Raw header fields of the frame in flight, for the CRC check
        let mut is_command = false;
        let mut raw_index = 0u8;
        let mut arg = 0u32;

        // ACMD tracking: CMD55 makes the next command an application
        // command, coded +100
        let mut last_cmd = 0u8;
        let mut app_cmd = false;

        let mut pack: Option<Packet> = None;

        for i in 0..dcmd.len() {
            let b = dcmd.samples[i];
            let off = dcmd.offsets[i];
            let end = off + dcmd.durations[i];

            match state {
                // Wait for a start bit
                State::Idle => {
                    if !b {
                        tstart = off;
                        state = State::Type;

                        // Reset any incomplete packet that got aborted
                        let p = pack.get_or_insert_with(Packet::default);
                        p.headers.clear();
                        p.data.clear();
                        p.color = PacketColor::Default;
                        p.offset = off;
                        p.len = 0;
                    }
                }

                // Transmitter bit: 1 = host command, 0 = card response
                State::Type => {
                    cap.push(tstart, end - tstart, SdCmdSymbol::Header { command: b });
                    is_command = b;
                    tstart = end;
                    nbit = 0;
                    data = 0;
                    if let Some(p) = pack.as_mut() {
                        p.set_header("Type", if b { "Command" } else { "Reply" });
                    }
                    state = if b {
                        State::CommandHeader
                    } else {
                        State::ResponseHeader
                    };
                }

                // 6-bit command index
                State::CommandHeader | State::ResponseHeader => {
                    data = (data << 1) | u32::from(b);
                    nbit += 1;
                    if nbit == 6 {
                        raw_index = data as u8;
                        let mut coded = data as u8;
                        if is_command {
                            if coded == 55 {
                                app_cmd = true;
                            } else if app_cmd {
                                coded += 100;
                                app_cmd = false;
                            }
                            last_cmd = coded;
                        } else if app_cmd {
                            coded += 100;
                        }

                        let sym = SdCmdSymbol::Command(coded);
                        cap.push(tstart, end - tstart, sym);

                        if let Some(p) = pack.as_mut() {
                            p.set_header("Code", code_of(last_cmd));
                            p.set_header("Command", sym.text());
                            p.color = if is_command {
                                match coded {
                                    17 | 18 => PacketColor::DataRead,
                                    24 | 25 => PacketColor::DataWrite,
                                    _ => PacketColor::Control,
                                }
                            } else {
                                PacketColor::Status
                            };
                        }

                        data = 0;
                        nbit = 0;
                        tstart = end;
                        state = if is_command {
                            State::CommandBody
                        } else {
                            State::ResponseBody
                        };
                    }
                }

                // 32-bit command argument
                State::CommandBody => {
                    data = (data << 1) | u32::from(b);
                    nbit += 1;
                    if nbit == 32 {
                        arg = data;
                        let sym = SdCmdSymbol::CommandArgs(data);
                        cap.push(tstart, end - tstart, sym);
                        if let Some(p) = pack.as_mut() {
                            p.set_header("Info", sym.text());
                        }

                        data = 0;
                        nbit = 0;
                        tstart = end;
                        state = State::Crc;
                    }
                }

                State::ResponseBody => {
                    data = (data << 1) | u32::from(b);
                    nbit += 1;

                    // CMD2 has a 128-bit response with no CRC
                    if last_cmd == 2 {
                        if nbit % 32 == 0 {
                            extdata[(nbit as usize / 32) - 1] = data;
                            data = 0;
                        }
                        if nbit == 128 {
                            let sym = SdCmdSymbol::ResponseArgs128(extdata);
                            cap.push(tstart, end - tstart, sym);
                            if let Some(mut p) = pack.take() {
                                p.set_header("Info", sym.text());
                                p.len = end - p.offset;
                                packets.push(p);
                            }
                            // stop bit is parsed as the last data bit
                            state = State::Idle;
                        }
                    } else if nbit == 32 {
                        arg = data;
                        let sym = SdCmdSymbol::ResponseArgs(data);
                        cap.push(tstart, end - tstart, sym);
                        if let Some(p) = pack.as_mut() {
                            p.set_header("Info", sym.text());
                        }

                        data = 0;
                        nbit = 0;
                        tstart = end;
                        state = State::Crc;
                    }
                }

                // 7-bit CRC over the 40 bits from the transmitter bit on.
                // ACMD41 responses always carry 0x7f here, not a real CRC
                // (4.9.4), so the check is skipped for them.
                State::Crc => {
                    data = (data << 1) | u32::from(b);
                    nbit += 1;
                    if nbit == 7 {
                        let got = data as u8;
                        let exempt = !is_command && last_cmd == 141;
                        let mut frame = [0u8; 5];
                        frame[0] = (u8::from(is_command) << 6) | raw_index;
                        frame[1..5].copy_from_slice(&arg.to_be_bytes());
                        let sym = if exempt || sd_crc7(&frame) == got {
                            SdCmdSymbol::CrcOk(got)
                        } else {
                            trace!(got, "bad command CRC");
                            if let Some(p) = pack.as_mut() {
                                p.color = PacketColor::Error;
                            }
                            SdCmdSymbol::CrcBad(got)
                        };
                        cap.push(tstart, end - tstart, sym);
                        state = State::Stop;
                    }
                }

                State::Stop => {
                    if !b {
                        cap.push(off, end - off, SdCmdSymbol::Error);
                    }
                    if let Some(mut p) = pack.take() {
                        p.len = end - p.offset;
                        packets.push(p);
                    }
                    state = State::Idle;
                }
            }
        }

        (cap, packets)
    }

    /// Merge a reply into its command, and ACMD sequences into their CMD55
    /// prefix, for presentation.
    #[must_use]
    pub fn can_merge(&self, _first: &Packet, cur: &Packet, next: &Packet) -> bool {
        let cur_type = cur.header("Type");
        let next_type = next.header("Type");

        // Reply follows the command it answers
        if cur_type == Some("Command") && next_type == Some("Reply") {
            return true;
        }
        // An ACMD request follows the CMD55 reply that announced it
        if cur_type == Some("Reply") && cur.header("Code") == Some("CMD55") && next_type == Some("Command") {
            return true;
        }
        // Powerup polling: ACMD41 reply followed by another CMD55
        if cur_type == Some("Reply")
            && cur.header("Code") == Some("ACMD41")
            && next_type == Some("Command")
            && next.header("Code") == Some("CMD55")
        {
            return true;
        }
        false
    }

    /// Summary row for a merge group starting at `packets[i]`.
    #[must_use]
    pub fn merged_header(&self, packets: &[Packet], i: usize) -> Option<Packet> {
        let pack = packets.get(i)?;
        if pack.header("Type") != Some("Command") {
            return None;
        }

        let mut ret = Packet::new(pack.offset);
        ret.len = pack.len;
        let mut src = pack;

        // A CMD55 group is really about the ACMD that follows it
        if pack.header("Code") == Some("CMD55") {
            if let Some(next) = packets.get(i + 2) {
                src = next;
            }
        }
        ret.set_header("Type", "Command");
        for key in ["Code", "Command", "Info"] {
            if let Some(v) = src.header(key) {
                ret.set_header(key, v.to_string());
            }
        }
        ret.color = src.color;
        Some(ret)
    }
}
