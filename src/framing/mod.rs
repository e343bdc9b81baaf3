//! Protocol framing state machines.
//!
//! Each submodule holds one protocol's framing FSM. They all follow the
//! same shape: consume a symbol/byte stream or a synchronized set of logic
//! channels, emit one typed output symbol per completed field with exact
//! source timestamps, surface malformation as in-band error symbols, and
//! group fields into [Packet] records.

pub mod ethernet;
pub mod manchester;
pub mod sdcmd;
pub mod spi;
pub mod usb2;

use serde::{Deserialize, Serialize};

use crate::packet::Packet;
use crate::waveform::{AnalogWaveform, DigitalWaveform, Waveform};
use crate::{Error, Result};

use ethernet::{EthernetDecoder, EthernetSymbol};
use sdcmd::{SdCmdDecoder, SdCmdSymbol};
use spi::{SpiDecoder, SpiSymbol};
use usb2::{Usb2PacketDecoder, Usb2PacketSymbol, Usb2PcsSymbol};

/// Per-sample display classification for decoded symbols.
///
/// The decoder core classifies; it never renders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SymbolColor {
    Idle,
    Preamble,
    Address,
    Control,
    Data,
    ChecksumOk,
    ChecksumBad,
    Error,
}

/// The kind of waveform a decoder input slot accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    Analog,
    Digital,
    /// Symbol output of an upstream USB2 physical-coding-sublayer decoder.
    Usb2Pcs,
}

/// A borrowed input waveform offered to a decoder slot.
///
/// Inputs are immutable for the duration of a decode.
#[derive(Debug, Clone, Copy)]
pub enum DecoderInput<'a> {
    Analog(&'a AnalogWaveform),
    Digital(&'a DigitalWaveform),
    Usb2Pcs(&'a Waveform<Usb2PcsSymbol>),
}

impl DecoderInput<'_> {
    #[must_use]
    pub fn kind(&self) -> ChannelKind {
        match self {
            DecoderInput::Analog(_) => ChannelKind::Analog,
            DecoderInput::Digital(_) => ChannelKind::Digital,
            DecoderInput::Usb2Pcs(_) => ChannelKind::Usb2Pcs,
        }
    }
}

/// The symbol waveform produced by one decode run, typed per protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum SymbolWaveform {
    Ethernet(Waveform<EthernetSymbol>),
    Usb2(Waveform<Usb2PacketSymbol>),
    Spi(Waveform<SpiSymbol>),
    SdCmd(Waveform<SdCmdSymbol>),
}

impl SymbolWaveform {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            SymbolWaveform::Ethernet(w) => w.len(),
            SymbolWaveform::Usb2(w) => w.len(),
            SymbolWaveform::Spi(w) => w.len(),
            SymbolWaveform::SdCmd(w) => w.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Display classification of sample `i`.
    #[must_use]
    pub fn color(&self, i: usize) -> SymbolColor {
        match self {
            SymbolWaveform::Ethernet(w) => w.samples[i].color(),
            SymbolWaveform::Usb2(w) => w.samples[i].color(),
            SymbolWaveform::Spi(w) => w.samples[i].color(),
            SymbolWaveform::SdCmd(w) => w.samples[i].color(),
        }
    }

    /// Display label of sample `i`.
    #[must_use]
    pub fn text(&self, i: usize) -> String {
        match self {
            SymbolWaveform::Ethernet(w) => w.samples[i].text(),
            SymbolWaveform::Usb2(w) => w.samples[i].text(),
            SymbolWaveform::Spi(w) => w.samples[i].text(),
            SymbolWaveform::SdCmd(w) => w.samples[i].text(),
        }
    }
}

/// Everything one decode run produces: exactly one output waveform and the
/// packet list, both owned and replacing any prior run's output wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutput {
    pub symbols: SymbolWaveform,
    pub packets: Vec<Packet>,
}

/// The set of protocol decoders, as a closed dispatch table keyed by
/// protocol name. Each variant owns its decoder's configuration and
/// working state.
pub enum ProtocolDecoder {
    Ethernet10BaseT(EthernetDecoder),
    Usb2Packet(Usb2PacketDecoder),
    Spi(SpiDecoder),
    SdCmd(SdCmdDecoder),
}

impl ProtocolDecoder {
    /// Names of every registered decoder, for enumeration in a UI or
    /// configuration file.
    pub const NAMES: [&'static str; 4] = [
        "Ethernet - 10baseT",
        "USB 1.x/2.0 Packet",
        "SPI",
        "SD Card Command Bus",
    ];

    /// Construct a decoder by registry name with default configuration.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "Ethernet - 10baseT" => {
                Some(ProtocolDecoder::Ethernet10BaseT(EthernetDecoder::default()))
            }
            "USB 1.x/2.0 Packet" => Some(ProtocolDecoder::Usb2Packet(Usb2PacketDecoder::default())),
            "SPI" => Some(ProtocolDecoder::Spi(SpiDecoder::default())),
            "SD Card Command Bus" => Some(ProtocolDecoder::SdCmd(SdCmdDecoder::default())),
            _ => None,
        }
    }

    #[must_use]
    pub fn protocol_name(&self) -> &'static str {
        match self {
            ProtocolDecoder::Ethernet10BaseT(_) => Self::NAMES[0],
            ProtocolDecoder::Usb2Packet(_) => Self::NAMES[1],
            ProtocolDecoder::Spi(_) => Self::NAMES[2],
            ProtocolDecoder::SdCmd(_) => Self::NAMES[3],
        }
    }

    /// Fixed header-column schema for this decoder's packets.
    #[must_use]
    pub fn headers(&self) -> &'static [&'static str] {
        match self {
            ProtocolDecoder::Ethernet10BaseT(_) => &["Dest MAC", "Src MAC", "VLAN", "Ethertype"],
            ProtocolDecoder::Usb2Packet(_) => &["Type", "Device", "Endpoint", "Length", "Details"],
            ProtocolDecoder::Spi(_) => &["Length"],
            ProtocolDecoder::SdCmd(_) => &["Type", "Code", "Command", "Info"],
        }
    }

    #[must_use]
    pub fn input_count(&self) -> usize {
        match self {
            ProtocolDecoder::Ethernet10BaseT(_) | ProtocolDecoder::Usb2Packet(_) => 1,
            ProtocolDecoder::Spi(_) => 3,
            ProtocolDecoder::SdCmd(_) => 2,
        }
    }

    /// Whether `kind` is acceptable on input slot `slot`.
    #[must_use]
    pub fn validate_channel(&self, slot: usize, kind: ChannelKind) -> bool {
        match self {
            ProtocolDecoder::Ethernet10BaseT(_) => slot == 0 && kind == ChannelKind::Analog,
            ProtocolDecoder::Usb2Packet(_) => slot == 0 && kind == ChannelKind::Usb2Pcs,
            ProtocolDecoder::Spi(_) => slot < 3 && kind == ChannelKind::Digital,
            ProtocolDecoder::SdCmd(_) => slot < 2 && kind == ChannelKind::Digital,
        }
    }

    /// Run one decode over the wired inputs.
    ///
    /// Decoding is synchronous and runs to completion; the output replaces
    /// any previous run's output wholesale.
    ///
    /// # Errors
    /// [Error::InvalidInput] when the wiring does not match the slot
    /// schema. Malformed signal content is not an error.
    pub fn decode(&mut self, inputs: &[DecoderInput]) -> Result<DecodeOutput> {
        let expected = self.input_count();
        if inputs.len() != expected {
            return Err(Error::InvalidInput {
                slot: inputs.len().min(expected),
                reason: format!("expected {expected} inputs, got {}", inputs.len()),
            });
        }
        for (slot, input) in inputs.iter().enumerate() {
            if !self.validate_channel(slot, input.kind()) {
                return Err(Error::InvalidInput {
                    slot,
                    reason: format!("channel kind {:?} not accepted", input.kind()),
                });
            }
        }

        match self {
            ProtocolDecoder::Ethernet10BaseT(d) => {
                let DecoderInput::Analog(din) = inputs[0] else {
                    unreachable!()
                };
                let (symbols, packets) = d.decode(din)?;
                Ok(DecodeOutput {
                    symbols: SymbolWaveform::Ethernet(symbols),
                    packets,
                })
            }
            ProtocolDecoder::Usb2Packet(d) => {
                let DecoderInput::Usb2Pcs(din) = inputs[0] else {
                    unreachable!()
                };
                let (symbols, packets) = d.decode(din);
                Ok(DecodeOutput {
                    symbols: SymbolWaveform::Usb2(symbols),
                    packets,
                })
            }
            ProtocolDecoder::Spi(d) => {
                let (DecoderInput::Digital(clk), DecoderInput::Digital(csn), DecoderInput::Digital(data)) =
                    (inputs[0], inputs[1], inputs[2])
                else {
                    unreachable!()
                };
                let (symbols, packets) = d.decode(clk, csn, data);
                Ok(DecodeOutput {
                    symbols: SymbolWaveform::Spi(symbols),
                    packets,
                })
            }
            ProtocolDecoder::SdCmd(d) => {
                let (DecoderInput::Digital(clk), DecoderInput::Digital(cmd)) =
                    (inputs[0], inputs[1])
                else {
                    unreachable!()
                };
                let (symbols, packets) = d.decode(clk, cmd);
                Ok(DecodeOutput {
                    symbols: SymbolWaveform::SdCmd(symbols),
                    packets,
                })
            }
        }
    }

    /// Whether `next` may be merged into the group started by `first` and
    /// most recently extended with `cur`, for presentation purposes.
    #[must_use]
    pub fn can_merge(&self, first: &Packet, cur: &Packet, next: &Packet) -> bool {
        match self {
            ProtocolDecoder::SdCmd(d) => d.can_merge(first, cur, next),
            _ => false,
        }
    }

    /// Synthesize the summary row for a merge group starting at `packets[i]`.
    #[must_use]
    pub fn merged_header(&self, packets: &[Packet], i: usize) -> Option<Packet> {
        match self {
            ProtocolDecoder::SdCmd(d) => d.merged_header(packets, i),
            _ => None,
        }
    }
}
