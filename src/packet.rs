//! Packet records produced by protocol decoders.

use serde::{Deserialize, Serialize};

/// Display classification for a packet, from a fixed palette.
///
/// The decoder core assigns the class; rendering is somebody else's job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PacketColor {
    /// Nothing notable about this packet.
    #[default]
    Default,
    /// Malformed, or indicating an error condition (bad checksum included).
    Error,
    /// Reading or writing status registers.
    Status,
    /// Reading or writing control registers.
    Control,
    /// Reading unspecified data.
    DataRead,
    /// Writing unspecified data.
    DataWrite,
    /// Executing a command of some sort.
    Command,
}

/// One decoded transaction: a group of protocol fields spanning a time
/// range, with human-readable headers and the raw payload bytes.
///
/// Packets are owned by the decoder that created them and are replaced
/// wholesale on every decode run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    /// Offset of the packet from the start of the capture, femtoseconds.
    pub offset: i64,
    /// Duration of the packet, femtoseconds.
    pub len: i64,
    /// Header columns in display order.
    pub headers: Vec<(String, String)>,
    /// Payload bytes.
    pub data: Vec<u8>,
    pub color: PacketColor,
}

impl Packet {
    #[must_use]
    pub fn new(offset: i64) -> Self {
        Packet {
            offset,
            ..Packet::default()
        }
    }

    /// End of the packet, femtoseconds from the start of the capture.
    #[must_use]
    pub fn end(&self) -> i64 {
        self.offset + self.len
    }

    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Set a header column, replacing any existing value for `name` without
    /// disturbing the column order.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self.headers.iter_mut().find(|(n, _)| n == name) {
            Some((_, v)) => *v = value,
            None => self.headers.push((name.to_string(), value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_display_order() {
        let mut p = Packet::new(0);
        p.set_header("Type", "Command");
        p.set_header("Code", "CMD17");
        p.set_header("Type", "Reply");
        assert_eq!(
            p.headers.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(),
            vec!["Type", "Code"]
        );
        assert_eq!(p.header("Type"), Some("Reply"));
        assert_eq!(p.header("Missing"), None);
    }

    #[test]
    fn serializes_for_inspection() {
        let mut p = Packet::new(1_000);
        p.len = 500;
        p.set_header("Ethertype", "IPv4");
        p.data = vec![1, 2, 3];
        p.color = PacketColor::Error;

        let json = serde_json::to_string(&p).unwrap();
        let back: Packet = serde_json::from_str(&json).unwrap();
        assert_eq!(p, back);
    }
}
