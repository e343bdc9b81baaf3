//! Legacy libpcap capture-file output.
//!
//! Decoders that reconstruct standard link-layer traffic can stream each
//! completed frame to a pcap sink for inspection in ordinary capture
//! tooling. Only the classic (v2.4, microsecond) format is written.

use std::io::Write;

use crate::Result;

/// Magic for the classic pcap format with second + microsecond timestamps.
pub const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;
/// Upper bound on captured packet length recorded in the global header.
pub const SNAPLEN: u32 = 65535;

/// LINKTYPE_ETHERNET: IEEE 802.3 frames starting at the destination MAC,
/// FCS included, preamble and SFD stripped.
pub const LINKTYPE_ETHERNET: u32 = 1;

/// Writes the fixed 24-byte global header on construction, then one
/// 16-byte record header plus frame bytes per packet. All fields are
/// little-endian, matching the native byte order implied by the magic.
pub struct PcapWriter<W: Write> {
    w: W,
}

impl<W: Write> PcapWriter<W> {
    /// Create a writer and emit the global header.
    ///
    /// # Errors
    /// Any I/O error from the sink.
    pub fn new(mut w: W, linktype: u32) -> Result<Self> {
        w.write_all(&PCAP_MAGIC.to_le_bytes())?;
        w.write_all(&VERSION_MAJOR.to_le_bytes())?;
        w.write_all(&VERSION_MINOR.to_le_bytes())?;
        // thiszone and sigfigs, both always zero
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&0u32.to_le_bytes())?;
        w.write_all(&SNAPLEN.to_le_bytes())?;
        w.write_all(&linktype.to_le_bytes())?;
        Ok(PcapWriter { w })
    }

    /// Append one frame record with its capture timestamp.
    ///
    /// Captured and original length are both the frame length; this core
    /// never truncates frames it has fully decoded.
    ///
    /// # Errors
    /// Any I/O error from the sink.
    pub fn write_record(&mut self, sec: u32, usec: u32, frame: &[u8]) -> Result<()> {
        let len = frame.len() as u32;
        self.w.write_all(&sec.to_le_bytes())?;
        self.w.write_all(&usec.to_le_bytes())?;
        self.w.write_all(&len.to_le_bytes())?;
        self.w.write_all(&len.to_le_bytes())?;
        self.w.write_all(frame)?;
        self.w.flush()?;
        Ok(())
    }
}
