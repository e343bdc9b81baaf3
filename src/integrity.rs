//! Protocol integrity checks.
//!
//! Pure functions computing each protocol's CRC over a byte range and
//! comparing against the transmitted value. Framing machines call these at
//! field completion and tag the resulting symbol good or bad; a mismatch is
//! never silently dropped, since surfacing it is the point of the tool.
//!
//! Bit order matters everywhere here: serial protocols ship bytes LSB
//! first, so check fields reassembled byte-wise from the wire appear
//! little-endian (Ethernet FCS, USB CRC-16) or bit-reversed relative to the
//! value the protocol spec prints (USB CRC-5).

use crc::{Crc, CRC_16_USB, CRC_32_ISO_HDLC};
use rayon::prelude::*;

/// CRC-32 with the Ethernet polynomial, reflected, init/final 0xffffffff.
pub const ETH_CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-16 as used for USB data payloads: polynomial 0x8005 reflected,
/// init 0xffff, complemented on output.
pub const USB_CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_USB);

/// Compute the Ethernet frame check sequence over `data` (destination MAC
/// through the last payload byte).
#[must_use]
pub fn eth_fcs(data: &[u8]) -> u32 {
    ETH_CRC32.checksum(data)
}

/// Validate a received FCS field against the frame contents. `fcs` holds
/// the four check bytes in wire order (least significant byte first).
#[must_use]
pub fn check_eth_fcs(data: &[u8], fcs: [u8; 4]) -> bool {
    u32::from_le_bytes(fcs) == eth_fcs(data)
}

/// Validate FCS fields for many frames at once.
///
/// Each element pairs a frame's protected byte range with its received
/// check bytes. Every range is independent so the work is data-parallel;
/// the result is bit-identical to calling [check_eth_fcs] in a loop.
#[must_use]
pub fn check_eth_fcs_batch(frames: &[(&[u8], [u8; 4])]) -> Vec<bool> {
    frames
        .par_iter()
        .map(|(data, fcs)| check_eth_fcs(data, *fcs))
        .collect()
}

/// Compute the USB CRC-16 over a data packet payload.
#[must_use]
pub fn usb_crc16(data: &[u8]) -> u16 {
    USB_CRC16.checksum(data)
}

/// Validate a USB data CRC-16. `crc` holds the two check bytes in wire
/// order (least significant byte first).
#[must_use]
pub fn check_usb_crc16(data: &[u8], crc: [u8; 2]) -> bool {
    u16::from_le_bytes(crc) == usb_crc16(data)
}

/// Check the CRC-5 of a USB token, given both bytes following the PID
/// exactly as received (11 bits of payload plus the 5-bit check field).
///
/// Table-based per Joost, "A Fast Compact CRC5 Checker For
/// Microcontrollers": running the checker across the payload *and* the
/// transmitted check field leaves the fixed residual 0x06 when the token
/// is intact.
#[must_use]
pub fn check_usb_crc5(token: [u8; 2]) -> bool {
    const TABLE4: [u8; 16] = [
        0x00, 0x0e, 0x1c, 0x12, 0x11, 0x1f, 0x0d, 0x03, //
        0x0b, 0x05, 0x17, 0x19, 0x1a, 0x14, 0x06, 0x08,
    ];
    const TABLE0: [u8; 16] = [
        0x00, 0x16, 0x05, 0x13, 0x0a, 0x1c, 0x0f, 0x19, //
        0x14, 0x02, 0x11, 0x07, 0x1e, 0x08, 0x1b, 0x0d,
    ];

    let mut crc = 0x1f;
    for b in token {
        let x = b ^ crc;
        crc = TABLE4[(x & 0xf) as usize] ^ TABLE0[((x >> 4) & 0xf) as usize];
    }
    crc == 0x06
}

/// Compute the SD bus CRC-7 (polynomial x^7 + x^3 + 1, MSB first, zero
/// init) over `data`. The bus transmits it in the upper 7 bits of the
/// final byte of a command or response.
#[must_use]
pub fn sd_crc7(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &d in data {
        for i in (0..8).rev() {
            let bit = (d >> i) & 1;
            let msb = (crc >> 6) & 1;
            crc = (crc << 1) & 0x7f;
            if msb ^ bit == 1 {
                crc ^= 0x09;
            }
        }
    }
    crc
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn crc32_reference_vector() {
        assert_eq!(eth_fcs(b"123456789"), 0xcbf4_3926);
    }

    #[test]
    fn fcs_round_trip() {
        let frame = hex::decode("ffffffffffff00112233445508060001").unwrap();
        let fcs = eth_fcs(&frame).to_le_bytes();
        assert!(check_eth_fcs(&frame, fcs));

        let mut bad = fcs;
        bad[2] ^= 0x40;
        assert!(!check_eth_fcs(&frame, bad));
    }

    #[test]
    fn fcs_batch_matches_scalar() {
        let frames: Vec<Vec<u8>> = (0u8..32).map(|i| vec![i; 64 + i as usize]).collect();
        let jobs: Vec<(&[u8], [u8; 4])> = frames
            .iter()
            .enumerate()
            .map(|(i, f)| {
                let mut fcs = eth_fcs(f).to_le_bytes();
                if i % 3 == 0 {
                    fcs[0] ^= 1;
                }
                (f.as_slice(), fcs)
            })
            .collect();

        let par = check_eth_fcs_batch(&jobs);
        let seq: Vec<bool> = jobs.iter().map(|(d, c)| check_eth_fcs(d, *c)).collect();
        assert_eq!(par, seq);
        assert!(seq.iter().enumerate().all(|(i, ok)| *ok == (i % 3 != 0)));
    }

    #[test]
    fn crc16_reference_vector() {
        assert_eq!(usb_crc16(b"123456789"), 0xb4c8);
    }

    #[test]
    fn crc16_round_trip() {
        let data = [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x12, 0x00];
        let crc = usb_crc16(&data).to_le_bytes();
        assert!(check_usb_crc16(&data, crc));
        assert!(!check_usb_crc16(&data, [crc[0] ^ 0x01, crc[1]]));
    }

    // Token for address 0x15, endpoint 0xe: the 5-bit check field in wire
    // bit order is 0x1d. SOF for frame number 0x710: field 0x05.
    #[test_case([0x15, 0x07 | (0x1d << 3)], true; "setup token")]
    #[test_case([0x10, 0x07 | (0x05 << 3)], true; "sof frame 0x710")]
    #[test_case([0x15, 0x07 | (0x17 << 3)], false; "wrong check field")]
    #[test_case([0x14, 0x07 | (0x1d << 3)], false; "corrupted address")]
    fn crc5_tokens(token: [u8; 2], ok: bool) {
        assert_eq!(check_usb_crc5(token), ok);
    }

    // 40-bit command frames from the SD physical layer spec: CMD0 with zero
    // argument carries CRC 0x4a (final byte 0x95), CMD17 carries 0x2a.
    #[test_case(&[0x40, 0, 0, 0, 0], 0x4a; "cmd0")]
    #[test_case(&[0x51, 0, 0, 0, 0], 0x2a; "cmd17")]
    #[test_case(&[0x77, 0, 0, 0, 0], 0x32; "cmd55")]
    fn crc7_commands(frame: &[u8], expected: u8) {
        assert_eq!(sd_crc7(frame), expected);
    }
}
