//! Ping frames used as a liveness probe
//!
//! A ping is a 32-byte header followed by an 8-byte payload. The header layout
//! (little-endian) is:
//!
//! | Offset | Size | Field |
//! |---|---|---|
//! | 0 | 8 | signature `MSdbgV1\0` |
//! | 8 | 4 | header CRC |
//! | 12 | 4 | payload CRC |
//! | 16 | 4 | command (0 = ping) |
//! | 20 | 2 | sequence |
//! | 22 | 2 | reply sequence |
//! | 24 | 4 | flags |
//! | 28 | 4 | payload length |
//!
//! Only the byte count of the reply matters to discovery; the frames are
//! constants so nothing here depends on the full debugger protocol.

use std::time::Duration;

/// Packet signature at the start of every header
pub const SIGNATURE: &[u8; 8] = b"MSdbgV1\0";

/// Ping header, CRCs precomputed
pub const PING_HEADER: [u8; 32] = [
    0x4D, 0x53, 0x64, 0x62, 0x67, 0x56, 0x31, 0x00, // signature
    0x2F, 0xC0, 0x60, 0x66, // header CRC
    0xCA, 0xDC, 0xA1, 0x5B, // payload CRC
    0x00, 0x00, 0x00, 0x00, // command: ping
    0x01, 0x00, // sequence
    0x00, 0x00, // reply sequence
    0x00, 0x00, 0x00, 0x00, // flags
    0x08, 0x00, 0x00, 0x00, // payload length
];

/// Ping payload: source = host, no debugger flags
pub const PING_PAYLOAD: [u8; 8] = [0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Size of the reply a live target sends back
pub const PING_RESPONSE_LEN: usize = 32;

/// Bound on each of the two ping writes
pub const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Bound on reading the reply
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);

const CRC_POLY: u32 = 0x04C1_1DB7;

/// MSB-first CRC-32 (poly 0x04C11DB7, no reflection, no final xor)
pub fn frame_crc(data: &[u8], init: u32) -> u32 {
    let mut crc = init;
    for &byte in data {
        crc ^= u32::from(byte) << 24;
        for _ in 0..8 {
            crc = if crc & 0x8000_0000 != 0 {
                (crc << 1) ^ CRC_POLY
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Payload length field embedded in a header
pub fn payload_len(header: &[u8; 32]) -> u32 {
    u32::from_le_bytes([header[28], header[29], header[30], header[31]])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(header: &[u8; 32], offset: usize) -> u32 {
        u32::from_le_bytes([
            header[offset],
            header[offset + 1],
            header[offset + 2],
            header[offset + 3],
        ])
    }

    #[test]
    fn test_header_signature() {
        assert_eq!(&PING_HEADER[..8], SIGNATURE);
    }

    #[test]
    fn test_embedded_length_matches_payload() {
        assert_eq!(payload_len(&PING_HEADER) as usize, PING_PAYLOAD.len());
    }

    #[test]
    fn test_payload_crc() {
        assert_eq!(field(&PING_HEADER, 12), frame_crc(&PING_PAYLOAD, 0));
    }

    #[test]
    fn test_header_crc_computed_with_zeroed_field() {
        let mut header = PING_HEADER;
        header[8..12].copy_from_slice(&[0, 0, 0, 0]);
        assert_eq!(field(&PING_HEADER, 8), frame_crc(&header, 0));
    }
}
