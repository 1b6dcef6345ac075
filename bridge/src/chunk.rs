//! Chunk header carried in front of every payload on the SPI wire and in every datagram.
//!
//! Layout (10 bytes, little-endian): `frame_id: u32`, `chunk_id: u16`, `flags: u8`,
//! `reserved: u8`, `payload_len: u16`. The bridge never rewrites these bytes; it only
//! reads `payload_len` to size the second SPI transaction.

/// Size of the on-wire chunk header in bytes.
pub const HEADER_LEN: usize = 10;

/// Compile-time capacity for a single chunk payload.
pub const PAYLOAD_MAX: usize = 2048;

/// Largest datagram the bridge can emit (header + full payload).
pub const DATAGRAM_MAX: usize = HEADER_LEN + PAYLOAD_MAX;

const PAYLOAD_LEN_OFFSET: usize = 8;

/// Decoded view of a chunk header.
///
/// Only `payload_len` matters to the bridge, the other fields are decoded for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub frame_id: u32,
    pub chunk_id: u16,
    pub flags: u8,
    pub reserved: u8,
    pub payload_len: u16,
}

impl ChunkHeader {
    /// Decodes a header from exactly [`HEADER_LEN`] bytes.
    pub fn decode(raw: &[u8; HEADER_LEN]) -> Self {
        Self {
            frame_id: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            chunk_id: u16::from_le_bytes([raw[4], raw[5]]),
            flags: raw[6],
            reserved: raw[7],
            payload_len: declared_payload_len(raw),
        }
    }

    /// Number of payload bytes the bridge will actually receive for this header.
    pub fn accepted_len(&self, payload_max: usize) -> usize {
        clamp_payload_len(self.payload_len, payload_max)
    }
}

/// Reads `payload_len` (bytes 8..10, little-endian) straight from the raw header.
pub fn declared_payload_len(raw: &[u8; HEADER_LEN]) -> u16 {
    u16::from_le_bytes([raw[PAYLOAD_LEN_OFFSET], raw[PAYLOAD_LEN_OFFSET + 1]])
}

/// Clamps a declared payload length to `payload_max`.
pub fn clamp_payload_len(declared: u16, payload_max: usize) -> usize {
    (declared as usize).min(payload_max)
}
