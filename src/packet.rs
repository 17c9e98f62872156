//! miio packet header codec
//!
//! Every miio datagram starts with a fixed 32 byte header:
//!
//! ```text
//!  0      2        4          8           12        16                32
//!  +------+--------+----------+-----------+---------+-----------------+
//!  |magic | length | unknown  | device id | stamp   | checksum/token  |
//!  +------+--------+----------+-----------+---------+-----------------+
//! ```
//!
//! All integers are big endian. Discovery only needs the header; payload
//! encryption is handled by the device connection layer.

use crate::error::{MiioError, Result};

/// Fixed header length in bytes
pub const HEADER_LEN: usize = 32;

/// Magic prefix of every miio packet
pub const MAGIC: u16 = 0x2131;

/// Length of the checksum/token field
pub const CHECKSUM_LEN: usize = 16;

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    pub length: u16,
    pub unknown: u32,
    pub device_id: u32,
    pub stamp: u32,
    pub checksum: [u8; CHECKSUM_LEN],
}

impl PacketHeader {
    /// Header of a discovery reply from the given device
    pub fn reply(device_id: u32, stamp: u32, checksum: [u8; CHECKSUM_LEN]) -> Self {
        Self {
            magic: MAGIC,
            length: HEADER_LEN as u16,
            unknown: 0,
            device_id,
            stamp,
            checksum,
        }
    }

    /// Encode the header into its wire form
    pub fn to_bytes(&self) -> [u8; HEADER_LEN] {
        let mut buf = [0u8; HEADER_LEN];
        buf[0..2].copy_from_slice(&self.magic.to_be_bytes());
        buf[2..4].copy_from_slice(&self.length.to_be_bytes());
        buf[4..8].copy_from_slice(&self.unknown.to_be_bytes());
        buf[8..12].copy_from_slice(&self.device_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.stamp.to_be_bytes());
        buf[16..32].copy_from_slice(&self.checksum);
        buf
    }

    /// Stable identifier used to key service records
    pub fn service_id(&self) -> String {
        self.device_id.to_string()
    }
}

/// Decode the header of an inbound datagram.
///
/// Only the length is validated; anything at least [`HEADER_LEN`] bytes long
/// decodes.
pub fn decode(buf: &[u8]) -> Result<PacketHeader> {
    if buf.len() < HEADER_LEN {
        return Err(MiioError::MalformedPacket {
            expected: HEADER_LEN,
            actual: buf.len(),
        });
    }

    let mut checksum = [0u8; CHECKSUM_LEN];
    checksum.copy_from_slice(&buf[16..32]);

    Ok(PacketHeader {
        magic: u16::from_be_bytes([buf[0], buf[1]]),
        length: u16::from_be_bytes([buf[2], buf[3]]),
        unknown: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
        device_id: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
        stamp: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
        checksum,
    })
}

/// Build the broadcast handshake probe.
///
/// Magic and length are set, every other header byte is `0xff`.
pub fn build_handshake() -> [u8; HEADER_LEN] {
    let mut buf = [0xffu8; HEADER_LEN];
    buf[0..2].copy_from_slice(&MAGIC.to_be_bytes());
    buf[2..4].copy_from_slice(&(HEADER_LEN as u16).to_be_bytes());
    buf
}
