use std::fmt;

use crate::error::SwitchError;
use crate::pool::PooledBuf;

/// Minimum Ethernet frame: 14-byte header, empty payload.
pub const MIN_FRAME_SIZE: usize = 14;
/// Maximum untagged Ethernet frame: 14-byte header + 1500-byte MTU + 4-byte FCS slot.
pub const MAX_FRAME_SIZE: usize = 1518;
/// Every frame on the wire is preceded by a 4-byte big-endian length.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// A 48-bit Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit: low-order bit of the first octet. Broadcast is a subset.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 == 0x01
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddr(bytes)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A parsed Ethernet frame backed by a pooled buffer.
///
/// The parse is zero-copy: accessors slice into the buffer, and the buffer
/// goes back to its pool when the frame is dropped.
pub struct EthernetFrame {
    buf: PooledBuf,
    len: usize,
}

impl EthernetFrame {
    /// Validate `len` bytes of `buf` as an Ethernet frame.
    ///
    /// Enforces the `[14, 1518]` length window and rejects all-zero source
    /// MACs. The buffer travels with the frame so its lifetime covers every
    /// later access.
    pub fn parse(buf: PooledBuf, len: usize) -> Result<Self, SwitchError> {
        if len < MIN_FRAME_SIZE {
            return Err(SwitchError::FrameTooShort(len));
        }
        if len > MAX_FRAME_SIZE || len > buf.len() {
            return Err(SwitchError::FrameTooLong(len));
        }
        let frame = Self { buf, len };
        if frame.src_mac().is_zero() {
            return Err(SwitchError::ZeroSourceMac);
        }
        Ok(frame)
    }

    pub fn dst_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buf[0..6]);
        MacAddr(mac)
    }

    pub fn src_mac(&self) -> MacAddr {
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&self.buf[6..12]);
        MacAddr(mac)
    }

    pub fn ether_type(&self) -> u16 {
        u16::from_be_bytes([self.buf[12], self.buf[13]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[MIN_FRAME_SIZE..self.len]
    }

    /// The full frame as it appeared on the wire (header + payload).
    pub fn bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_broadcast(&self) -> bool {
        self.dst_mac().is_broadcast()
    }

    pub fn is_multicast(&self) -> bool {
        self.dst_mac().is_multicast()
    }
}

impl fmt::Display for EthernetFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Frame[{} -> {}, type=0x{:04x}, len={}]",
            self.src_mac(),
            self.dst_mac(),
            self.ether_type(),
            self.len
        )
    }
}
