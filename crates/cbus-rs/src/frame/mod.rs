//! Defines the CAN frame structure and header helpers shared by every layer.

pub mod opcode;
pub mod queue;

pub use queue::FrameQueue;

use crate::types::DEFAULT_PRIORITY;
use core::fmt;

/// Maximum CAN data payload length.
pub const MAX_FRAME_LEN: usize = 8;

/// A single CAN frame as exchanged with the transport.
///
/// `id` holds the full 11-bit arbitration identifier; the low 7 bits carry
/// the sender's CAN identifier and bits 7-10 the message priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CanFrame {
    pub id: u32,
    pub ext: bool,
    pub rtr: bool,
    pub len: u8,
    pub data: [u8; MAX_FRAME_LEN],
}

impl CanFrame {
    /// Creates a standard data frame from a payload slice.
    /// Slices longer than eight bytes are truncated.
    pub fn from_data(payload: &[u8]) -> Self {
        let mut frame = CanFrame::default();
        let len = payload.len().min(MAX_FRAME_LEN);
        frame.len = len as u8;
        frame.data[..len].copy_from_slice(&payload[..len]);
        frame
    }

    /// Extracts the sender's 7-bit CAN identifier from the header.
    pub fn can_id(&self) -> u8 {
        (self.id & 0x7f) as u8
    }

    /// The opcode byte, or `None` for a zero-length frame.
    pub fn opcode(&self) -> Option<u8> {
        if self.len > 0 { Some(self.data[0]) } else { None }
    }

    /// The node number field (data bytes 1-2, big-endian).
    pub fn node_number(&self) -> u16 {
        ((self.data[1] as u16) << 8) | self.data[2] as u16
    }

    /// The event number field (data bytes 3-4, big-endian).
    pub fn event_number(&self) -> u16 {
        ((self.data[3] as u16) << 8) | self.data[4] as u16
    }

    /// The valid portion of the data payload.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }

    /// Populates the 11-bit header: `(priority << 7) | (can_id & 0x7f)`.
    ///
    /// Bits 9-10 are the major priority, bits 7-8 the minor priority;
    /// zeroes equate to higher priority on the bus.
    pub fn set_header(&mut self, can_id: u8, priority: u8) {
        self.id = ((priority as u32 & 0x0f) << 7) | (can_id as u32 & 0x7f);
    }

    /// Convenience form of [`set_header`](Self::set_header) with the default priority.
    pub fn set_default_header(&mut self, can_id: u8) {
        self.set_header(can_id, DEFAULT_PRIORITY);
    }
}

impl fmt::Display for CanFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{:03X}]{}{} len={} data={:02X?}",
            self.id,
            if self.ext { " EXT" } else { "" },
            if self.rtr { " RTR" } else { "" },
            self.len,
            self.payload()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let mut frame = CanFrame::default();
        frame.set_header(0x63, 0x0B);
        // 0b1011 << 7 | 0x63
        assert_eq!(frame.id, 0x5E3);
        assert_eq!(frame.can_id(), 0x63);
    }

    #[test]
    fn test_field_extraction() {
        let frame = CanFrame::from_data(&[0x90, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(frame.opcode(), Some(0x90));
        assert_eq!(frame.node_number(), 0x0102);
        assert_eq!(frame.event_number(), 0x0304);
    }

    #[test]
    fn test_zero_length_frame_has_no_opcode() {
        let frame = CanFrame::from_data(&[]);
        assert_eq!(frame.opcode(), None);
        assert!(frame.payload().is_empty());
    }
}
