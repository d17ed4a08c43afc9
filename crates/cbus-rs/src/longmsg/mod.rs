//! Long message support per RFC 0005: a reliable fragmentation/reassembly
//! protocol layered over normal frame dispatch for payloads exceeding a
//! single frame.
//!
//! Every fragment travels in a DTXC frame. The first fragment of a stream
//! (sequence 0) is a header declaring the total message length, an optional
//! CRC and a flags byte; subsequent fragments carry up to five payload bytes
//! each with a wrapping sequence number. Stream faults are reported only to
//! the registered application callback, never onto the bus.

pub mod multi;
pub mod single;

pub use multi::LongMessageEx;
pub use single::LongMessage;

use crate::frame::{CanFrame, opcode};
use crate::types::{LONG_MESSAGE_DEFAULT_DELAY_MS, LONG_MESSAGE_RECEIVE_TIMEOUT_MS};
use alloc::boxed::Box;
use core::fmt;

/// Payload bytes carried by one data fragment.
pub const FRAGMENT_DATA_LEN: usize = 5;

/// Header-fragment flag bit: a CRC is present and must be verified.
pub const FLAG_CRC_PRESENT: u8 = 0x01;

/// Status values delivered to the application fragment callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongMessageStatus {
    /// Intermediate fragment delivered because the receive buffer filled;
    /// informational, the stream continues.
    Incomplete,
    /// All declared bytes received (and the CRC verified, if enabled).
    Complete,
    /// A fragment arrived with an unexpected sequence number.
    SequenceError,
    /// The stream went idle for longer than the configured timeout.
    TimeoutError,
    /// All bytes received but the trailing CRC did not match.
    CrcError,
    /// The declared message length exceeds the receive buffer capacity.
    Truncated,
    /// No receive context was free for a new stream.
    InternalError,
}

/// Errors returned when a long message cannot be accepted for sending.
/// Failed sends have no side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LongMessageError {
    /// The message exceeds the send buffer capacity.
    MessageTooLong,
    /// A send for this stream identifier is already in progress.
    StreamBusy,
    /// Every send context is occupied.
    NoFreeContext,
}

impl fmt::Display for LongMessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MessageTooLong => write!(f, "Message exceeds the send buffer capacity"),
            Self::StreamBusy => write!(f, "A send is already in progress for this stream"),
            Self::NoFreeContext => write!(f, "All send contexts are occupied"),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for LongMessageError {}

/// User callback receiving the accumulated payload, the stream identifier
/// and a delivery status.
pub type FragmentCallback = Box<dyn FnMut(&[u8], u8, LongMessageStatus)>;

/// Startup-time configuration shared by both protocol forms.
#[derive(Debug, Clone, Copy)]
pub struct LongMessageConfig {
    /// Delay between successive fragments of one outbound stream.
    pub fragment_delay_ms: u64,
    /// Idle timeout aborting a stalled inbound stream.
    pub receive_timeout_ms: u64,
    /// Append and verify a CRC-16 over the message body.
    pub use_crc: bool,
    /// Service one send context to completion before starting another;
    /// when false, concurrent sends interleave fragment-by-fragment.
    pub sequential: bool,
}

impl Default for LongMessageConfig {
    fn default() -> Self {
        Self {
            fragment_delay_ms: LONG_MESSAGE_DEFAULT_DELAY_MS,
            receive_timeout_ms: LONG_MESSAGE_RECEIVE_TIMEOUT_MS,
            use_crc: false,
            sequential: false,
        }
    }
}

/// The seam between the dispatch engine and a long message implementation.
///
/// The engine forwards every DTXC frame unchanged through
/// [`handle_fragment`](Self::handle_fragment), polls
/// [`poll_transmit`](Self::poll_transmit) for due outbound fragments (the
/// returned priority is baked into the frame header by the engine) and calls
/// [`tick`](Self::tick) once per driving-loop pass to expire idle streams.
pub trait LongMessageProtocol {
    /// Accepts a message for fragmented transmission. Fails without side
    /// effects when no context can take it.
    fn send_message(
        &mut self,
        data: &[u8],
        stream_id: u8,
        priority: u8,
    ) -> Result<(), LongMessageError>;

    /// Consumes one received DTXC frame.
    fn handle_fragment(&mut self, frame: &CanFrame, now_ms: u64);

    /// Returns the next outbound fragment that is due, with its priority.
    fn poll_transmit(&mut self, now_ms: u64) -> Option<(CanFrame, u8)>;

    /// Polls inbound streams against the idle timeout.
    fn tick(&mut self, now_ms: u64);

    /// Returns true while at least one outbound message is in flight.
    fn is_sending(&self) -> bool;
}

/// Builds the stream header fragment (sequence 0).
pub(crate) fn header_fragment(stream_id: u8, msg_len: u16, crc: u16, flags: u8) -> CanFrame {
    CanFrame::from_data(&[
        opcode::DTXC,
        stream_id,
        0,
        (msg_len >> 8) as u8,
        msg_len as u8,
        (crc >> 8) as u8,
        crc as u8,
        flags,
    ])
}

/// Builds a data fragment carrying up to five payload bytes.
pub(crate) fn data_fragment(stream_id: u8, sequence: u8, chunk: &[u8]) -> CanFrame {
    let mut data = [0u8; 8];
    data[0] = opcode::DTXC;
    data[1] = stream_id;
    data[2] = sequence;
    let len = chunk.len().min(FRAGMENT_DATA_LEN);
    data[3..3 + len].copy_from_slice(&chunk[..len]);
    CanFrame::from_data(&data[..3 + len])
}

/// Incremental CRC-16 update (reflected polynomial 0xA001).
pub(crate) fn crc16_update(mut crc: u16, byte: u8) -> u16 {
    crc ^= byte as u16;
    for _ in 0..8 {
        if crc & 1 != 0 {
            crc = (crc >> 1) ^ 0xA001;
        } else {
            crc >>= 1;
        }
    }
    crc
}

/// CRC-16 over a whole buffer, initial value 0xFFFF.
pub(crate) fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc, &b| crc16_update(crc, b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc16_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc16_incremental_matches_whole_buffer() {
        let data = b"fragmented message body";
        let running = data.iter().fold(0xFFFF, |crc, &b| crc16_update(crc, b));
        assert_eq!(running, crc16(data));
    }

    #[test]
    fn test_header_fragment_layout() {
        let frame = header_fragment(7, 0x0123, 0xBEEF, FLAG_CRC_PRESENT);
        assert_eq!(frame.len, 8);
        assert_eq!(
            frame.payload(),
            &[opcode::DTXC, 7, 0, 0x01, 0x23, 0xBE, 0xEF, 0x01]
        );
    }

    #[test]
    fn test_data_fragment_layout() {
        let frame = data_fragment(7, 3, &[0xAA, 0xBB]);
        assert_eq!(frame.payload(), &[opcode::DTXC, 7, 3, 0xAA, 0xBB]);
    }
}
