//! Single-context long message handler.
//!
//! Handles one inbound reconstruction and one outbound transmission at a
//! time, with a caller-sized receive buffer. Suitable for small targets with
//! limited memory: when the receive buffer fills mid-message, the
//! accumulated bytes are flushed to the application callback with an
//! `Incomplete` status and reassembly continues into the emptied buffer.
//! Because of this flushing, a declared length larger than the buffer is
//! not an error here and `Truncated` is never reported; only the pooled
//! [`LongMessageEx`](super::LongMessageEx), which must hold a whole message
//! in one context, rejects oversized declarations with `Truncated`.

use super::{
    FLAG_CRC_PRESENT, FRAGMENT_DATA_LEN, FragmentCallback, LongMessageConfig, LongMessageError,
    LongMessageProtocol, LongMessageStatus, crc16, crc16_update, data_fragment, header_fragment,
};
use crate::frame::CanFrame;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// One inbound and one outbound long message stream at a time.
pub struct LongMessage {
    config: LongMessageConfig,
    callback: FragmentCallback,
    subscribed: Vec<u8>,

    // Receive state.
    receiving: bool,
    rx_stream: u8,
    rx_sender: u8,
    rx_buffer: Vec<u8>,
    rx_used: usize,
    rx_declared_len: usize,
    rx_received: usize,
    rx_expected_seq: u8,
    rx_crc_declared: u16,
    rx_crc_running: u16,
    rx_crc_present: bool,
    rx_last_fragment: u64,

    // Send state.
    sending: bool,
    tx_stream: u8,
    tx_priority: u8,
    tx_buffer: Vec<u8>,
    tx_len: usize,
    tx_offset: usize,
    tx_seq: u8,
    tx_crc: u16,
    tx_last_sent: u64,
}

impl LongMessage {
    /// Creates a handler with the given receive and send buffer capacities.
    pub fn new(
        receive_buffer_len: usize,
        send_buffer_len: usize,
        config: LongMessageConfig,
        callback: FragmentCallback,
    ) -> Self {
        Self {
            config,
            callback,
            subscribed: Vec::new(),
            receiving: false,
            rx_stream: 0,
            rx_sender: 0,
            rx_buffer: vec![0; receive_buffer_len.max(1)],
            rx_used: 0,
            rx_declared_len: 0,
            rx_received: 0,
            rx_expected_seq: 0,
            rx_crc_declared: 0,
            rx_crc_running: 0,
            rx_crc_present: false,
            rx_last_fragment: 0,
            sending: false,
            tx_stream: 0,
            tx_priority: 0,
            tx_buffer: vec![0; send_buffer_len.max(1)],
            tx_len: 0,
            tx_offset: 0,
            tx_seq: 0,
            tx_crc: 0,
            tx_last_sent: 0,
        }
    }

    /// Registers the stream identifiers this node reassembles.
    pub fn subscribe(&mut self, stream_ids: &[u8]) {
        self.subscribed.clear();
        self.subscribed.extend_from_slice(stream_ids);
    }

    fn release_rx(&mut self) {
        self.receiving = false;
        self.rx_used = 0;
        self.rx_received = 0;
    }

    fn deliver(&mut self, status: LongMessageStatus) {
        let used = self.rx_used;
        (self.callback)(&self.rx_buffer[..used], self.rx_stream, status);
    }

    fn begin_receive(&mut self, frame: &CanFrame, now_ms: u64) {
        self.receiving = true;
        self.rx_stream = frame.data[1];
        self.rx_sender = frame.can_id();
        self.rx_used = 0;
        self.rx_received = 0;
        self.rx_declared_len = (((frame.data[3] as u16) << 8) | frame.data[4] as u16) as usize;
        self.rx_crc_declared = ((frame.data[5] as u16) << 8) | frame.data[6] as u16;
        self.rx_crc_present = frame.data[7] & FLAG_CRC_PRESENT != 0;
        self.rx_crc_running = 0xFFFF;
        self.rx_expected_seq = 1;
        self.rx_last_fragment = now_ms;
        debug!(
            "Long message stream {} started, {} bytes declared",
            self.rx_stream, self.rx_declared_len
        );

        if self.rx_declared_len == 0 {
            self.deliver(LongMessageStatus::Complete);
            self.release_rx();
        }
    }

    fn finish_receive(&mut self) {
        let status = if self.rx_crc_present
            && self.config.use_crc
            && self.rx_crc_running != self.rx_crc_declared
        {
            warn!(
                "Long message stream {} CRC mismatch: got {:#06X}, declared {:#06X}",
                self.rx_stream, self.rx_crc_running, self.rx_crc_declared
            );
            LongMessageStatus::CrcError
        } else {
            LongMessageStatus::Complete
        };
        self.deliver(status);
        self.release_rx();
    }
}

impl LongMessageProtocol for LongMessage {
    fn send_message(
        &mut self,
        data: &[u8],
        stream_id: u8,
        priority: u8,
    ) -> Result<(), LongMessageError> {
        if self.sending {
            return Err(LongMessageError::StreamBusy);
        }
        if data.len() > self.tx_buffer.len() {
            return Err(LongMessageError::MessageTooLong);
        }

        self.tx_buffer[..data.len()].copy_from_slice(data);
        self.tx_len = data.len();
        self.tx_offset = 0;
        self.tx_stream = stream_id;
        self.tx_priority = priority;
        self.tx_seq = 0;
        self.tx_crc = if self.config.use_crc { crc16(data) } else { 0 };
        self.tx_last_sent = 0;
        self.sending = true;
        debug!(
            "Long message stream {} queued for send, {} bytes",
            stream_id,
            data.len()
        );
        Ok(())
    }

    fn handle_fragment(&mut self, frame: &CanFrame, now_ms: u64) {
        if frame.len < 3 {
            return;
        }
        let stream_id = frame.data[1];
        let sequence = frame.data[2];

        if sequence == 0 {
            // Stream header. Only subscribed streams acquire the context,
            // and only if it is idle or being restarted by the same peer.
            if !self.subscribed.contains(&stream_id) {
                return;
            }
            if self.receiving && (stream_id != self.rx_stream || frame.can_id() != self.rx_sender) {
                trace!("Already receiving stream {}, header ignored", self.rx_stream);
                return;
            }
            self.begin_receive(frame, now_ms);
            return;
        }

        if !self.receiving || stream_id != self.rx_stream || frame.can_id() != self.rx_sender {
            return;
        }

        if now_ms.saturating_sub(self.rx_last_fragment) >= self.config.receive_timeout_ms {
            warn!("Long message stream {} timed out", stream_id);
            self.deliver(LongMessageStatus::TimeoutError);
            self.release_rx();
            return;
        }

        if sequence != self.rx_expected_seq {
            warn!(
                "Long message stream {} sequence error: got {}, expected {}",
                stream_id, sequence, self.rx_expected_seq
            );
            self.deliver(LongMessageStatus::SequenceError);
            self.release_rx();
            return;
        }

        let remaining = self.rx_declared_len - self.rx_received;
        let take = (frame.len as usize - 3).min(remaining);
        for &byte in &frame.data[3..3 + take] {
            self.rx_buffer[self.rx_used] = byte;
            self.rx_used += 1;
            self.rx_received += 1;
            self.rx_crc_running = crc16_update(self.rx_crc_running, byte);

            // Small-buffer mode: flush and keep going.
            if self.rx_used == self.rx_buffer.len() && self.rx_received < self.rx_declared_len {
                self.deliver(LongMessageStatus::Incomplete);
                self.rx_used = 0;
            }
        }

        self.rx_expected_seq = self.rx_expected_seq.wrapping_add(1);
        self.rx_last_fragment = now_ms;

        if self.rx_received >= self.rx_declared_len {
            self.finish_receive();
        }
    }

    fn poll_transmit(&mut self, now_ms: u64) -> Option<(CanFrame, u8)> {
        if !self.sending {
            return None;
        }

        if self.tx_seq == 0 {
            // Header fragment goes out immediately.
            let flags = if self.config.use_crc {
                FLAG_CRC_PRESENT
            } else {
                0
            };
            let frame = header_fragment(self.tx_stream, self.tx_len as u16, self.tx_crc, flags);
            self.tx_seq = 1;
            self.tx_last_sent = now_ms;
            if self.tx_len == 0 {
                self.sending = false;
            }
            return Some((frame, self.tx_priority));
        }

        if now_ms.saturating_sub(self.tx_last_sent) < self.config.fragment_delay_ms {
            return None;
        }

        let end = (self.tx_offset + FRAGMENT_DATA_LEN).min(self.tx_len);
        let frame = data_fragment(self.tx_stream, self.tx_seq, &self.tx_buffer[self.tx_offset..end]);
        self.tx_offset = end;
        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.tx_last_sent = now_ms;

        if self.tx_offset >= self.tx_len {
            trace!("Long message stream {} fully sent", self.tx_stream);
            self.sending = false;
        }
        Some((frame, self.tx_priority))
    }

    fn tick(&mut self, now_ms: u64) {
        if self.receiving
            && now_ms.saturating_sub(self.rx_last_fragment) >= self.config.receive_timeout_ms
        {
            warn!("Long message stream {} timed out", self.rx_stream);
            self.deliver(LongMessageStatus::TimeoutError);
            self.release_rx();
        }
    }

    fn is_sending(&self) -> bool {
        self.sending
    }
}
