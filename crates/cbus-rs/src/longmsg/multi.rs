//! Pooled long message handler.
//!
//! Maintains fixed pools of receive and send contexts so several streams can
//! be reassembled and transmitted concurrently. Outbound contexts are
//! serviced either sequentially (one stream runs to completion before the
//! next starts) or round-robin, fragment by fragment, per the configuration.

use super::{
    FLAG_CRC_PRESENT, FRAGMENT_DATA_LEN, FragmentCallback, LongMessageConfig, LongMessageError,
    LongMessageProtocol, LongMessageStatus, crc16, crc16_update, data_fragment, header_fragment,
};
use crate::frame::CanFrame;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};

struct ReceiveContext {
    in_use: bool,
    stream_id: u8,
    sender_can_id: u8,
    buffer: Vec<u8>,
    received: usize,
    expected_len: usize,
    expected_seq: u8,
    crc_declared: u16,
    crc_running: u16,
    crc_present: bool,
    last_fragment: u64,
}

impl ReceiveContext {
    fn new(buffer_len: usize) -> Self {
        Self {
            in_use: false,
            stream_id: 0,
            sender_can_id: 0,
            buffer: vec![0; buffer_len.max(1)],
            received: 0,
            expected_len: 0,
            expected_seq: 0,
            crc_declared: 0,
            crc_running: 0,
            crc_present: false,
            last_fragment: 0,
        }
    }

    fn release(&mut self) {
        self.in_use = false;
        self.received = 0;
    }
}

struct SendContext {
    in_use: bool,
    stream_id: u8,
    priority: u8,
    buffer: Vec<u8>,
    offset: usize,
    seq: u8,
    crc: u16,
    last_sent: u64,
}

/// Concurrent long message streams backed by fixed context pools.
pub struct LongMessageEx {
    config: LongMessageConfig,
    callback: FragmentCallback,
    subscribed: Vec<u8>,
    receive: Vec<ReceiveContext>,
    send: Vec<SendContext>,
    // Round-robin cursor over the send pool.
    next_send: usize,
}

impl LongMessageEx {
    /// Creates a handler with `num_receive` inbound contexts of
    /// `receive_buffer_len` bytes each and `num_send` outbound contexts.
    pub fn new(
        num_receive: usize,
        receive_buffer_len: usize,
        num_send: usize,
        config: LongMessageConfig,
        callback: FragmentCallback,
    ) -> Self {
        let receive = (0..num_receive.max(1))
            .map(|_| ReceiveContext::new(receive_buffer_len))
            .collect();
        let send = (0..num_send.max(1))
            .map(|_| SendContext {
                in_use: false,
                stream_id: 0,
                priority: 0,
                buffer: Vec::new(),
                offset: 0,
                seq: 0,
                crc: 0,
                last_sent: 0,
            })
            .collect();
        Self {
            config,
            callback,
            subscribed: Vec::new(),
            receive,
            send,
            next_send: 0,
        }
    }

    /// Registers the stream identifiers this node reassembles.
    pub fn subscribe(&mut self, stream_ids: &[u8]) {
        self.subscribed.clear();
        self.subscribed.extend_from_slice(stream_ids);
    }

    fn start_stream(&mut self, frame: &CanFrame, now_ms: u64) {
        let stream_id = frame.data[1];
        let declared_len = (((frame.data[3] as u16) << 8) | frame.data[4] as u16) as usize;

        // A repeated header from the same peer restarts its stream.
        let slot = self
            .receive
            .iter()
            .position(|c| {
                c.in_use && c.stream_id == stream_id && c.sender_can_id == frame.can_id()
            })
            .or_else(|| self.receive.iter().position(|c| !c.in_use));

        let Some(slot) = slot else {
            warn!("No free receive context for long message stream {}", stream_id);
            (self.callback)(&[], stream_id, LongMessageStatus::InternalError);
            return;
        };

        let ctx = &mut self.receive[slot];
        if declared_len > ctx.buffer.len() {
            warn!(
                "Long message stream {} declares {} bytes, buffer holds {}",
                stream_id,
                declared_len,
                ctx.buffer.len()
            );
            ctx.release();
            (self.callback)(&[], stream_id, LongMessageStatus::Truncated);
            return;
        }

        ctx.in_use = true;
        ctx.stream_id = stream_id;
        ctx.sender_can_id = frame.can_id();
        ctx.received = 0;
        ctx.expected_len = declared_len;
        ctx.expected_seq = 1;
        ctx.crc_declared = ((frame.data[5] as u16) << 8) | frame.data[6] as u16;
        ctx.crc_present = frame.data[7] & FLAG_CRC_PRESENT != 0;
        ctx.crc_running = 0xFFFF;
        ctx.last_fragment = now_ms;
        debug!(
            "Long message stream {} started, {} bytes declared",
            stream_id, declared_len
        );

        if declared_len == 0 {
            (self.callback)(&[], stream_id, LongMessageStatus::Complete);
            self.receive[slot].release();
        }
    }

    fn finish_stream(&mut self, slot: usize) {
        let ctx = &mut self.receive[slot];
        let status = if ctx.crc_present && self.config.use_crc && ctx.crc_running != ctx.crc_declared
        {
            warn!(
                "Long message stream {} CRC mismatch: got {:#06X}, declared {:#06X}",
                ctx.stream_id, ctx.crc_running, ctx.crc_declared
            );
            LongMessageStatus::CrcError
        } else {
            LongMessageStatus::Complete
        };
        let received = ctx.received;
        let stream_id = ctx.stream_id;
        (self.callback)(&self.receive[slot].buffer[..received], stream_id, status);
        self.receive[slot].release();
    }

    fn fail_stream(&mut self, slot: usize, status: LongMessageStatus) {
        let received = self.receive[slot].received;
        let stream_id = self.receive[slot].stream_id;
        (self.callback)(&self.receive[slot].buffer[..received], stream_id, status);
        self.receive[slot].release();
    }

    fn emit_fragment(&mut self, slot: usize, now_ms: u64) -> Option<(CanFrame, u8)> {
        let ctx = &mut self.send[slot];

        if ctx.seq == 0 {
            let flags = if self.config.use_crc {
                FLAG_CRC_PRESENT
            } else {
                0
            };
            let frame = header_fragment(ctx.stream_id, ctx.buffer.len() as u16, ctx.crc, flags);
            ctx.seq = 1;
            ctx.last_sent = now_ms;
            if ctx.buffer.is_empty() {
                ctx.in_use = false;
            }
            return Some((frame, ctx.priority));
        }

        if now_ms.saturating_sub(ctx.last_sent) < self.config.fragment_delay_ms {
            return None;
        }

        let end = (ctx.offset + FRAGMENT_DATA_LEN).min(ctx.buffer.len());
        let frame = data_fragment(ctx.stream_id, ctx.seq, &ctx.buffer[ctx.offset..end]);
        ctx.offset = end;
        ctx.seq = ctx.seq.wrapping_add(1);
        ctx.last_sent = now_ms;

        if ctx.offset >= ctx.buffer.len() {
            trace!("Long message stream {} fully sent", ctx.stream_id);
            ctx.in_use = false;
        }
        Some((frame, ctx.priority))
    }
}

impl LongMessageProtocol for LongMessageEx {
    fn send_message(
        &mut self,
        data: &[u8],
        stream_id: u8,
        priority: u8,
    ) -> Result<(), LongMessageError> {
        if self.send.iter().any(|c| c.in_use && c.stream_id == stream_id) {
            return Err(LongMessageError::StreamBusy);
        }
        let Some(ctx) = self.send.iter_mut().find(|c| !c.in_use) else {
            return Err(LongMessageError::NoFreeContext);
        };

        ctx.in_use = true;
        ctx.stream_id = stream_id;
        ctx.priority = priority;
        ctx.buffer.clear();
        ctx.buffer.extend_from_slice(data);
        ctx.offset = 0;
        ctx.seq = 0;
        ctx.crc = if self.config.use_crc { crc16(data) } else { 0 };
        ctx.last_sent = 0;
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
            if self.subscribed.contains(&stream_id) {
                self.start_stream(frame, now_ms);
            }
            return;
        }

        let Some(slot) = self.receive.iter().position(|c| {
            c.in_use && c.stream_id == stream_id && c.sender_can_id == frame.can_id()
        }) else {
            return;
        };

        if now_ms.saturating_sub(self.receive[slot].last_fragment) >= self.config.receive_timeout_ms
        {
            warn!("Long message stream {} timed out", stream_id);
            self.fail_stream(slot, LongMessageStatus::TimeoutError);
            return;
        }

        if sequence != self.receive[slot].expected_seq {
            warn!(
                "Long message stream {} sequence error: got {}, expected {}",
                stream_id, sequence, self.receive[slot].expected_seq
            );
            self.fail_stream(slot, LongMessageStatus::SequenceError);
            return;
        }

        let ctx = &mut self.receive[slot];
        let remaining = ctx.expected_len - ctx.received;
        let take = (frame.len as usize - 3).min(remaining);
        for &byte in &frame.data[3..3 + take] {
            ctx.buffer[ctx.received] = byte;
            ctx.received += 1;
            ctx.crc_running = crc16_update(ctx.crc_running, byte);
        }
        ctx.expected_seq = ctx.expected_seq.wrapping_add(1);
        ctx.last_fragment = now_ms;

        if ctx.received >= ctx.expected_len {
            self.finish_stream(slot);
        }
    }

    fn poll_transmit(&mut self, now_ms: u64) -> Option<(CanFrame, u8)> {
        let pool = self.send.len();
        if self.config.sequential {
            // Stay on the first active context until its stream completes.
            let slot = self.send.iter().position(|c| c.in_use)?;
            return self.emit_fragment(slot, now_ms);
        }

        // Round-robin: one fragment per call, rotating across active contexts.
        for step in 0..pool {
            let slot = (self.next_send + step) % pool;
            if !self.send[slot].in_use {
                continue;
            }
            if let Some(out) = self.emit_fragment(slot, now_ms) {
                self.next_send = (slot + 1) % pool;
                return Some(out);
            }
        }
        None
    }

    fn tick(&mut self, now_ms: u64) {
        for slot in 0..self.receive.len() {
            if self.receive[slot].in_use
                && now_ms.saturating_sub(self.receive[slot].last_fragment)
                    >= self.config.receive_timeout_ms
            {
                warn!(
                    "Long message stream {} timed out",
                    self.receive[slot].stream_id
                );
                self.fail_stream(slot, LongMessageStatus::TimeoutError);
            }
        }
    }

    fn is_sending(&self) -> bool {
        self.send.iter().any(|c| c.in_use)
    }
}
