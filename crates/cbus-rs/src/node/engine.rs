//! The node protocol engine: identity state machine, opcode dispatch and the
//! driving loop.

use super::coe::OwnEventChannel;
use super::{
    BusyIndicator, EventHandler, FrameHandler, ModuleName, NodeConfig, Parameters, TransmitHandler,
};
use crate::frame::opcode::{self, cmderr};
use crate::frame::{CanFrame, FrameQueue};
use crate::hal::{CanTransport, CbusError, EventStore};
use crate::identity::{Enumeration, Mode};
use crate::longmsg::LongMessageProtocol;
use crate::types::{CanId, DEFAULT_PRIORITY, REPLY_GAP_MS, TRANSITION_TIMEOUT_MS};
use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec::Vec;
use log::{debug, info, trace, warn};

/// One node on the bus.
///
/// Owns the transport and event store collaborators, the receive frame
/// queue, the identity state machine and the application callback surface.
/// Single-threaded and run-to-completion: the application calls
/// [`process`](Self::process) regularly with a monotonic millisecond clock
/// and every timeout is polled there; nothing blocks.
pub struct CbusNode<T: CanTransport, S: EventStore> {
    transport: T,
    store: S,
    config: NodeConfig,
    params: Parameters,
    name: ModuleName,

    queue: FrameQueue,
    coe: Option<OwnEventChannel>,

    mode: Mode,
    prev_addressed: bool,
    transition_start: u64,
    learn_mode: bool,

    enumeration: Enumeration,
    enumeration_required: bool,

    // Replies paced out by `process`, one frame per gap.
    pending_replies: VecDeque<CanFrame>,
    last_reply_time: u64,

    long_message: Option<Box<dyn LongMessageProtocol>>,

    event_handler: Option<EventHandler>,
    frame_handler: Option<FrameHandler>,
    frame_filter: Vec<u8>,
    transmit_handler: Option<TransmitHandler>,
    busy_indicator: Option<BusyIndicator>,

    frames_sent: u32,
    frames_received: u32,
}

impl<T: CanTransport, S: EventStore> CbusNode<T, S> {
    pub fn new(
        transport: T,
        store: S,
        params: Parameters,
        name: ModuleName,
        config: NodeConfig,
    ) -> Self {
        let mode = if store.addressed() {
            Mode::Addressed
        } else {
            Mode::Unaddressed
        };
        info!(
            "Node starting: mode {:?}, node number {}, CAN id {}",
            mode,
            store.node_number(),
            store.can_id()
        );
        Self {
            transport,
            store,
            queue: FrameQueue::new(config.queue_capacity),
            coe: config.consume_own_events.map(OwnEventChannel::new),
            config,
            params,
            name,
            mode,
            prev_addressed: mode.is_addressed(),
            transition_start: 0,
            learn_mode: false,
            enumeration: Enumeration::new(),
            enumeration_required: false,
            pending_replies: VecDeque::new(),
            last_reply_time: 0,
            long_message: None,
            event_handler: None,
            frame_handler: None,
            frame_filter: Vec::new(),
            transmit_handler: None,
            busy_indicator: None,
            frames_sent: 0,
            frames_received: 0,
        }
    }

    // --- Callback registration ---

    pub fn set_event_handler(&mut self, handler: EventHandler) {
        self.event_handler = Some(handler);
    }

    /// Registers a raw-frame callback, run before opcode dispatch. An empty
    /// `opcodes` slice passes every frame; otherwise only the listed opcodes.
    pub fn set_frame_handler(&mut self, handler: FrameHandler, opcodes: &[u8]) {
        self.frame_handler = Some(handler);
        self.frame_filter.clear();
        self.frame_filter.extend_from_slice(opcodes);
    }

    pub fn set_transmit_handler(&mut self, handler: TransmitHandler) {
        self.transmit_handler = Some(handler);
    }

    pub fn set_busy_indicator(&mut self, indicator: BusyIndicator) {
        self.busy_indicator = Some(indicator);
    }

    pub fn set_long_message_handler(&mut self, handler: Box<dyn LongMessageProtocol>) {
        self.long_message = Some(handler);
    }

    // --- Accessors ---

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn node_number(&self) -> u16 {
        self.store.node_number()
    }

    pub fn can_id(&self) -> u8 {
        self.store.can_id()
    }

    pub fn in_learn_mode(&self) -> bool {
        self.learn_mode
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    /// Receive queue diagnostics: size, high-water mark, overflow count.
    pub fn queue(&self) -> &FrameQueue {
        &self.queue
    }

    pub fn frames_sent(&self) -> u32 {
        self.frames_sent
    }

    pub fn frames_received(&self) -> u32 {
        self.frames_received
    }

    // --- Identity transitions ---

    /// Enters the addressed-mode negotiation: emits a node number request
    /// and starts the 30 second window.
    pub fn enter_transitioning(&mut self, now_ms: u64) -> Result<(), CbusError> {
        self.prev_addressed = self.mode.is_addressed();
        self.mode = Mode::Transitioning;
        self.transition_start = now_ms;
        let (hi, lo) = self.nn_bytes();
        info!("Requesting node number (current {})", self.store.node_number());
        self.reply(&[opcode::RQNN, hi, lo], now_ms)
    }

    /// Re-runs the negotiation while keeping the current node number as the
    /// advertised starting point.
    pub fn renegotiate(&mut self, now_ms: u64) -> Result<(), CbusError> {
        self.enter_transitioning(now_ms)
    }

    /// Releases the node number and returns to unaddressed operation.
    pub fn revert_to_unaddressed(&mut self, now_ms: u64) -> Result<(), CbusError> {
        let (hi, lo) = self.nn_bytes();
        self.reply(&[opcode::NNREL, hi, lo], now_ms)?;
        self.store.set_node_number(0)?;
        self.store.set_can_id(0)?;
        self.store.set_addressed(false)?;
        self.mode = Mode::Unaddressed;
        info!("Node number released, back to unaddressed operation");
        Ok(())
    }

    /// Schedules a CAN identifier self-enumeration cycle; it starts on the
    /// next `process` call.
    pub fn request_enumeration(&mut self) {
        self.enumeration_required = true;
    }

    // --- Sending ---

    /// Sends an application frame with the default priority. The header is
    /// populated with this node's CAN identifier.
    pub fn send_message(&mut self, payload: &[u8], now_ms: u64) -> Result<(), CbusError> {
        self.reply(payload, now_ms)
    }

    /// Hands a payload to the registered long message handler and pushes out
    /// whatever fragments are immediately due.
    pub fn send_long_message(
        &mut self,
        data: &[u8],
        stream_id: u8,
        priority: u8,
        now_ms: u64,
    ) -> Result<(), CbusError> {
        let Some(lm) = self.long_message.as_mut() else {
            return Err(CbusError::NoLongMessageHandler);
        };
        lm.send_message(data, stream_id, priority)?;
        self.pump_long_message(now_ms)
    }

    pub fn send_wrack(&mut self, now_ms: u64) -> Result<(), CbusError> {
        let (hi, lo) = self.nn_bytes();
        self.reply(&[opcode::WRACK, hi, lo], now_ms)
    }

    pub fn send_cmderr(&mut self, code: u8, now_ms: u64) -> Result<(), CbusError> {
        let (hi, lo) = self.nn_bytes();
        self.reply(&[opcode::CMDERR, hi, lo, code], now_ms)
    }

    // --- Driving loop ---

    /// One driving-loop pass: starts any scheduled enumeration, pumps the
    /// transport into the receive queue, drains a bounded number of frames
    /// through dispatch, services the loopback channel, the paced reply
    /// backlog, the enumeration window, the negotiation timeout and the long
    /// message handler.
    pub fn process(&mut self, now_ms: u64) -> Result<(), CbusError> {
        if self.enumeration_required && !self.enumeration.is_active() {
            self.enumeration_required = false;
            self.start_enumeration(now_ms)?;
        }

        while self.transport.frame_available() {
            match self.transport.receive_next_frame() {
                Some(frame) => self.queue.put(frame, now_ms),
                None => break,
            }
        }

        for _ in 0..self.config.frames_per_process {
            let Some(frame) = self.queue.get() else { break };
            self.handle_frame(&frame, now_ms)?;
        }

        while let Some(frame) = self.coe.as_mut().and_then(OwnEventChannel::next) {
            self.handle_frame(&frame, now_ms)?;
        }

        if !self.pending_replies.is_empty()
            && now_ms.saturating_sub(self.last_reply_time) >= REPLY_GAP_MS
        {
            if let Some(reply) = self.pending_replies.pop_front() {
                self.transmit(reply, DEFAULT_PRIORITY, now_ms)?;
                self.last_reply_time = now_ms;
            }
        }

        if self.enumeration.window_elapsed(now_ms) {
            let new_id = self.enumeration.finish();
            info!("Enumeration window closed, selected CAN id {}", new_id);
            self.store.set_can_id(new_id)?;
            if self.mode.is_addressed() {
                let (hi, lo) = self.nn_bytes();
                self.reply(&[opcode::NNACK, hi, lo], now_ms)?;
            }
        }

        if self.mode == Mode::Transitioning
            && now_ms.saturating_sub(self.transition_start) >= TRANSITION_TIMEOUT_MS
        {
            warn!("Node number negotiation timed out");
            self.mode = if self.prev_addressed {
                Mode::Addressed
            } else {
                Mode::Unaddressed
            };
        }

        if let Some(lm) = self.long_message.as_mut() {
            lm.tick(now_ms);
        }
        self.pump_long_message(now_ms)
    }

    // --- Internals ---

    fn nn_bytes(&self) -> (u8, u8) {
        let nn = self.store.node_number();
        ((nn >> 8) as u8, nn as u8)
    }

    fn transmit(
        &mut self,
        mut frame: CanFrame,
        priority: u8,
        now_ms: u64,
    ) -> Result<(), CbusError> {
        frame.set_header(self.store.can_id(), priority);
        self.transport.send_frame(&frame)?;
        self.frames_sent += 1;
        trace!("Sent {}", frame);
        if let Some(cb) = self.transmit_handler.as_mut() {
            cb(&frame);
        }
        if let Some(coe) = self.coe.as_mut() {
            coe.mirror(&frame, now_ms);
        }
        Ok(())
    }

    fn reply(&mut self, payload: &[u8], now_ms: u64) -> Result<(), CbusError> {
        self.transmit(CanFrame::from_data(payload), DEFAULT_PRIORITY, now_ms)
    }

    fn start_enumeration(&mut self, now_ms: u64) -> Result<(), CbusError> {
        info!("Starting CAN id self-enumeration");
        let mut request = CanFrame::default();
        request.rtr = true;
        self.transmit(request, DEFAULT_PRIORITY, now_ms)?;
        self.enumeration.begin(now_ms);
        Ok(())
    }

    fn pump_long_message(&mut self, now_ms: u64) -> Result<(), CbusError> {
        let Some(mut lm) = self.long_message.take() else {
            return Ok(());
        };
        let mut due = Vec::new();
        while let Some(out) = lm.poll_transmit(now_ms) {
            due.push(out);
        }
        self.long_message = Some(lm);
        for (frame, priority) in due {
            self.transmit(frame, priority, now_ms)?;
        }
        Ok(())
    }

    /// Dispatches one frame: raw-frame callback, busy strobe, collision
    /// detection, then the opcode switch. Frames carrying another node's
    /// number are ignored silently.
    fn handle_frame(&mut self, frame: &CanFrame, now_ms: u64) -> Result<(), CbusError> {
        self.frames_received += 1;

        if let Some(busy) = self.busy_indicator.as_mut() {
            busy();
        }

        if let Some(cb) = self.frame_handler.as_mut() {
            let pass = self.frame_filter.is_empty()
                || frame
                    .opcode()
                    .is_some_and(|opc| self.frame_filter.contains(&opc));
            if pass {
                cb(frame);
            }
        }

        // Extended frames are reserved for bootloader/foreign traffic.
        if frame.ext {
            trace!("Ignoring extended frame {}", frame);
            return Ok(());
        }

        // A remote request is a peer's enumeration probe: answer at once
        // with a zero-length frame carrying our identifier, whether or not
        // we are enumerating ourselves.
        if frame.rtr {
            trace!("Answering enumeration probe from CAN id {}", frame.can_id());
            return self.transmit(CanFrame::default(), DEFAULT_PRIORITY, now_ms);
        }

        // Zero-length data frames are enumeration responses.
        if frame.len == 0 {
            if self.enumeration.is_active() {
                self.enumeration.record(frame.can_id());
            }
            return Ok(());
        }

        // Live identifier collision: same CAN id, different node number.
        // Resolved on the next tick, not inline, to avoid recursion.
        let own_id = self.store.can_id();
        if own_id != 0
            && frame.can_id() == own_id
            && frame.node_number() != self.store.node_number()
        {
            debug!("CAN id collision detected on id {}", own_id);
            self.enumeration_required = true;
        }

        let opc = frame.data[0];
        if opcode::is_accessory_event(opc) {
            return self.handle_accessory_event(opc, frame);
        }

        let own_nn = self.store.node_number();
        let for_us = frame.node_number() == own_nn;

        match opc {
            // --- Identity and negotiation ---
            opcode::QNN => {
                if own_nn != 0 {
                    let (hi, lo) = self.nn_bytes();
                    let reply = [
                        opcode::PNN,
                        hi,
                        lo,
                        self.params.get(1).unwrap_or(0),
                        self.params.get(3).unwrap_or(0),
                        self.params.flags(),
                    ];
                    return self.reply(&reply, now_ms);
                }
            }
            opcode::RQNP => {
                if self.mode == Mode::Transitioning {
                    let mut reply = [0u8; 8];
                    reply[0] = opcode::PARAMS;
                    reply[1..8].copy_from_slice(self.params.summary());
                    return self.reply(&reply, now_ms);
                }
            }
            opcode::RQMN => {
                if self.mode == Mode::Transitioning {
                    let mut reply = [0u8; 8];
                    reply[0] = opcode::NAME;
                    reply[1..8].copy_from_slice(&self.name.0);
                    return self.reply(&reply, now_ms);
                }
            }
            opcode::SNN => {
                if self.mode == Mode::Transitioning {
                    let nn = frame.node_number();
                    self.store.set_node_number(nn)?;
                    self.store.set_addressed(true)?;
                    self.mode = Mode::Addressed;
                    info!("Node number {} assigned", nn);
                    let (hi, lo) = self.nn_bytes();
                    self.reply(&[opcode::NNACK, hi, lo], now_ms)?;
                    self.enumeration_required = true;
                }
            }
            opcode::RQNN => {
                // A peer is requesting a node number. If we are mid
                // negotiation ourselves, yield to it.
                if self.mode == Mode::Transitioning {
                    info!("Peer node number request seen, yielding negotiation");
                    self.mode = if self.prev_addressed {
                        Mode::Addressed
                    } else {
                        Mode::Unaddressed
                    };
                    let (hi, lo) = self.nn_bytes();
                    return self.reply(&[opcode::NNACK, hi, lo], now_ms);
                }
            }
            opcode::RQNPN => {
                if for_us {
                    let index = frame.data[3];
                    return match self.params.get(index) {
                        Some(value) => {
                            let (hi, lo) = self.nn_bytes();
                            self.reply(&[opcode::PARAN, hi, lo, index, value], now_ms)
                        }
                        None => self.send_cmderr(cmderr::INVALID_PARAMETER_INDEX, now_ms),
                    };
                }
            }
            opcode::CANID => {
                if for_us {
                    return match CanId::try_from(frame.data[3]) {
                        Ok(id) => {
                            info!("CAN id set to {} by configuration tool", id.0);
                            self.store.set_can_id(id.0)?;
                            Ok(())
                        }
                        Err(_) => self.send_cmderr(cmderr::INVALID_CAN_ID, now_ms),
                    };
                }
            }
            opcode::ENUM => {
                if for_us && frame.can_id() != own_id && !self.enumeration.is_active() {
                    debug!("Enumeration requested by CAN id {}", frame.can_id());
                    self.enumeration_required = true;
                }
            }

            // --- Node variables ---
            opcode::NVRD => {
                if for_us {
                    let index = frame.data[3];
                    if index == 0 || index > self.store.nv_count() {
                        return self.send_cmderr(cmderr::INVALID_EVENT_OPERATION, now_ms);
                    }
                    let value = self.store.read_nv(index)?;
                    let (hi, lo) = self.nn_bytes();
                    return self.reply(&[opcode::NVANS, hi, lo, index, value], now_ms);
                }
            }
            opcode::NVSET => {
                if for_us {
                    let index = frame.data[3];
                    if index == 0 || index > self.store.nv_count() {
                        return self.send_cmderr(cmderr::INVALID_EVENT_OPERATION, now_ms);
                    }
                    self.store.write_nv(index, frame.data[4])?;
                    return self.send_wrack(now_ms);
                }
            }

            // --- Event table management ---
            opcode::NNLRN => {
                if for_us && !self.learn_mode {
                    info!("Entering learn mode");
                    self.learn_mode = true;
                    self.params.set_learn_flag(true);
                }
            }
            opcode::NNULN => {
                if for_us && self.learn_mode {
                    info!("Leaving learn mode");
                    self.learn_mode = false;
                    self.params.set_learn_flag(false);
                }
            }
            opcode::EVLRN => {
                if self.learn_mode {
                    return self.learn_event(frame, now_ms);
                }
            }
            opcode::EVULN => {
                if self.learn_mode {
                    return self.unlearn_event(frame, now_ms);
                }
            }
            opcode::NNCLR => {
                // Destructive, so gated on learn mode as well as the node
                // number; out of learn mode it is ignored.
                if for_us && self.learn_mode {
                    info!("Clearing the event table");
                    for index in 0..self.store.max_events() {
                        self.store.clear_event(index)?;
                    }
                    self.store.clear_hash_index();
                    return self.send_wrack(now_ms);
                }
            }

            // --- Queries ---
            opcode::NNEVN => {
                if for_us {
                    let free = self.store.max_events() - self.store.count_events();
                    let (hi, lo) = self.nn_bytes();
                    return self.reply(&[opcode::EVNLF, hi, lo, free], now_ms);
                }
            }
            opcode::RQEVN => {
                if for_us {
                    let count = self.store.count_events();
                    let (hi, lo) = self.nn_bytes();
                    return self.reply(&[opcode::NUMEV, hi, lo, count], now_ms);
                }
            }
            opcode::NERD => {
                if for_us {
                    self.queue_event_enumeration()?;
                }
            }
            opcode::REVAL => {
                if for_us {
                    return self.read_event_variable_by_index(frame, now_ms);
                }
            }

            // --- Long messages ---
            opcode::DTXC => {
                if let Some(lm) = self.long_message.as_mut() {
                    lm.handle_fragment(frame, now_ms);
                }
            }

            // Recognised, deliberately not acted upon by accessory modules.
            opcode::AREQ | opcode::BOOT | opcode::RSTAT => {
                trace!("Recognised no-op opcode {:#04X}", opc);
            }

            _ => {
                trace!("Unhandled opcode {:#04X}", opc);
            }
        }
        Ok(())
    }

    fn handle_accessory_event(&mut self, opc: u8, frame: &CanFrame) -> Result<(), CbusError> {
        // Short-form events are stored with node number zero.
        let nn = if opcode::is_short_accessory_event(opc) {
            0
        } else {
            frame.node_number()
        };
        let en = frame.event_number();
        let Some(index) = self.store.find_existing_event(nn, en) else {
            trace!("No stored event for ({}, {})", nn, en);
            return Ok(());
        };
        debug!("Accessory event ({}, {}) matched table index {}", nn, en, index);
        match self.event_handler.as_mut() {
            Some(EventHandler::Basic(cb)) => cb(index, frame),
            Some(EventHandler::Detailed(cb)) => {
                let on = opcode::is_on_event(opc);
                let first_ev = self.store.read_event_variable(index, 1).unwrap_or(0);
                cb(index, frame, on, first_ev);
            }
            None => {}
        }
        Ok(())
    }

    fn learn_event(&mut self, frame: &CanFrame, now_ms: u64) -> Result<(), CbusError> {
        if frame.len < 7 {
            return Ok(());
        }
        let ev_index = frame.data[5];
        let ev_value = frame.data[6];
        if ev_index == 0 || ev_index > self.store.event_vars_per_event() {
            return self.send_cmderr(cmderr::INVALID_EVENT_VARIABLE_INDEX, now_ms);
        }

        let nn = frame.node_number();
        let en = frame.event_number();
        let index = match self.store.find_existing_event(nn, en) {
            Some(index) => index,
            None => {
                let Some(index) = self.store.find_free_event_slot() else {
                    warn!("Event table full, cannot learn ({}, {})", nn, en);
                    return self.send_cmderr(cmderr::INVALID_EVENT_OPERATION, now_ms);
                };
                // A fresh slot gets the identifying bytes along with the
                // first variable write.
                let identity = [(nn >> 8) as u8, nn as u8, (en >> 8) as u8, en as u8];
                self.store.write_event(index, &identity)?;
                index
            }
        };

        self.store.write_event_variable(index, ev_index, ev_value)?;
        self.store.rebuild_hash_index(index);
        debug!("Learned ({}, {}) EV{}={} at index {}", nn, en, ev_index, ev_value, index);
        self.send_wrack(now_ms)
    }

    fn unlearn_event(&mut self, frame: &CanFrame, now_ms: u64) -> Result<(), CbusError> {
        let nn = frame.node_number();
        let en = frame.event_number();
        let Some(index) = self.store.find_existing_event(nn, en) else {
            return self.send_cmderr(cmderr::INVALID_EVENT_OPERATION, now_ms);
        };
        self.store.clear_event(index)?;
        self.store.clear_hash_index();
        debug!("Unlearned ({}, {}) from index {}", nn, en, index);
        self.send_wrack(now_ms)
    }

    /// Queues one ENRSP per valid table entry into the paced reply backlog,
    /// drained by `process` with an inter-frame gap so slow receivers are
    /// not overrun.
    fn queue_event_enumeration(&mut self) -> Result<(), CbusError> {
        let (hi, lo) = self.nn_bytes();
        for index in 0..self.store.max_events() {
            if !self.store.event_table_entry_valid(index) {
                continue;
            }
            let entry = self.store.read_event(index)?;
            self.pending_replies.push_back(CanFrame::from_data(&[
                opcode::ENRSP,
                hi,
                lo,
                entry[0],
                entry[1],
                entry[2],
                entry[3],
                index,
            ]));
        }
        debug!("Queued {} event enumeration replies", self.pending_replies.len());
        Ok(())
    }

    fn read_event_variable_by_index(
        &mut self,
        frame: &CanFrame,
        now_ms: u64,
    ) -> Result<(), CbusError> {
        let index = frame.data[3];
        let ev_index = frame.data[4];
        if index >= self.store.max_events()
            || !self.store.event_table_entry_valid(index)
            || ev_index == 0
            || ev_index > self.store.event_vars_per_event()
        {
            return self.send_cmderr(cmderr::INVALID_EVENT_VARIABLE_INDEX, now_ms);
        }
        let value = self.store.read_event_variable(index, ev_index)?;
        let (hi, lo) = self.nn_bytes();
        self.reply(&[opcode::NEVAL, hi, lo, index, ev_index, value], now_ms)
    }
}
