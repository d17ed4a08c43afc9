//! Shared test harness: a simulated CAN transport buffering frames in
//! memory, and an in-memory event store.

#![allow(dead_code)]

use cbus_rs::hal::{CanTransport, CbusError, EventStore};
use cbus_rs::node::{ModuleName, NodeConfig, Parameters, PARAMETER_BLOCK_LEN};
use cbus_rs::{CanFrame, CbusNode};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Frames in flight, shared between the test and the node's transport.
#[derive(Default)]
pub struct BusState {
    /// Incoming frames (from bus to node).
    pub rx: VecDeque<CanFrame>,
    /// Outgoing frames (from node to bus).
    pub tx: Vec<CanFrame>,
}

/// A simulated CAN transport that buffers frames in memory.
pub struct SimulatedTransport {
    state: Rc<RefCell<BusState>>,
}

impl SimulatedTransport {
    pub fn new() -> (Self, Rc<RefCell<BusState>>) {
        let state = Rc::new(RefCell::new(BusState::default()));
        (
            Self {
                state: Rc::clone(&state),
            },
            state,
        )
    }
}

impl CanTransport for SimulatedTransport {
    fn frame_available(&self) -> bool {
        !self.state.borrow().rx.is_empty()
    }

    fn receive_next_frame(&mut self) -> Option<CanFrame> {
        self.state.borrow_mut().rx.pop_front()
    }

    fn send_frame(&mut self, frame: &CanFrame) -> Result<(), CbusError> {
        self.state.borrow_mut().tx.push(*frame);
        Ok(())
    }

    fn reset(&mut self) {}
}

/// An in-memory event and configuration store.
pub struct MemoryStore {
    node_number: u16,
    can_id: u8,
    addressed: bool,
    nvs: Vec<u8>,
    events: Vec<Option<([u8; 4], Vec<u8>)>>,
    ev_per_event: u8,
}

impl MemoryStore {
    pub fn new(node_number: u16, can_id: u8, nv_count: u8, max_events: u8, ev_per_event: u8) -> Self {
        Self {
            node_number,
            can_id,
            addressed: node_number != 0,
            nvs: vec![0; nv_count as usize],
            events: vec![None; max_events as usize],
            ev_per_event,
        }
    }

    fn nv_slot(&self, index: u8) -> Result<usize, CbusError> {
        if index == 0 || index as usize > self.nvs.len() {
            Err(CbusError::IndexOutOfRange(index))
        } else {
            Ok(index as usize - 1)
        }
    }

    fn entry(&self, index: u8) -> Result<&([u8; 4], Vec<u8>), CbusError> {
        self.events
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(CbusError::IndexOutOfRange(index))
    }
}

impl EventStore for MemoryStore {
    fn node_number(&self) -> u16 {
        self.node_number
    }

    fn set_node_number(&mut self, nn: u16) -> Result<(), CbusError> {
        self.node_number = nn;
        Ok(())
    }

    fn can_id(&self) -> u8 {
        self.can_id
    }

    fn set_can_id(&mut self, id: u8) -> Result<(), CbusError> {
        self.can_id = id;
        Ok(())
    }

    fn addressed(&self) -> bool {
        self.addressed
    }

    fn set_addressed(&mut self, addressed: bool) -> Result<(), CbusError> {
        self.addressed = addressed;
        Ok(())
    }

    fn nv_count(&self) -> u8 {
        self.nvs.len() as u8
    }

    fn read_nv(&self, index: u8) -> Result<u8, CbusError> {
        Ok(self.nvs[self.nv_slot(index)?])
    }

    fn write_nv(&mut self, index: u8, value: u8) -> Result<(), CbusError> {
        let slot = self.nv_slot(index)?;
        self.nvs[slot] = value;
        Ok(())
    }

    fn max_events(&self) -> u8 {
        self.events.len() as u8
    }

    fn event_vars_per_event(&self) -> u8 {
        self.ev_per_event
    }

    fn find_existing_event(&self, nn: u16, en: u16) -> Option<u8> {
        let key = [(nn >> 8) as u8, nn as u8, (en >> 8) as u8, en as u8];
        self.events
            .iter()
            .position(|e| e.as_ref().is_some_and(|(id, _)| *id == key))
            .map(|i| i as u8)
    }

    fn find_free_event_slot(&self) -> Option<u8> {
        self.events.iter().position(|e| e.is_none()).map(|i| i as u8)
    }

    fn read_event(&self, index: u8) -> Result<[u8; 4], CbusError> {
        Ok(self.entry(index)?.0)
    }

    fn write_event(&mut self, index: u8, data: &[u8; 4]) -> Result<(), CbusError> {
        let vars = vec![0; self.ev_per_event as usize];
        self.events[index as usize] = Some((*data, vars));
        Ok(())
    }

    fn read_event_variable(&self, index: u8, var_index: u8) -> Result<u8, CbusError> {
        let (_, vars) = self.entry(index)?;
        vars.get(var_index as usize - 1)
            .copied()
            .ok_or(CbusError::IndexOutOfRange(var_index))
    }

    fn write_event_variable(
        &mut self,
        index: u8,
        var_index: u8,
        value: u8,
    ) -> Result<(), CbusError> {
        let Some(Some((_, vars))) = self.events.get_mut(index as usize) else {
            return Err(CbusError::IndexOutOfRange(index));
        };
        let slot = vars
            .get_mut(var_index as usize - 1)
            .ok_or(CbusError::IndexOutOfRange(var_index))?;
        *slot = value;
        Ok(())
    }

    fn clear_event(&mut self, index: u8) -> Result<(), CbusError> {
        if let Some(slot) = self.events.get_mut(index as usize) {
            *slot = None;
        }
        Ok(())
    }

    fn event_table_entry_valid(&self, index: u8) -> bool {
        self.events
            .get(index as usize)
            .is_some_and(|e| e.is_some())
    }

    fn count_events(&self) -> u8 {
        self.events.iter().filter(|e| e.is_some()).count() as u8
    }

    fn rebuild_hash_index(&mut self, _index: u8) {}

    fn clear_hash_index(&mut self) {}
}

pub fn test_params() -> Parameters {
    let mut bytes = [0u8; PARAMETER_BLOCK_LEN];
    bytes[0] = 20; // parameter count
    bytes[1] = 0xA5; // manufacturer
    bytes[3] = 0x42; // module id
    Parameters::new(bytes)
}

pub type TestNode = CbusNode<SimulatedTransport, MemoryStore>;

/// Builds a node with the given identity and a shared handle on the bus.
pub fn new_node(node_number: u16, can_id: u8, config: NodeConfig) -> (TestNode, Rc<RefCell<BusState>>) {
    init_logging();
    let (transport, bus) = SimulatedTransport::new();
    let store = MemoryStore::new(node_number, can_id, 4, 8, 2);
    let node = CbusNode::new(
        transport,
        store,
        test_params(),
        ModuleName::from_str("TESTMOD"),
        config,
    );
    (node, bus)
}

/// Builds a data frame as sent by a peer with the given CAN identifier.
pub fn frame_from(can_id: u8, payload: &[u8]) -> CanFrame {
    let mut frame = CanFrame::from_data(payload);
    frame.set_default_header(can_id);
    frame
}

/// A zero-length enumeration response from a peer.
pub fn zero_len_from(can_id: u8) -> CanFrame {
    let mut frame = CanFrame::default();
    frame.set_default_header(can_id);
    frame
}

pub fn push_rx(bus: &Rc<RefCell<BusState>>, frame: CanFrame) {
    bus.borrow_mut().rx.push_back(frame);
}

/// Extracts all pending transmitted frames.
pub fn take_tx(bus: &Rc<RefCell<BusState>>) -> Vec<CanFrame> {
    bus.borrow_mut().tx.drain(..).collect()
}
