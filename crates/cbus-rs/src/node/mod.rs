//! The protocol engine: node configuration, application callback surface and
//! the frame dispatch/driving loop.

pub mod coe;
pub mod engine;

pub use engine::CbusNode;

use crate::frame::CanFrame;
use crate::types::DEFAULT_FRAMES_PER_PROCESS;
use alloc::boxed::Box;

/// Number of bytes in the advertised parameter block (count byte included).
pub const PARAMETER_BLOCK_LEN: usize = 21;

/// Number of bytes in the module name, space-padded.
pub const MODULE_NAME_LEN: usize = 7;

/// Index of the flags byte inside the parameter block.
pub const PARAM_FLAGS_INDEX: usize = 8;

/// Learn mode bit inside the parameter flags byte.
pub const PARAM_FLAG_LEARN: u8 = 0x20;

/// Startup-time engine configuration. None of these are runtime-mutable.
#[derive(Debug, Clone, Copy)]
pub struct NodeConfig {
    /// Capacity of the receive frame queue.
    pub queue_capacity: usize,
    /// Maximum frames drained through dispatch per `process` call. A
    /// fairness bound so bursts cannot starve timeout servicing.
    pub frames_per_process: u8,
    /// When set, every sent data frame is mirrored into a loopback queue of
    /// this capacity and fed back through dispatch ("consume own events").
    pub consume_own_events: Option<usize>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 16,
            frames_per_process: DEFAULT_FRAMES_PER_PROCESS,
            consume_own_events: None,
        }
    }
}

/// The module's advertised parameter block.
///
/// Byte 0 holds the declared parameter count; bytes 1.. hold the parameters
/// themselves, indexed from 1 on the wire. The flags byte mirrors runtime
/// state: the learn bit tracks learn mode entry/exit.
#[derive(Debug, Clone, Copy)]
pub struct Parameters {
    bytes: [u8; PARAMETER_BLOCK_LEN],
}

impl Parameters {
    pub fn new(bytes: [u8; PARAMETER_BLOCK_LEN]) -> Self {
        Self { bytes }
    }

    /// The declared parameter count (byte 0).
    pub fn count(&self) -> u8 {
        self.bytes[0]
    }

    /// Reads one parameter by wire index. Index 0 returns the count itself;
    /// indices above the declared count return `None`.
    pub fn get(&self, index: u8) -> Option<u8> {
        if index > self.count() || (index as usize) >= PARAMETER_BLOCK_LEN {
            None
        } else {
            Some(self.bytes[index as usize])
        }
    }

    pub fn flags(&self) -> u8 {
        self.bytes[PARAM_FLAGS_INDEX]
    }

    /// Reflects learn mode in the advertised flags byte.
    pub fn set_learn_flag(&mut self, learn: bool) {
        if learn {
            self.bytes[PARAM_FLAGS_INDEX] |= PARAM_FLAG_LEARN;
        } else {
            self.bytes[PARAM_FLAGS_INDEX] &= !PARAM_FLAG_LEARN;
        }
    }

    /// The seven low-numbered parameters carried by the parameter summary
    /// reply (wire indices 1 through 7).
    pub fn summary(&self) -> &[u8] {
        &self.bytes[1..8]
    }
}

/// The module name, seven bytes, space-padded.
#[derive(Debug, Clone, Copy)]
pub struct ModuleName(pub [u8; MODULE_NAME_LEN]);

impl ModuleName {
    /// Builds a name from a string, truncating or space-padding to seven
    /// bytes.
    pub fn from_str(name: &str) -> Self {
        let mut bytes = [b' '; MODULE_NAME_LEN];
        for (dst, src) in bytes.iter_mut().zip(name.bytes()) {
            *dst = src;
        }
        Self(bytes)
    }
}

/// Accessory event callback, in one of its two registered shapes.
pub enum EventHandler {
    /// Receives the matched event-table index and the frame.
    Basic(Box<dyn FnMut(u8, &CanFrame)>),
    /// Additionally receives the on/off polarity and the value of the
    /// event's first event variable.
    Detailed(Box<dyn FnMut(u8, &CanFrame, bool, u8)>),
}

/// Raw-frame callback, run before opcode dispatch.
pub type FrameHandler = Box<dyn FnMut(&CanFrame)>;

/// Callback run for every outbound frame after it is handed to the transport.
pub type TransmitHandler = Box<dyn FnMut(&CanFrame)>;

/// Busy-indicator hook, strobed once per processed message.
pub type BusyIndicator = Box<dyn FnMut()>;
