//! The CAN identifier self-enumeration record.
//!
//! An enumeration cycle broadcasts a zero-length RTR frame and then collects
//! the zero-length responses every peer sends back, one presence bit per
//! possible identifier. When the observation window closes, the lowest unset
//! bit (excluding the reserved identifier zero) becomes this node's new CAN
//! identifier.

use crate::types::{CAN_ID_SPACE, ENUMERATION_WINDOW_MS};

const RESPONSE_BYTES: usize = CAN_ID_SPACE / 8;

/// 128-bit presence set plus the cycle start timestamp and an active flag.
///
/// Created when enumeration starts, populated as peer responses arrive, and
/// consumed when the observation window elapses.
#[derive(Debug, Clone, Default)]
pub struct Enumeration {
    responses: [u8; RESPONSE_BYTES],
    start_time: u64,
    active: bool,
}

impl Enumeration {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new cycle, discarding any responses from a previous one.
    pub fn begin(&mut self, now_ms: u64) {
        self.responses = [0; RESPONSE_BYTES];
        self.start_time = now_ms;
        self.active = true;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Records a peer's zero-length response. Identifier zero is reserved
    /// and never recorded.
    pub fn record(&mut self, can_id: u8) {
        if can_id == 0 || (can_id as usize) >= CAN_ID_SPACE {
            return;
        }
        self.responses[(can_id / 8) as usize] |= 1 << (can_id % 8);
    }

    /// Returns true when the fixed observation window has elapsed.
    pub fn window_elapsed(&self, now_ms: u64) -> bool {
        self.active && now_ms.saturating_sub(self.start_time) >= ENUMERATION_WINDOW_MS
    }

    /// Closes the cycle and selects the new identifier: the lowest-numbered
    /// identifier (>= 1) whose presence bit is unset, or 1 when every bit is
    /// set. This is a first-fit allocation; a later collision on the bus
    /// re-triggers enumeration.
    pub fn finish(&mut self) -> u8 {
        self.active = false;
        self.start_time = 0;
        self.lowest_free_id()
    }

    fn lowest_free_id(&self) -> u8 {
        (1..CAN_ID_SPACE as u8)
            .find(|id| self.responses[(id / 8) as usize] & (1 << (id % 8)) == 0)
            .unwrap_or(1)
    }
}
