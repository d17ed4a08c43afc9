//! Consume-own-events loopback channel.
//!
//! When enabled, every accessory event frame the node sends is mirrored
//! into this bounded queue and fed back through normal dispatch on the next
//! driving loop pass, so a node can react to the accessory events it
//! produces itself. Nothing else is mirrored: looping back protocol frames
//! such as the node's own RQNN or DTXC fragments would make dispatch treat
//! them as peer traffic.

use crate::frame::{opcode, CanFrame, FrameQueue};

pub struct OwnEventChannel {
    queue: FrameQueue,
}

impl OwnEventChannel {
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: FrameQueue::new(capacity),
        }
    }

    /// Mirrors one outbound frame. The accessory-event filter lives here
    /// rather than at the call site so every sender goes through it.
    pub fn mirror(&mut self, frame: &CanFrame, now_ms: u64) {
        if frame.rtr || frame.len == 0 || !opcode::is_accessory_event(frame.data[0]) {
            return;
        }
        self.queue.put(*frame, now_ms);
    }

    pub fn next(&mut self) -> Option<CanFrame> {
        self.queue.get()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_accessory_events_are_mirrored() {
        let mut coe = OwnEventChannel::new(4);
        let mut rtr = CanFrame::default();
        rtr.rtr = true;
        coe.mirror(&rtr, 0);
        coe.mirror(&CanFrame::default(), 0);
        // Protocol frames the node emits must not loop back.
        coe.mirror(&CanFrame::from_data(&[opcode::RQNN, 0, 0]), 0);
        coe.mirror(&CanFrame::from_data(&[opcode::DTXC, 1, 0, 0, 5, 0, 0, 0]), 0);
        assert!(coe.is_empty());

        let event = CanFrame::from_data(&[opcode::ACON, 0, 1, 0, 2]);
        coe.mirror(&event, 0);
        assert_eq!(coe.next(), Some(event));
        assert!(coe.next().is_none());
    }
}
