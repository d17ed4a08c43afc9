//! A bounded circular frame queue with overflow and high-water-mark
//! accounting.
//!
//! The queue is the single producer/consumer boundary between the
//! transport's frame arrival (possibly interrupt-fed) and the driving loop.
//! Overflow is silent data loss by design: when full, a `put` overwrites the
//! oldest entry and increments a counter, reflecting the bus's
//! unreliable-delivery model. No backpressure is signalled to the transport.

use crate::frame::CanFrame;
use alloc::vec;
use alloc::vec::Vec;

#[derive(Debug, Clone, Copy, Default)]
struct QueueEntry {
    insert_time: u64,
    frame: CanFrame,
}

/// Fixed-capacity ring of received or looped-back frames with insertion
/// timestamps and monotonic diagnostics counters.
pub struct FrameQueue {
    buffer: Vec<QueueEntry>,
    head: usize,
    tail: usize,
    size: usize,
    full: bool,
    hwm: usize,
    puts: u32,
    gets: u32,
    overflows: u32,
}

impl FrameQueue {
    /// Creates a queue holding at most `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: vec![QueueEntry::default(); capacity.max(1)],
            head: 0,
            tail: 0,
            size: 0,
            full: false,
            hwm: 0,
            puts: 0,
            gets: 0,
            overflows: 0,
        }
    }

    /// O(1) insert. When the queue is full the oldest entry is overwritten,
    /// the read cursor advances and the overflow counter is incremented.
    pub fn put(&mut self, frame: CanFrame, now_ms: u64) {
        self.buffer[self.head] = QueueEntry {
            insert_time: now_ms,
            frame,
        };

        if self.full {
            // Oldest item is lost; drag the read cursor along.
            self.tail = (self.tail + 1) % self.buffer.len();
            self.overflows += 1;
        } else {
            self.size += 1;
        }

        self.head = (self.head + 1) % self.buffer.len();
        self.full = self.head == self.tail;
        self.puts += 1;

        if self.size > self.hwm {
            self.hwm = self.size;
        }
    }

    /// O(1) removal of the oldest frame, or `None` if the queue is empty.
    pub fn get(&mut self) -> Option<CanFrame> {
        if self.is_empty() {
            return None;
        }
        let entry = self.buffer[self.tail];
        self.tail = (self.tail + 1) % self.buffer.len();
        self.full = false;
        self.size -= 1;
        self.gets += 1;
        Some(entry.frame)
    }

    /// Returns the oldest frame without removing it.
    pub fn peek(&self) -> Option<&CanFrame> {
        if self.is_empty() {
            None
        } else {
            Some(&self.buffer[self.tail].frame)
        }
    }

    /// Insertion timestamp of the oldest queued frame.
    pub fn insert_time(&self) -> Option<u64> {
        if self.is_empty() {
            None
        } else {
            Some(self.buffer[self.tail].insert_time)
        }
    }

    pub fn available(&self) -> bool {
        !self.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn free_slots(&self) -> usize {
        self.buffer.len() - self.size
    }

    /// High-water mark: the largest size the queue has reached. Monotonically
    /// non-decreasing; resets only on [`clear`](Self::clear).
    pub fn hwm(&self) -> usize {
        self.hwm
    }

    pub fn puts(&self) -> u32 {
        self.puts
    }

    pub fn gets(&self) -> u32 {
        self.gets
    }

    /// Number of frames silently lost to overwrites of a full queue.
    pub fn overflows(&self) -> u32 {
        self.overflows
    }

    /// Empties the queue and resets all diagnostics counters.
    pub fn clear(&mut self) {
        self.head = 0;
        self.tail = 0;
        self.size = 0;
        self.full = false;
        self.hwm = 0;
        self.puts = 0;
        self.gets = 0;
        self.overflows = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_tagged(tag: u8) -> CanFrame {
        CanFrame::from_data(&[tag])
    }

    #[test]
    fn test_fifo_order() {
        let mut q = FrameQueue::new(4);
        for i in 0..3 {
            q.put(frame_tagged(i), i as u64);
        }
        assert_eq!(q.size(), 3);
        assert_eq!(q.peek().unwrap().data[0], 0);
        assert_eq!(q.get().unwrap().data[0], 0);
        assert_eq!(q.get().unwrap().data[0], 1);
        assert_eq!(q.get().unwrap().data[0], 2);
        assert!(q.get().is_none());
    }

    #[test]
    fn test_overwrite_law() {
        // After C+1 puts with no gets: size == C, one overflow, and the
        // oldest original item is gone.
        let capacity = 4;
        let mut q = FrameQueue::new(capacity);
        for i in 0..=capacity {
            q.put(frame_tagged(i as u8), 0);
        }
        assert_eq!(q.size(), capacity);
        assert_eq!(q.overflows(), 1);
        assert!(q.is_full());
        // Item 0 was overwritten; the head of the queue is now item 1.
        assert_eq!(q.get().unwrap().data[0], 1);
    }

    #[test]
    fn test_hwm_is_monotonic() {
        let mut q = FrameQueue::new(4);
        q.put(frame_tagged(0), 0);
        q.put(frame_tagged(1), 0);
        assert_eq!(q.hwm(), 2);
        q.get();
        q.get();
        assert_eq!(q.hwm(), 2);
        q.put(frame_tagged(2), 0);
        assert_eq!(q.hwm(), 2);
    }

    #[test]
    fn test_counters_and_clear() {
        let mut q = FrameQueue::new(2);
        q.put(frame_tagged(0), 10);
        q.put(frame_tagged(1), 11);
        q.put(frame_tagged(2), 12);
        q.get();
        assert_eq!(q.puts(), 3);
        assert_eq!(q.gets(), 1);
        assert_eq!(q.overflows(), 1);
        assert_eq!(q.insert_time(), Some(12));

        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.hwm(), 0);
        assert_eq!(q.puts(), 0);
        assert_eq!(q.overflows(), 0);
        assert!(q.peek().is_none());
    }
}
