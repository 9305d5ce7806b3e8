// SPDX-License-Identifier: MIT OR Apache-2.0
//! Circular buffers of in-flight packets for the Kermit sliding window.
//!
//! Occupied slots run from `begin` around to `next`; the sequence
//! numbers of consecutive occupied slots are consecutive modulo 64.
//! Every transfer uses windows, with capacity 1 standing in for the
//! unwindowed stop-and-wait flow.

use super::packet::PacketType;

/// One in-flight packet image. Receivers keep the decoded payload for
/// ordered writes to disk; senders keep the full encoded wire bytes for
/// retransmission.
#[derive(Debug)]
pub(super) struct Slot {
    pub seq: u8,
    pub ptype: PacketType,
    pub try_count: u32,
    pub acked: bool,
    pub occupied: bool,
    pub data: Vec<u8>,
}

impl Default for Slot {
    fn default() -> Self {
        Slot {
            seq: 0,
            ptype: PacketType::Nak,
            try_count: 0,
            acked: false,
            occupied: false,
            data: Vec::new(),
        }
    }
}

#[derive(Debug)]
pub(super) struct Window {
    pub slots: Vec<Slot>,
    /// Index of the oldest occupied slot.
    pub begin: usize,
    /// Index where the next packet is appended.
    pub next: usize,
    /// Number of occupied slots; `count <= capacity`.
    pub count: usize,
}

impl Window {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, Slot::default);
        Window {
            slots,
            begin: 0,
            next: 0,
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.capacity()
    }

    /// Index of the most recently appended slot.
    pub fn last_index(&self) -> usize {
        if self.next == 0 {
            self.capacity() - 1
        } else {
            self.next - 1
        }
    }

    /// SEQ of the most recently appended slot, if any.
    pub fn last_seq(&self) -> Option<u8> {
        if self.is_empty() {
            None
        } else {
            Some(self.slots[self.last_index()].seq)
        }
    }

    /// Occupied slot indices in window order.
    pub fn indices(&self) -> Vec<usize> {
        let mut out = Vec::with_capacity(self.count);
        let mut i = self.begin;
        for _ in 0..self.count {
            out.push(i);
            i = (i + 1) % self.capacity();
        }
        out
    }

    /// Find the occupied slot holding `seq`.
    pub fn find_seq(&self, seq: u8) -> Option<usize> {
        self.indices()
            .into_iter()
            .find(|&i| self.slots[i].seq == seq)
    }

    /// Store `slot` at the append position. Grows the window unless it
    /// is full, in which case the slot at the append position (which is
    /// then also the oldest) is replaced in place.
    ///
    /// Returns the index written.
    pub fn append(&mut self, slot: Slot) -> usize {
        let i = self.next;
        self.slots[i] = slot;
        self.slots[i].occupied = true;
        if !self.is_full() {
            self.count += 1;
            self.next = (self.next + 1) % self.capacity();
        } else {
            debug_assert_eq!(i, self.begin);
        }
        i
    }

    /// Replace the contents of an existing slot, keeping its position.
    pub fn replace(&mut self, index: usize, slot: Slot) {
        self.slots[index] = slot;
        self.slots[index].occupied = true;
    }

    /// Drop the oldest slot and return it.
    pub fn pop_front(&mut self) -> Option<Slot> {
        if self.is_empty() {
            return None;
        }
        let slot = std::mem::take(&mut self.slots[self.begin]);
        self.begin = (self.begin + 1) % self.capacity();
        self.count -= 1;
        Some(slot)
    }

    pub fn front(&self) -> Option<&Slot> {
        if self.is_empty() {
            None
        } else {
            Some(&self.slots[self.begin])
        }
    }

    /// Drop every slot and reset the cursors.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = Slot::default();
        }
        self.begin = 0;
        self.next = 0;
        self.count = 0;
    }

    /// Resize to a freshly-negotiated capacity, dropping contents.
    pub fn reset(&mut self, capacity: usize) {
        assert!(capacity >= 1);
        self.slots.clear();
        self.slots.resize_with(capacity, Slot::default);
        self.begin = 0;
        self.next = 0;
        self.count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(seq: u8) -> Slot {
        Slot {
            seq,
            ptype: PacketType::Data,
            try_count: 1,
            acked: false,
            occupied: true,
            data: vec![seq],
        }
    }

    #[test]
    fn append_and_wrap() {
        let mut w = Window::new(3);
        assert!(w.is_empty());
        for seq in 0..3 {
            w.append(slot(seq));
        }
        assert!(w.is_full());
        assert_eq!(w.indices(), vec![0, 1, 2]);
        assert_eq!(w.last_seq(), Some(2));

        assert_eq!(w.pop_front().unwrap().seq, 0);
        w.append(slot(3));
        assert_eq!(w.indices(), vec![1, 2, 0]);
        assert_eq!(w.last_seq(), Some(3));
        assert_eq!(w.find_seq(2), Some(2));
        assert_eq!(w.find_seq(9), None);
    }

    #[test]
    fn full_append_replaces_in_place() {
        let mut w = Window::new(2);
        w.append(slot(0));
        w.append(slot(1));
        let i = w.append(slot(2));
        assert_eq!(i, w.begin);
        assert_eq!(w.count, 2);
        assert_eq!(w.slots[i].seq, 2);
    }

    #[test]
    fn clear_resets_cursors() {
        let mut w = Window::new(2);
        w.append(slot(0));
        w.append(slot(1));
        w.pop_front();
        w.clear();
        assert!(w.is_empty());
        assert_eq!(w.begin, 0);
        assert_eq!(w.next, 0);
    }

    #[test]
    fn capacity_one_stop_and_wait() {
        let mut w = Window::new(1);
        w.append(slot(7));
        assert!(w.is_full());
        assert_eq!(w.front().unwrap().seq, 7);
        w.append(slot(8));
        assert_eq!(w.front().unwrap().seq, 8);
        assert_eq!(w.count, 1);
    }
}
