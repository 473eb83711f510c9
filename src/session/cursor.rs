//! cursor.rs
//! Latest-value mailbox from the receive thread to the render loop.
//!
//! A one-slot ArrayQueue with force_push: the producer overwrites, never waits, and the
//! consumer only ever sees the newest position. Intermediate values are lost on purpose,
//! so nothing that needs every sample (logging, scoring) may read from here.

use crossbeam_queue::ArrayQueue;

use crate::link::codec::Position;

pub struct CursorBridge<T = Position> {
    slot: ArrayQueue<T>,
}

impl<T> Default for CursorBridge<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> CursorBridge<T> {
    pub fn new() -> Self {
        Self { slot: ArrayQueue::new(1) }
    }

    /// Overwrites any unread value.
    #[inline]
    pub fn publish(&self, value: T) {
        let _ = self.slot.force_push(value);
    }

    /// Newest value since the last consume, or None if nothing new arrived.
    #[inline]
    pub fn consume(&self) -> Option<T> {
        self.slot.pop()
    }
}
