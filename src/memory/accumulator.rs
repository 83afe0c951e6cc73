//! Message accumulation
//!
//! Buffers user messages until a configured number of cycles has passed,
//! then hands them off as one text to be written to long-term memory.

use std::collections::VecDeque;

/// Ordered buffer of user messages awaiting the next flush.
///
/// Not synchronized; the owning session serializes access.
#[derive(Debug, Clone)]
pub struct MessageAccumulator {
    store_cycles: usize,
    messages: VecDeque<String>,
}

impl MessageAccumulator {
    /// `store_cycles` is clamped to at least 1.
    pub fn new(store_cycles: usize) -> Self {
        let store_cycles = store_cycles.max(1);
        Self {
            store_cycles,
            messages: VecDeque::with_capacity(store_cycles),
        }
    }

    /// Add a message to the tail. Empty messages count like any other.
    pub fn append(&mut self, message: impl Into<String>) {
        self.messages.push_back(message.into());
    }

    /// True once the buffer holds exactly `store_cycles` messages
    pub fn should_flush(&self) -> bool {
        self.messages.len() == self.store_cycles
    }

    /// Join all held messages with a single space and empty the buffer.
    pub fn drain(&mut self) -> String {
        self.messages.drain(..).collect::<Vec<_>>().join(" ")
    }

    /// Append, and drain in the same step if the threshold is reached.
    ///
    /// Returns the drained text when a flush is due.
    pub fn push_and_take(&mut self, message: impl Into<String>) -> Option<String> {
        self.append(message);
        if self.should_flush() {
            Some(self.drain())
        } else {
            None
        }
    }

    pub fn messages(&self) -> impl Iterator<Item = &str> {
        self.messages.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn store_cycles(&self) -> usize {
        self.store_cycles
    }
}
