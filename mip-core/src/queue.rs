//! Per-iteration output queue
//!
//! Components collect what they produce during an iteration here. The queue
//! is cleared when a new iteration starts and rewinds after being drained, so
//! every outgoing connection of a component sees the same committed set.

use crate::message::MessageRef;

#[derive(Debug, Default)]
pub struct IterationQueue {
    iteration: Option<u64>,
    messages: Vec<MessageRef>,
    cursor: usize,
}

impl IterationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter `iteration`, discarding what was queued for an earlier one
    ///
    /// Returns true if the iteration changed.
    pub fn begin(&mut self, iteration: u64) -> bool {
        if self.iteration == Some(iteration) {
            return false;
        }
        self.iteration = Some(iteration);
        self.messages.clear();
        self.cursor = 0;
        true
    }

    /// Iteration the queued messages belong to
    pub fn iteration(&self) -> Option<u64> {
        self.iteration
    }

    pub fn push(&mut self, message: MessageRef) {
        self.messages.push(message);
    }

    /// Next queued message, or `None` (and rewind) once exhausted
    pub fn next(&mut self) -> Option<MessageRef> {
        match self.messages.get(self.cursor) {
            Some(message) => {
                self.cursor += 1;
                Some(message.clone())
            }
            None => {
                self.cursor = 0;
                None
            }
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
