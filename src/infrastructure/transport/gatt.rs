//! GATT subscription queue
//!
//! Notify/indicate characteristics are enabled strictly one at a time: the
//! next descriptor write is only issued after the previous one is
//! acknowledged.

use crate::infrastructure::transport::Characteristic;
use std::collections::VecDeque;

/// What the connection should do after a queue transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueStep {
    /// Write the descriptor of this characteristic next.
    Next(Characteristic),
    /// Every characteristic is subscribed.
    Complete,
    /// The in-flight write was rejected.
    Failed(Characteristic),
    /// Acknowledgment did not match the in-flight item.
    Ignored,
}

#[derive(Debug, Default)]
pub struct DescriptorQueue {
    pending: VecDeque<Characteristic>,
    in_flight: Option<Characteristic>,
}

impl DescriptorQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the queue with the subscribable characteristics from a
    /// discovery result and returns the first step.
    pub fn load(&mut self, characteristics: Vec<Characteristic>) -> QueueStep {
        self.pending = characteristics
            .into_iter()
            .filter(Characteristic::is_subscribable)
            .collect();
        self.in_flight = None;
        self.advance()
    }

    fn advance(&mut self) -> QueueStep {
        match self.pending.pop_front() {
            Some(next) => {
                self.in_flight = Some(next.clone());
                QueueStep::Next(next)
            }
            None => QueueStep::Complete,
        }
    }

    pub fn acknowledge(&mut self, characteristic: &str, success: bool) -> QueueStep {
        match &self.in_flight {
            Some(current) if current.uuid == characteristic => {}
            _ => return QueueStep::Ignored,
        }
        let Some(current) = self.in_flight.take() else {
            return QueueStep::Ignored;
        };

        if !success {
            self.pending.clear();
            return QueueStep::Failed(current);
        }
        self.advance()
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn remaining(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }
}
