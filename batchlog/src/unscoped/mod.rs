//! Events logged while no window is open.
//!
//! In [`UnscopedMode::Immediate`] the router submits each such event as its
//! own one-event batch. In [`UnscopedMode::Batched`] it pushes them onto an
//! [`UnscopedQueue`], and a ticker drains the queue into one batch per
//! interval.


use crossbeam_queue::SegQueue;
use serde::{Deserialize, Serialize};

use crate::event::LogEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnscopedMode {
  /// One batch per event, submitted as soon as the event is routed.
  #[default]
  Immediate,
  /// Events accumulate and are flushed together on every drainer tick.
  Batched,
}

/// Lock-free FIFO of unscoped events.
#[derive(Debug, Default)]
pub struct UnscopedQueue {
  events: SegQueue<LogEvent>,
}

impl UnscopedQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push(&self, event: LogEvent) {
    self.events.push(event);
  }

  /// Takes the events queued when the drain starts, in order.
  ///
  /// Pops are bounded by the length observed up front, so producers that
  /// keep pushing during the drain cannot starve it; their events are
  /// picked up by the next drain. Each event is popped exactly once.
  ///
  /// Two drains running at once may split events between their results in
  /// interleaved order; callers that need batch order serialize their
  /// drains, as the aggregator does.
  pub fn drain(&self) -> Vec<LogEvent> {
    let pending = self.events.len();
    let mut batch = Vec::with_capacity(pending);
    for _ in 0..pending {
      match self.events.pop() {
        Some(event) => batch.push(event),
        None => break,
      }
    }
    batch
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }
}
