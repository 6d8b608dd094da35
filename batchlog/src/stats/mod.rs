//! # Stats Module
//!
//! Counters for every stage of the pipeline. They are plain atomics bumped
//! with relaxed ordering, so a [`StatsSnapshot`] is not a consistent cut
//! across counters while work is in flight.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters shared by the router, the watchdog and the flush workers.
#[derive(Debug, Default)]
pub struct Stats {
  pub windows_opened: AtomicU64,
  pub windows_completed: AtomicU64,
  pub windows_evicted: AtomicU64,
  pub windows_flushed_on_shutdown: AtomicU64,
  pub unscoped_events: AtomicU64,
  /// Events that arrived for a window already evicted by the watchdog.
  pub late_events: AtomicU64,
  pub batches_submitted: AtomicU64,
  pub events_written: AtomicU64,
  pub write_failures: AtomicU64,
  /// Events written synchronously because the pool was closed.
  pub direct_writes: AtomicU64,
  pub events_discarded: AtomicU64,
}

impl Stats {
  pub fn snapshot(&self) -> StatsSnapshot {
    StatsSnapshot {
      windows_opened: self.windows_opened.load(Ordering::Relaxed),
      windows_completed: self.windows_completed.load(Ordering::Relaxed),
      windows_evicted: self.windows_evicted.load(Ordering::Relaxed),
      windows_flushed_on_shutdown: self.windows_flushed_on_shutdown.load(Ordering::Relaxed),
      unscoped_events: self.unscoped_events.load(Ordering::Relaxed),
      late_events: self.late_events.load(Ordering::Relaxed),
      batches_submitted: self.batches_submitted.load(Ordering::Relaxed),
      events_written: self.events_written.load(Ordering::Relaxed),
      write_failures: self.write_failures.load(Ordering::Relaxed),
      direct_writes: self.direct_writes.load(Ordering::Relaxed),
      events_discarded: self.events_discarded.load(Ordering::Relaxed),
    }
  }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
  pub windows_opened: u64,
  pub windows_completed: u64,
  pub windows_evicted: u64,
  pub windows_flushed_on_shutdown: u64,
  pub unscoped_events: u64,
  pub late_events: u64,
  pub batches_submitted: u64,
  pub events_written: u64,
  pub write_failures: u64,
  pub direct_writes: u64,
  pub events_discarded: u64,
}
