//! # Watchdog Module
//!
//! Guards against requests that never unmark their window. Every tick scans
//! the open windows and force-flushes those open longer than the configured
//! timeout, so a stuck request still produces its partial log within a
//! bounded delay.
//!
//! The watchdog and the owning request race to close a window. Both go
//! through the same atomic registry removal, so whichever arrives first
//! flushes and the other does nothing. Lines the request logs after losing
//! the race take the unscoped path.

mod __test__;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use crate::aggregator::Core;
use crate::event::{LogEvent, LogLevel};
use crate::flush::{Batch, BatchOrigin};
use crate::ticker::Ticker;

pub const WATCHDOG_TARGET: &str = "batchlog::watchdog";

pub struct Watchdog;

impl Watchdog {
  /// Starts the periodic scan. The tick interval equals the timeout.
  pub(crate) fn spawn(core: Arc<Core>) -> std::io::Result<Ticker> {
    let interval = core.config.watch_timeout();
    Ticker::spawn("batchlog-watchdog", interval, move || {
      Self::sweep(&core, Instant::now());
    })
  }

  /// One scan as of `now`. Returns the number of windows this pass evicted.
  pub(crate) fn sweep(core: &Core, now: Instant) -> usize {
    let threshold = core.config.watch_timeout();
    let mut evicted = 0;

    for key in core.registry.expired(now, threshold) {
      // Lost the race against unmark
      let Some(handle) = core.registry.remove(&key) else {
        continue;
      };
      let Some(events) = handle.detach() else {
        continue;
      };

      let warning = LogEvent::new(
        LogLevel::Warn,
        WATCHDOG_TARGET,
        format!(
          "window open longer than {}s, flushing {} buffered events",
          core.config.watch_timeout_secs,
          events.len()
        ),
      )
      .with_field("window", key.to_string())
      .with_field("age_ms", handle.age(now).as_millis().to_string());
      core.route(None, warning);

      core.stats.windows_evicted.fetch_add(1, Ordering::Relaxed);
      core.submit(Batch::new(BatchOrigin::Evicted(key), events));
      evicted += 1;
    }

    evicted
  }
}
