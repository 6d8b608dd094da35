#[cfg(test)]
mod __test__ {

  use crate::aggregator::Aggregator;
  use crate::config::Config;
  use crate::event::{LogEvent, LogLevel};
  use crate::flush::BatchOrigin;
  use crate::sink::{MemorySink, RecordedBatch};
  use crate::watchdog::WATCHDOG_TARGET;

  use std::collections::HashMap;
  use std::sync::{Arc, Barrier};
  use std::thread;
  use std::time::{Duration, Instant};

  fn event(message: &str) -> LogEvent {
    LogEvent::new(LogLevel::Info, "test", message)
  }

  fn start(config: Config) -> (Aggregator, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let aggregator = Aggregator::new(config, sink.clone()).unwrap();
    (aggregator, sink)
  }

  fn evicted(sink: &MemorySink) -> Vec<RecordedBatch> {
    sink
      .batches()
      .into_iter()
      .filter(|b| matches!(b.origin, BatchOrigin::Evicted(_)))
      .collect()
  }

  #[test]
  fn test_stuck_window_is_flushed_once_after_timeout() {
    let (aggregator, sink) = start(Config::default().with_watch_timeout_secs(10));

    let window = aggregator.mark();
    let key = window.key().clone();
    window.record(event("stuck"));

    // not yet past the threshold
    assert_eq!(aggregator.sweep_expired_at(Instant::now()), 0);
    assert!(aggregator.is_open(&key));

    let later = Instant::now() + Duration::from_secs(11);
    assert_eq!(aggregator.sweep_expired_at(later), 1);
    assert!(!aggregator.is_open(&key));
    assert_eq!(aggregator.open_windows(), 0);

    // a second pass finds nothing
    assert_eq!(aggregator.sweep_expired_at(later), 0);

    // the late unmark loses the race and does nothing
    assert!(!window.unmark_and_flush());
    aggregator.shutdown();

    let batches = evicted(&sink);
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].origin, BatchOrigin::Evicted(key.clone()));
    assert_eq!(batches[0].messages(), vec!["stuck"]);
    assert!(!sink
      .batches()
      .iter()
      .any(|b| matches!(b.origin, BatchOrigin::Completed(_))));

    let warning = sink
      .events()
      .into_iter()
      .find(|e| e.target == WATCHDOG_TARGET)
      .unwrap();
    assert_eq!(warning.level, LogLevel::Warn);
    assert!(warning
      .fields
      .contains(&("window".to_string(), key.to_string())));
    assert_eq!(aggregator.stats().windows_evicted, 1);
  }

  #[test]
  fn test_only_expired_windows_are_evicted() {
    let (aggregator, sink) = start(Config::default().with_watch_timeout_secs(2));

    let old = aggregator.mark();
    old.record(event("old"));
    thread::sleep(Duration::from_millis(1200));
    let young = aggregator.mark();
    young.record(event("young"));

    // old is about 2.2s old at that instant, young about 1s
    let now = Instant::now() + Duration::from_secs(1);
    assert_eq!(aggregator.sweep_expired_at(now), 1);
    assert!(aggregator.is_open(young.key()));
    assert!(!aggregator.is_open(old.key()));

    drop(old);
    drop(young);
    aggregator.shutdown();

    assert_eq!(evicted(&sink)[0].messages(), vec!["old"]);
  }

  #[test]
  fn test_events_after_eviction_take_unscoped_path() {
    let (aggregator, sink) = start(Config::default().with_watch_timeout_secs(1));

    let window = aggregator.mark();
    window.record(event("early"));
    aggregator.sweep_expired_at(Instant::now() + Duration::from_secs(2));
    window.record(event("late"));
    window.unmark_and_flush();
    aggregator.shutdown();

    let unscoped: Vec<_> = sink
      .batches()
      .into_iter()
      .filter(|b| b.origin == BatchOrigin::Unscoped)
      .flat_map(|b| b.events)
      .filter(|e| e.target != WATCHDOG_TARGET)
      .map(|e| e.message)
      .collect();
    assert_eq!(unscoped, vec!["late"]);
    assert_eq!(evicted(&sink)[0].messages(), vec!["early"]);
    assert_eq!(aggregator.stats().late_events, 1);
  }

  #[test]
  fn test_eviction_races_unmark_exactly_once() {
    let (aggregator, sink) = start(Config::default().with_watch_timeout_secs(1));

    let windows: Vec<_> = (0..200)
      .map(|i| {
        let window = aggregator.mark();
        window.record(event(&format!("w{}", i)));
        window
      })
      .collect();

    let barrier = Arc::new(Barrier::new(2));
    let sweeper = {
      let aggregator = aggregator.clone();
      let barrier = Arc::clone(&barrier);
      thread::spawn(move || {
        barrier.wait();
        let future = Instant::now() + Duration::from_secs(5);
        let mut total = 0;
        for _ in 0..4 {
          total += aggregator.sweep_expired_at(future);
        }
        total
      })
    };

    barrier.wait();
    let mut unmarked = 0;
    for window in windows {
      if window.unmark_and_flush() {
        unmarked += 1;
      }
    }
    let evicted_count = sweeper.join().unwrap();
    aggregator.shutdown();

    assert_eq!(unmarked + evicted_count, 200);

    let mut seen: HashMap<String, usize> = HashMap::new();
    for batch in sink.batches() {
      if matches!(
        batch.origin,
        BatchOrigin::Completed(_) | BatchOrigin::Evicted(_)
      ) {
        for message in batch.messages() {
          *seen.entry(message.to_string()).or_default() += 1;
        }
      }
    }
    assert_eq!(seen.len(), 200);
    assert!(seen.values().all(|count| *count == 1));
  }

  #[test]
  fn test_watchdog_thread_evicts_on_its_own() {
    let (aggregator, sink) = start(Config::default().with_watch_timeout_secs(1));

    let window = aggregator.mark();
    window.record(event("never unmarked"));

    // first tick at 1s sees an age of about 1s; the one at 2s evicts
    let deadline = Instant::now() + Duration::from_secs(5);
    while evicted(&sink).is_empty() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(evicted(&sink).len(), 1);
    assert!(!aggregator.is_open(window.key()));
    aggregator.shutdown();
  }
}
