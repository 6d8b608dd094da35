#[cfg(test)]
mod __test__ {

  use crate::event::{LogEvent, LogLevel};
  use crate::flush::{Batch, BatchInfo, BatchOrigin, FlushPool, ShutdownPolicy};
  use crate::sink::{MemorySink, Sink};
  use crate::stats::Stats;

  use crossbeam_channel::{unbounded, Receiver, Sender};
  use std::io;
  use std::sync::{Arc, Mutex};
  use std::thread;
  use std::time::Duration;

  fn events(messages: &[&str]) -> Vec<LogEvent> {
    messages
      .iter()
      .map(|m| LogEvent::new(LogLevel::Info, "test", *m))
      .collect()
  }

  /// Fails on any event whose message starts with "bad", panics on "boom".
  #[derive(Default)]
  struct FlakySink {
    written: Mutex<Vec<String>>,
  }

  impl Sink for FlakySink {
    fn write(&self, _batch: &BatchInfo, event: &LogEvent) -> io::Result<()> {
      if event.message.starts_with("bad") {
        return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
      }
      if event.message == "boom" {
        panic!("sink exploded");
      }
      self.written.lock().unwrap().push(event.message.clone());
      Ok(())
    }
  }

  /// Parks the worker inside the first write until the test releases it.
  struct GateSink {
    entered: Sender<()>,
    release: Receiver<()>,
    inner: MemorySink,
    first: Mutex<bool>,
  }

  impl GateSink {
    fn new() -> (Self, Receiver<()>, Sender<()>) {
      let (entered_tx, entered_rx) = unbounded();
      let (release_tx, release_rx) = unbounded();
      let sink = Self {
        entered: entered_tx,
        release: release_rx,
        inner: MemorySink::new(),
        first: Mutex::new(true),
      };
      (sink, entered_rx, release_tx)
    }
  }

  impl Sink for GateSink {
    fn write(&self, batch: &BatchInfo, event: &LogEvent) -> io::Result<()> {
      let wait = std::mem::replace(&mut *self.first.lock().unwrap(), false);
      if wait {
        let _ = self.entered.send(());
        let _ = self.release.recv();
      }
      self.inner.write(batch, event)
    }
  }

  #[test]
  fn test_batch_written_in_order() {
    let sink = Arc::new(MemorySink::new());
    let stats = Arc::new(Stats::default());
    let pool = FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap();

    pool.submit(Batch::new(BatchOrigin::Unscoped, events(&["a", "b", "c"])));
    pool.shutdown(ShutdownPolicy::Drain);

    let batches = sink.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].messages(), vec!["a", "b", "c"]);
    assert!(batches[0].complete);
    assert_eq!(stats.snapshot().events_written, 3);
    assert_eq!(stats.snapshot().batches_submitted, 1);
  }

  #[test]
  fn test_empty_batch_is_ignored() {
    let sink = Arc::new(MemorySink::new());
    let stats = Arc::new(Stats::default());
    let pool = FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap();

    pool.submit(Batch::new(BatchOrigin::Unscoped, Vec::new()));
    pool.shutdown(ShutdownPolicy::Drain);

    assert!(sink.batches().is_empty());
    assert_eq!(stats.snapshot().batches_submitted, 0);
  }

  #[test]
  fn test_write_failures_do_not_abort_batch() {
    let sink = Arc::new(FlakySink::default());
    let stats = Arc::new(Stats::default());
    let pool = FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap();

    pool.submit(Batch::new(
      BatchOrigin::Unscoped,
      events(&["one", "bad-two", "boom", "four"]),
    ));
    pool.shutdown(ShutdownPolicy::Drain);

    assert_eq!(*sink.written.lock().unwrap(), vec!["one", "four"]);
    let snapshot = stats.snapshot();
    assert_eq!(snapshot.events_written, 2);
    assert_eq!(snapshot.write_failures, 2);
  }

  #[test]
  fn test_submit_after_shutdown_writes_directly() {
    let sink = Arc::new(MemorySink::new());
    let stats = Arc::new(Stats::default());
    let pool = FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap();
    pool.shutdown(ShutdownPolicy::Drain);
    assert!(pool.is_closed());

    pool.submit(Batch::new(BatchOrigin::Unscoped, events(&["late"])));

    // written before submit returned
    assert_eq!(sink.events().len(), 1);
    assert_eq!(stats.snapshot().direct_writes, 1);
  }

  #[test]
  fn test_shutdown_is_idempotent() {
    let sink = Arc::new(MemorySink::new());
    let pool = FlushPool::start(2, sink.clone(), Arc::new(Stats::default())).unwrap();

    pool.shutdown(ShutdownPolicy::Drain);
    pool.shutdown(ShutdownPolicy::Drain);

    assert_eq!(sink.shutdown_count(), 1);
  }

  #[test]
  fn test_lifecycle_hooks_bracket_direct_writes() {
    let sink = Arc::new(MemorySink::new());
    let pool = FlushPool::start(2, sink.clone(), Arc::new(Stats::default())).unwrap();
    assert_eq!(sink.start_count(), 1);

    pool.close(ShutdownPolicy::Drain);
    assert!(pool.is_closed());
    assert_eq!(sink.shutdown_count(), 0);

    // closed but not yet finished: still written, directly
    pool.submit(Batch::new(BatchOrigin::Unscoped, events(&["after close"])));
    assert_eq!(sink.events().len(), 1);

    pool.shutdown(ShutdownPolicy::Drain);
    assert_eq!(sink.start_count(), 1);
    assert_eq!(sink.shutdown_count(), 1);
  }

  #[test]
  fn test_drain_policy_writes_queued_batches() {
    let (sink, entered, release) = GateSink::new();
    let sink = Arc::new(sink);
    let stats = Arc::new(Stats::default());
    let pool = Arc::new(FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap());

    for i in 0..5 {
      pool.submit(Batch::new(BatchOrigin::Unscoped, events(&[format!("e{}", i).as_str()])));
    }
    entered.recv().unwrap();

    let closer = {
      let pool = Arc::clone(&pool);
      thread::spawn(move || pool.shutdown(ShutdownPolicy::Drain))
    };
    release.send(()).unwrap();
    closer.join().unwrap();

    assert_eq!(sink.inner.events().len(), 5);
    assert_eq!(stats.snapshot().events_discarded, 0);
  }

  #[test]
  fn test_discard_policy_drops_queued_batches() {
    let (sink, entered, release) = GateSink::new();
    let sink = Arc::new(sink);
    let stats = Arc::new(Stats::default());
    let pool = Arc::new(FlushPool::start(1, sink.clone(), Arc::clone(&stats)).unwrap());

    for i in 0..5 {
      pool.submit(Batch::new(BatchOrigin::Unscoped, events(&[format!("e{}", i).as_str()])));
    }
    // worker is parked inside the first write
    entered.recv().unwrap();

    let closer = {
      let pool = Arc::clone(&pool);
      thread::spawn(move || pool.shutdown(ShutdownPolicy::Discard))
    };
    while !pool.is_closed() {
      thread::yield_now();
    }
    thread::sleep(Duration::from_millis(50));
    release.send(()).unwrap();
    closer.join().unwrap();

    assert_eq!(sink.inner.events().len(), 1);
    assert_eq!(stats.snapshot().events_discarded, 4);
  }

  #[test]
  fn test_many_producers_lose_nothing() {
    let sink = Arc::new(MemorySink::new());
    let stats = Arc::new(Stats::default());
    let pool = Arc::new(FlushPool::start(3, sink.clone(), Arc::clone(&stats)).unwrap());

    let producers: Vec<_> = (0..6)
      .map(|p| {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
          for i in 0..50 {
            let a = format!("p{}-{}-a", p, i);
            let b = format!("p{}-{}-b", p, i);
            let batch = events(&[a.as_str(), b.as_str()]);
            pool.submit(Batch::new(BatchOrigin::Unscoped, batch));
          }
        })
      })
      .collect();
    for producer in producers {
      producer.join().unwrap();
    }
    pool.shutdown(ShutdownPolicy::Drain);

    let batches = sink.batches();
    assert_eq!(batches.len(), 300);
    for batch in batches {
      let messages = batch.messages();
      assert_eq!(messages.len(), 2);
      assert!(messages[0].ends_with("-a") && messages[1].ends_with("-b"));
    }
  }
}
