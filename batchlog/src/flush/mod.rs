//! # Flush Module
//!
//! The flush worker pool is the only place that performs real I/O.
//!
//! ## Architecture
//!
//! The pool uses a **producer-consumer architecture**:
//! - **Producers**: request threads, the watchdog and the unscoped drainer
//!   hand over finished [`Batch`]es with [`FlushPool::submit`]
//! - **Channel**: one unbounded crossbeam channel, so a producer never waits
//! - **Consumers**: a fixed number of named worker threads sharing the
//!   receiving end; each worker writes a whole batch before taking the next
//!
//! Events within a batch reach the sink in their original order. Batches
//! handled by different workers may interleave.
//!
//! ## Shutdown
//!
//! [`FlushPool::close`] closes the channel and joins the workers, which
//! either write or discard what is still queued depending on the
//! [`ShutdownPolicy`]. Anything submitted after that point is written
//! synchronously on the caller's thread: the pool fails closed, it never
//! drops a batch it was handed after closing. [`FlushPool::shutdown`] closes
//! and then tells the sink it is done.

mod __test__;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, SendError, Sender};
use serde::{Deserialize, Serialize};

use crate::event::LogEvent;
use crate::sink::Sink;
use crate::stats::Stats;
use crate::window::WindowKey;

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// Why a batch was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchOrigin {
  /// The owning request unmarked its window.
  Completed(WindowKey),
  /// The watchdog evicted a window that stayed open past the timeout.
  Evicted(WindowKey),
  /// Events logged outside any window.
  Unscoped,
  /// A window still open when the aggregator shut down.
  Shutdown(WindowKey),
}

impl std::fmt::Display for BatchOrigin {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      BatchOrigin::Completed(key) => write!(f, "completed {}", key),
      BatchOrigin::Evicted(key) => write!(f, "evicted {}", key),
      BatchOrigin::Unscoped => write!(f, "unscoped"),
      BatchOrigin::Shutdown(key) => write!(f, "shutdown {}", key),
    }
  }
}

/// Metadata handed to the sink along with every event of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchInfo {
  pub id: u64,
  pub origin: BatchOrigin,
  pub len: usize,
}

/// An ordered, frozen group of events flushed as one unit.
#[derive(Debug)]
pub struct Batch {
  pub info: BatchInfo,
  pub events: Vec<LogEvent>,
}

impl Batch {
  pub fn new(origin: BatchOrigin, events: Vec<LogEvent>) -> Self {
    Self {
      info: BatchInfo {
        id: NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed),
        origin,
        len: events.len(),
      },
      events,
    }
  }

  pub fn len(&self) -> usize {
    self.events.len()
  }

  pub fn is_empty(&self) -> bool {
    self.events.is_empty()
  }
}

/// What the workers do with batches still queued at shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownPolicy {
  /// Write every queued batch before the workers exit.
  #[default]
  Drain,
  /// Drop queued batches; they are counted as discarded.
  Discard,
}

/// Fixed-size pool of flush workers in front of one [`Sink`].
pub struct FlushPool {
  sender: RwLock<Option<Sender<Batch>>>,
  closed: AtomicBool,
  finished: AtomicBool,
  discard: Arc<AtomicBool>,
  workers: Mutex<Vec<JoinHandle<()>>>,
  sink: Arc<dyn Sink>,
  stats: Arc<Stats>,
}

impl std::fmt::Debug for FlushPool {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("FlushPool")
      .field("closed", &self.closed.load(Ordering::Relaxed))
      .finish_non_exhaustive()
  }
}

impl FlushPool {
  /// Starts `workers` flush threads writing to `sink`.
  ///
  /// ## Errors
  /// Fails when a worker thread cannot be spawned; workers already running
  /// are stopped before returning.
  pub fn start(workers: usize, sink: Arc<dyn Sink>, stats: Arc<Stats>) -> std::io::Result<Self> {
    let (sender, receiver) = crossbeam_channel::unbounded::<Batch>();
    let discard = Arc::new(AtomicBool::new(false));

    sink.on_start();

    let mut handles = Vec::with_capacity(workers);
    for index in 0..workers {
      let receiver = receiver.clone();
      let sink = Arc::clone(&sink);
      let stats = Arc::clone(&stats);
      let discard = Arc::clone(&discard);
      let spawned = thread::Builder::new()
        .name(format!("batchlog-flush-{}", index))
        .spawn(move || Self::worker_loop(receiver, sink, stats, discard));

      match spawned {
        Ok(handle) => handles.push(handle),
        Err(e) => {
          drop(sender);
          for handle in handles {
            let _ = handle.join();
          }
          return Err(e);
        },
      }
    }

    Ok(Self {
      sender: RwLock::new(Some(sender)),
      closed: AtomicBool::new(false),
      finished: AtomicBool::new(false),
      discard,
      workers: Mutex::new(handles),
      sink,
      stats,
    })
  }

  /// Hands a batch to the workers. Never blocks on the sink while the pool
  /// is running; after shutdown the batch is written on the calling thread.
  pub fn submit(&self, batch: Batch) {
    if batch.is_empty() {
      return;
    }

    let batch = match self.try_enqueue(batch) {
      Ok(()) => {
        self.stats.batches_submitted.fetch_add(1, Ordering::Relaxed);
        return;
      },
      Err(batch) => batch,
    };

    // Fail closed: the pool is gone, write synchronously
    self.write_now(batch);
  }

  /// Writes a whole batch on the calling thread, bypassing the workers.
  pub fn write_now(&self, batch: Batch) {
    if batch.is_empty() {
      return;
    }
    self
      .stats
      .direct_writes
      .fetch_add(batch.len() as u64, Ordering::Relaxed);
    write_batch(self.sink.as_ref(), &batch, &self.stats);
  }

  fn try_enqueue(&self, batch: Batch) -> Result<(), Batch> {
    if self.closed.load(Ordering::SeqCst) {
      return Err(batch);
    }
    let sender = match self.sender.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match sender.as_ref() {
      Some(tx) => tx.send(batch).map_err(|SendError(batch)| batch),
      None => Err(batch),
    }
  }

  /// Writes one event on the calling thread, bypassing the workers.
  pub fn write_direct(&self, event: LogEvent) {
    self.stats.direct_writes.fetch_add(1, Ordering::Relaxed);
    let batch = Batch::new(BatchOrigin::Unscoped, vec![event]);
    write_batch(self.sink.as_ref(), &batch, &self.stats);
  }

  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  /// Closes the pool and then calls [`Sink::on_shutdown`], once.
  pub fn shutdown(&self, policy: ShutdownPolicy) {
    self.close(policy);
    if !self.finished.swap(true, Ordering::SeqCst) {
      self.sink.on_shutdown();
    }
  }

  /// Stops accepting batches and waits for the workers to finish.
  ///
  /// Only batches already queued are subject to `policy`; anything submitted
  /// afterwards is written directly. Idempotent.
  pub fn close(&self, policy: ShutdownPolicy) {
    if self.closed.swap(true, Ordering::SeqCst) {
      return;
    }
    if policy == ShutdownPolicy::Discard {
      self.discard.store(true, Ordering::Release);
    }

    // Dropping the only sender disconnects the channel once it is empty
    let sender = match self.sender.write() {
      Ok(mut guard) => guard.take(),
      Err(poisoned) => poisoned.into_inner().take(),
    };
    drop(sender);

    let handles = match self.workers.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    for handle in handles {
      if handle.join().is_err() {
        eprintln!("[Flush] worker exited with a panic");
      }
    }
  }

  /// Consumer side: runs on every worker thread until the channel is closed
  /// and empty.
  fn worker_loop(
    receiver: Receiver<Batch>,
    sink: Arc<dyn Sink>,
    stats: Arc<Stats>,
    discard: Arc<AtomicBool>,
  ) {
    while let Ok(batch) = receiver.recv() {
      if discard.load(Ordering::Acquire) {
        stats
          .events_discarded
          .fetch_add(batch.len() as u64, Ordering::Relaxed);
        continue;
      }
      write_batch(sink.as_ref(), &batch, &stats);
    }
  }
}

/// Writes every event of `batch` in order, isolating each write: an error
/// or a panic in the sink is reported and the next event is still written.
pub(crate) fn write_batch(sink: &dyn Sink, batch: &Batch, stats: &Stats) {
  for event in &batch.events {
    match panic::catch_unwind(AssertUnwindSafe(|| sink.write(&batch.info, event))) {
      Ok(Ok(())) => {
        stats.events_written.fetch_add(1, Ordering::Relaxed);
      },
      Ok(Err(e)) => {
        stats.write_failures.fetch_add(1, Ordering::Relaxed);
        eprintln!("[Flush] write failed in batch {}: {}", batch.info.id, e);
      },
      Err(_) => {
        stats.write_failures.fetch_add(1, Ordering::Relaxed);
        eprintln!("[Flush] sink panicked in batch {}", batch.info.id);
      },
    }
  }

  match panic::catch_unwind(AssertUnwindSafe(|| sink.end_batch(&batch.info))) {
    Ok(Ok(())) => {},
    Ok(Err(e)) => eprintln!("[Flush] end of batch {} failed: {}", batch.info.id, e),
    Err(_) => eprintln!("[Flush] sink panicked ending batch {}", batch.info.id),
  }
}
