//! # Aggregator Module
//!
//! Request-scoped log batching. Log lines emitted while a request is being
//! handled are buffered in that request's *window* and handed to the flush
//! pool as one batch when the request finishes, so the lines of one request
//! reach the sink together and in order, and the request thread never waits
//! on the sink.
//!
//! ## Flow
//!
//! ```text
//! log call ──► route ──► open window?  ── yes ──► window buffer ──(unmark)──┐
//!                              │                       │                    │
//!                              no                  (watchdog)               ▼
//!                              │                       └──────────────► flush pool ──► sink
//!                              ▼                                            ▲
//!                  immediate: one-event batch ──────────────────────────────┤
//!                  batched:   unscoped queue ──(drainer tick)───────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use batchlog::aggregator::Aggregator;
//! use batchlog::config::Config;
//! use batchlog::event::{LogEvent, LogLevel};
//! use batchlog::sink::MemorySink;
//!
//! let sink = Arc::new(MemorySink::new());
//! let aggregator = Aggregator::new(Config::default(), sink.clone()).unwrap();
//!
//! let window = aggregator.mark();
//! window.record(LogEvent::new(LogLevel::Info, "http", "start"));
//! window.record(LogEvent::new(LogLevel::Info, "http", "done"));
//! window.unmark_and_flush();
//!
//! aggregator.shutdown();
//! assert_eq!(sink.batches()[0].messages(), vec!["start", "done"]);
//! ```
//!
//! ## Lifecycle
//!
//! The aggregator owns its background work: the flush workers, the watchdog
//! and, in batched mode, the unscoped drainer. [`Aggregator::shutdown`] stops
//! all of them and flushes whatever is still buffered. From the moment
//! shutdown begins every log call is written synchronously on the calling
//! thread, and new windows open already closed.


use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;

use crate::config::Config;
use crate::error::BatchlogError;
use crate::event::LogEvent;
use crate::flush::{Batch, BatchOrigin, FlushPool};
use crate::layer::AggregationLayer;
use crate::sink::Sink;
use crate::stats::{Stats, StatsSnapshot};
use crate::ticker::Ticker;
use crate::unscoped::{UnscopedMode, UnscopedQueue};
use crate::watchdog::Watchdog;
use crate::window::{Registry, WindowHandle, WindowKey};

static NEXT_CORE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by request threads, the tracing layer and background tasks.
#[derive(Debug)]
pub(crate) struct Core {
  /// Distinguishes the windows of aggregators sharing one tracing registry.
  pub(crate) id: u64,
  pub(crate) config: Config,
  pub(crate) registry: Registry,
  pub(crate) unscoped: UnscopedQueue,
  pub(crate) pool: FlushPool,
  pub(crate) stats: Arc<Stats>,
  closing: AtomicBool,
  drain_lock: Mutex<()>,
}

impl Core {
  /// Set once shutdown has begun; never cleared.
  pub(crate) fn is_closing(&self) -> bool {
    self.closing.load(Ordering::SeqCst)
  }

  /// Hands a batch to the pool, or writes it on this thread once shutdown
  /// has begun, so the shutdown policy never applies to it.
  pub(crate) fn submit(&self, batch: Batch) {
    if self.is_closing() {
      self.pool.write_now(batch);
    } else {
      self.pool.submit(batch);
    }
  }

  /// Routes one captured event. Never blocks on the sink while running.
  pub(crate) fn route(&self, window: Option<&WindowHandle>, event: LogEvent) {
    if self.is_closing() {
      self.pool.write_direct(event);
      return;
    }

    let event = match window {
      Some(handle) => match handle.append(event) {
        Ok(()) => return,
        Err(event) => {
          // window already flushed, most likely by the watchdog
          self.stats.late_events.fetch_add(1, Ordering::Relaxed);
          event
        },
      },
      None => event,
    };

    self.route_unscoped(event);
  }

  fn route_unscoped(&self, event: LogEvent) {
    self.stats.unscoped_events.fetch_add(1, Ordering::Relaxed);
    match self.config.unscoped_mode {
      UnscopedMode::Immediate => {
        self.submit(Batch::new(BatchOrigin::Unscoped, vec![event]));
      },
      UnscopedMode::Batched => {
        self.unscoped.push(event);
        // Shutdown raced with this push and its drain may have missed it;
        // this drain writes directly.
        if self.is_closing() {
          self.drain_unscoped();
        }
      },
    }
  }

  pub(crate) fn mark(&self) -> WindowHandle {
    let key = WindowKey::next();
    if self.is_closing() {
      return WindowHandle::closed(key);
    }

    let handle = WindowHandle::open(key, Instant::now());
    self.registry.insert(handle.clone());

    // Shutdown began after the check above and may already have drained the
    // registry; nothing would flush this window later.
    if self.is_closing() {
      if let Some(registered) = self.registry.remove(handle.key()) {
        registered.detach();
      }
      return WindowHandle::closed(handle.key().clone());
    }

    self.stats.windows_opened.fetch_add(1, Ordering::Relaxed);
    handle
  }

  /// Closes the window and submits its batch. Returns `false` when the
  /// window had already been taken, by the watchdog or by shutdown.
  pub(crate) fn unmark(&self, handle: &WindowHandle) -> bool {
    let Some(handle) = self.registry.remove(handle.key()) else {
      return false;
    };
    let Some(events) = handle.detach() else {
      return false;
    };

    self.stats.windows_completed.fetch_add(1, Ordering::Relaxed);
    self.submit(Batch::new(BatchOrigin::Completed(handle.key().clone()), events));
    true
  }

  /// Submits everything in the unscoped queue as one batch.
  ///
  /// Drains are serialized, and each submits before the next one starts, so
  /// unscoped batches follow queue order.
  pub(crate) fn drain_unscoped(&self) -> usize {
    let _guard = match self.drain_lock.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let events = self.unscoped.drain();
    let drained = events.len();
    if drained > 0 {
      self.submit(Batch::new(BatchOrigin::Unscoped, events));
    }
    drained
  }

  fn flush_open_windows(&self) -> usize {
    let mut flushed = 0;
    for handle in self.registry.drain_all() {
      if let Some(events) = handle.detach() {
        flushed += 1;
        self.submit(Batch::new(BatchOrigin::Shutdown(handle.key().clone()), events));
      }
    }
    self
      .stats
      .windows_flushed_on_shutdown
      .fetch_add(flushed as u64, Ordering::Relaxed);
    flushed
  }
}

/// Handle to a running aggregation pipeline.
///
/// Cheap to clone; all clones drive the same pipeline. Construct one at
/// startup and pass it to the request hook and the logging adapter.
#[derive(Debug, Clone)]
pub struct Aggregator {
  core: Arc<Core>,
  tasks: Arc<Mutex<Vec<Ticker>>>,
}

impl Aggregator {
  /// Starts the flush workers, the watchdog and, in batched mode, the
  /// unscoped drainer.
  ///
  /// ## Errors
  /// Returns [`BatchlogError::Config`] for an invalid configuration and
  /// [`BatchlogError::Io`] if a background thread cannot be started.
  pub fn new(config: Config, sink: Arc<dyn Sink>) -> Result<Self, BatchlogError> {
    config.validate()?;

    let stats = Arc::new(Stats::default());
    let pool = FlushPool::start(config.flush_workers, sink, Arc::clone(&stats))?;
    let core = Arc::new(Core {
      id: NEXT_CORE_ID.fetch_add(1, Ordering::Relaxed),
      config,
      registry: Registry::new(),
      unscoped: UnscopedQueue::new(),
      pool,
      stats,
      closing: AtomicBool::new(false),
      drain_lock: Mutex::new(()),
    });

    let aggregator = Self {
      core,
      tasks: Arc::new(Mutex::new(Vec::new())),
    };

    if let Err(e) = aggregator.spawn_background() {
      aggregator.shutdown();
      return Err(e.into());
    }

    Ok(aggregator)
  }

  /// Like [`Aggregator::new`], and installs `Registry + AggregationLayer` as
  /// the global tracing subscriber.
  ///
  /// A process has one global subscriber, so this succeeds at most once. A
  /// later call fails with [`BatchlogError::SubscriberAlreadySet`] after
  /// shutting down the redundant pipeline it started.
  pub fn init(config: Config, sink: Arc<dyn Sink>) -> Result<Self, BatchlogError> {
    let aggregator = Self::new(config, sink)?;

    let subscriber = tracing_subscriber::Registry::default().with(aggregator.layer());
    if tracing::subscriber::set_global_default(subscriber).is_err() {
      aggregator.shutdown();
      return Err(BatchlogError::SubscriberAlreadySet);
    }

    Ok(aggregator)
  }

  fn spawn_background(&self) -> std::io::Result<()> {
    let watchdog = Watchdog::spawn(Arc::clone(&self.core))?;
    self.push_task(watchdog);

    if self.core.config.unscoped_mode == UnscopedMode::Batched {
      let core = Arc::clone(&self.core);
      let drainer = Ticker::spawn(
        "batchlog-unscoped",
        self.core.config.unscoped_interval(),
        move || {
          core.drain_unscoped();
        },
      )?;
      self.push_task(drainer);
    }

    Ok(())
  }

  fn push_task(&self, task: Ticker) {
    match self.tasks.lock() {
      Ok(mut tasks) => tasks.push(task),
      Err(poisoned) => poisoned.into_inner().push(task),
    }
  }

  /// A tracing layer feeding this aggregator.
  pub fn layer(&self) -> AggregationLayer {
    AggregationLayer::new(Arc::clone(&self.core))
  }

  pub fn config(&self) -> &Config {
    &self.core.config
  }

  /// Opens a new window for the calling request.
  ///
  /// Every call opens an independent window; marking twice for the same
  /// request is a caller error and yields two windows that flush separately.
  /// After shutdown the returned window is already closed and everything
  /// recorded through it is written directly.
  pub fn mark(&self) -> Window {
    Window {
      handle: self.core.mark(),
      core: Arc::clone(&self.core),
      finished: false,
    }
  }

  /// Request hook: opens a window, attaches it to `span`, runs `f` inside
  /// the span and flushes the window afterwards, also when `f` panics.
  pub fn run_in_window<R>(&self, span: Span, f: impl FnOnce(&Window) -> R) -> R {
    let window = self.mark();
    window.attach(&span);
    let result = span.in_scope(|| f(&window));
    window.unmark_and_flush();
    result
  }

  /// Routes an event to `window`, or down the unscoped path when `None`.
  pub fn route(&self, window: Option<&WindowHandle>, event: LogEvent) {
    self.core.route(window, event);
  }

  /// Runs one watchdog pass now.
  pub fn sweep_expired(&self) -> usize {
    Watchdog::sweep(&self.core, Instant::now())
  }

  /// Runs one watchdog pass as if the current time were `now`.
  pub fn sweep_expired_at(&self, now: Instant) -> usize {
    Watchdog::sweep(&self.core, now)
  }

  /// Flushes the unscoped queue now; returns how many events it held.
  pub fn drain_unscoped(&self) -> usize {
    self.core.drain_unscoped()
  }

  pub fn open_windows(&self) -> usize {
    self.core.registry.len()
  }

  pub fn is_open(&self, key: &WindowKey) -> bool {
    self.core.registry.contains(key)
  }

  pub fn stats(&self) -> StatsSnapshot {
    self.core.stats.snapshot()
  }

  /// `true` from the moment [`Aggregator::shutdown`] begins.
  pub fn is_shut_down(&self) -> bool {
    self.core.is_closing()
  }

  /// Stops background tasks, closes the flush pool and writes whatever is
  /// still buffered.
  ///
  /// The configured [`ShutdownPolicy`](crate::flush::ShutdownPolicy) only
  /// applies to batches already queued when shutdown begins. Open windows
  /// and the unscoped queue are written directly afterwards, open windows as
  /// `Shutdown` batches; their owners' later unmark is a no-op. Idempotent.
  pub fn shutdown(&self) {
    if self.core.closing.swap(true, Ordering::SeqCst) {
      return;
    }

    let tasks = match self.tasks.lock() {
      Ok(mut guard) => std::mem::take(&mut *guard),
      Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    };
    for mut task in tasks {
      task.stop();
    }

    let policy = self.core.config.shutdown_policy;
    self.core.pool.close(policy);
    self.core.drain_unscoped();
    self.core.flush_open_windows();
    self.core.pool.shutdown(policy);
  }
}

/// An open buffering window, owned by the request that marked it.
///
/// Dropping the window unmarks it, so a request hook that keeps the window
/// on its stack flushes on every exit path, including unwinding.
#[derive(Debug)]
pub struct Window {
  handle: WindowHandle,
  core: Arc<Core>,
  finished: bool,
}

impl Window {
  pub fn key(&self) -> &WindowKey {
    self.handle.key()
  }

  /// Id of the aggregator that opened this window.
  pub(crate) fn owner(&self) -> u64 {
    self.core.id
  }

  /// The context-local handle, for code that routes events itself.
  pub fn handle(&self) -> &WindowHandle {
    &self.handle
  }

  /// Routes an event into this window.
  pub fn record(&self, event: LogEvent) {
    self.core.route(Some(&self.handle), event);
  }

  /// Whether the buffer still accepts events. Turns `false` on unmark, on
  /// watchdog eviction and on shutdown.
  pub fn is_open(&self) -> bool {
    !self.handle.is_detached()
  }

  /// Closes the window and submits its events as one batch.
  ///
  /// Returns `false` when the watchdog (or shutdown) got there first; the
  /// events were flushed then and nothing is submitted twice.
  pub fn unmark_and_flush(mut self) -> bool {
    self.finish()
  }

  fn finish(&mut self) -> bool {
    if std::mem::replace(&mut self.finished, true) {
      return false;
    }
    self.core.unmark(&self.handle)
  }
}

impl Drop for Window {
  fn drop(&mut self) {
    self.finish();
  }
}
