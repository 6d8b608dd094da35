//! # Window Module
//!
//! A *window* is the buffering interval of one request: it opens when the
//! request hook marks the execution context and closes when the hook unmarks
//! it, or when the watchdog decides the request has been running too long.
//!
//! ## Pieces
//!
//! - [`WindowKey`]: unique identity of one window
//! - [`WindowHandle`]: the context-local handle a request carries around; it
//!   owns the ordered event buffer
//! - [`Registry`]: every window that is still open, keyed by [`WindowKey`],
//!   together with the instant it was opened
//!
//! ## Exactly-once detachment
//!
//! A window can be closed by two parties racing each other: the request that
//! owns it and the watchdog. Both go through [`Registry::remove`], which is a
//! single remove-if-present under the registry lock, so exactly one of them
//! gets the handle back and flushes it. The buffer itself is sealed on
//! [`WindowHandle::detach`]; appends that arrive after that are handed back to
//! the caller instead of being stored in a buffer nobody will read again.

mod __test__;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::event::LogEvent;
use crate::utils::current_thread_label;

/// Process-wide window sequence. Starts at 1 so 0 never names a window.
static NEXT_WINDOW_SEQ: AtomicU64 = AtomicU64::new(1);

/// Identity of one buffering window.
///
/// `seq` comes from a strictly increasing process-wide counter, which alone
/// makes keys unique. `opened_at` and `worker` are carried for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowKey {
  /// Milliseconds since the Unix epoch when the window was opened.
  pub opened_at: u64,
  /// Label of the thread that opened the window.
  pub worker: String,
  pub seq: u64,
}

impl WindowKey {
  /// Allocates a fresh key for a window opened on the current thread now.
  pub fn next() -> Self {
    Self {
      opened_at: Utc::now().timestamp_millis() as u64,
      worker: current_thread_label(),
      seq: NEXT_WINDOW_SEQ.fetch_add(1, Ordering::Relaxed),
    }
  }
}

impl std::fmt::Display for WindowKey {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}:{}:{}", self.opened_at, self.worker, self.seq)
  }
}

#[derive(Debug)]
enum BufferState {
  Open(Vec<LogEvent>),
  Detached,
}

#[derive(Debug)]
struct WindowBuffer {
  key: WindowKey,
  opened: Instant,
  state: Mutex<BufferState>,
}

/// Context-local handle to one window's buffer.
///
/// Cloning is cheap and every clone refers to the same buffer, which lets
/// the handle ride along in span extensions and across threads when a
/// request hops between workers.
#[derive(Debug, Clone)]
pub struct WindowHandle {
  inner: Arc<WindowBuffer>,
}

impl WindowHandle {
  pub fn open(key: WindowKey, opened: Instant) -> Self {
    Self {
      inner: Arc::new(WindowBuffer {
        key,
        opened,
        state: Mutex::new(BufferState::Open(Vec::new())),
      }),
    }
  }

  /// A handle whose buffer is already detached. Every append is refused.
  pub fn closed(key: WindowKey) -> Self {
    Self {
      inner: Arc::new(WindowBuffer {
        key,
        opened: Instant::now(),
        state: Mutex::new(BufferState::Detached),
      }),
    }
  }

  pub fn key(&self) -> &WindowKey {
    &self.inner.key
  }

  pub fn opened(&self) -> Instant {
    self.inner.opened
  }

  /// Appends an event at the end of the buffer.
  ///
  /// Returns the event back when the window has already been detached.
  pub fn append(&self, event: LogEvent) -> Result<(), LogEvent> {
    let mut state = match self.inner.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match &mut *state {
      BufferState::Open(events) => {
        events.push(event);
        Ok(())
      },
      BufferState::Detached => Err(event),
    }
  }

  /// Seals the buffer and returns its events in append order.
  ///
  /// Only the first call gets `Some`; the buffer refuses appends afterwards.
  pub fn detach(&self) -> Option<Vec<LogEvent>> {
    let mut state = match self.inner.state.lock() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    match std::mem::replace(&mut *state, BufferState::Detached) {
      BufferState::Open(events) => Some(events),
      BufferState::Detached => None,
    }
  }

  pub fn is_detached(&self) -> bool {
    match self.inner.state.lock() {
      Ok(state) => matches!(*state, BufferState::Detached),
      Err(poisoned) => matches!(*poisoned.into_inner(), BufferState::Detached),
    }
  }

  /// Number of buffered events; zero once detached.
  pub fn len(&self) -> usize {
    match self.inner.state.lock() {
      Ok(state) => match &*state {
        BufferState::Open(events) => events.len(),
        BufferState::Detached => 0,
      },
      Err(_) => 0,
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Time the window has been open as of `now`.
  pub fn age(&self, now: Instant) -> Duration {
    now.saturating_duration_since(self.inner.opened)
  }
}

/// The set of open windows.
///
/// The registry is only touched on mark, unmark and watchdog sweeps, never
/// per event: routing goes through the handle the request already holds.
#[derive(Debug, Default)]
pub struct Registry {
  windows: RwLock<HashMap<WindowKey, WindowHandle>>,
}

impl Registry {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn insert(&self, handle: WindowHandle) {
    let mut windows = match self.windows.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    windows.insert(handle.key().clone(), handle);
  }

  /// Removes the window if it is still registered.
  ///
  /// Of any number of concurrent callers for the same key, exactly one
  /// receives `Some`.
  pub fn remove(&self, key: &WindowKey) -> Option<WindowHandle> {
    let mut windows = match self.windows.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    windows.remove(key)
  }

  pub fn contains(&self, key: &WindowKey) -> bool {
    match self.windows.read() {
      Ok(windows) => windows.contains_key(key),
      Err(poisoned) => poisoned.into_inner().contains_key(key),
    }
  }

  pub fn len(&self) -> usize {
    match self.windows.read() {
      Ok(windows) => windows.len(),
      Err(poisoned) => poisoned.into_inner().len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Keys of windows whose age at `now` is strictly greater than `threshold`,
  /// oldest first.
  ///
  /// This is a snapshot: callers still have to win [`Registry::remove`]
  /// before touching a window.
  pub fn expired(&self, now: Instant, threshold: Duration) -> Vec<WindowKey> {
    let windows = match self.windows.read() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut expired: Vec<&WindowHandle> = windows
      .values()
      .filter(|handle| handle.age(now) > threshold)
      .collect();
    expired.sort_by_key(|handle| handle.key().seq);
    expired.into_iter().map(|handle| handle.key().clone()).collect()
  }

  /// Removes every registered window, oldest first.
  pub fn drain_all(&self) -> Vec<WindowHandle> {
    let mut windows = match self.windows.write() {
      Ok(guard) => guard,
      Err(poisoned) => poisoned.into_inner(),
    };
    let mut handles: Vec<WindowHandle> = windows.drain().map(|(_, handle)| handle).collect();
    handles.sort_by_key(|handle| handle.key().seq);
    handles
  }
}
