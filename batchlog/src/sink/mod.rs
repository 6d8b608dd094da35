//! # Sink Module
//!
//! The outbound boundary. A [`Sink`] performs the real, slow write of one
//! event; only flush workers (and the fail-closed path after shutdown) call
//! it, so request threads never wait on it.
//!
//! Three implementations ship with the crate:
//!
//! - [`StdoutSink`]: one line per event on stdout
//! - [`FileSink`]: appends to a file, creating parent directories
//! - [`MemorySink`]: keeps events grouped by batch, for tests and demos


use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

use crate::event::LogEvent;
use crate::flush::{BatchInfo, BatchOrigin};

/// Line format used by [`StdoutSink`] and [`FileSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Format {
  /// `[LEVEL] target: message key=value ...`
  #[default]
  Text,
  /// One JSON object per line
  Json,
}

impl Format {
  fn render(&self, event: &LogEvent, out: &mut String) {
    match self {
      Format::Text => event.render_text(out),
      Format::Json => out.push_str(&event.serialize()),
    }
    out.push('\n');
  }
}

/// Destination for flushed events.
///
/// Events of one batch are delivered in order, followed by one
/// [`Sink::end_batch`] call. With more than one flush worker, batches may
/// interleave at the sink.
pub trait Sink: Send + Sync + 'static {
  /// Write a single event. A failure affects only this event; the flush
  /// worker reports it and carries on with the rest of the batch.
  fn write(&self, batch: &BatchInfo, event: &LogEvent) -> io::Result<()>;

  /// Called once after the last event of a batch.
  fn end_batch(&self, _batch: &BatchInfo) -> io::Result<()> {
    Ok(())
  }

  /// Called once when the flush pool starts.
  fn on_start(&self) {}

  /// Called once after the flush pool has stopped.
  fn on_shutdown(&self) {}
}

/// Writes every event as one line on stdout.
#[derive(Debug)]
pub struct StdoutSink {
  format: Format,
  // Reused line buffer
  buffer: Mutex<String>,
}

impl StdoutSink {
  pub fn new(format: Format) -> Self {
    Self {
      format,
      buffer: Mutex::new(String::with_capacity(256)),
    }
  }
}

impl Default for StdoutSink {
  fn default() -> Self {
    Self::new(Format::Text)
  }
}

impl Sink for StdoutSink {
  fn write(&self, _batch: &BatchInfo, event: &LogEvent) -> io::Result<()> {
    let mut buf = self
      .buffer
      .lock()
      .map_err(|_| io::Error::new(io::ErrorKind::Other, "stdout line buffer poisoned"))?;
    buf.clear();
    self.format.render(event, &mut buf);

    // Single write call
    io::stdout().lock().write_all(buf.as_bytes())
  }

  fn end_batch(&self, _batch: &BatchInfo) -> io::Result<()> {
    io::stdout().lock().flush()
  }
}

/// Appends events to a file.
#[derive(Debug)]
pub struct FileSink {
  format: Format,
  buffer: Mutex<String>,
  file: Mutex<std::fs::File>,
}

impl FileSink {
  /// Open (or create if missing) `path` for appending.
  pub fn new(path: impl AsRef<Path>, format: Format) -> io::Result<Self> {
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)?;
      }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;

    Ok(Self {
      format,
      buffer: Mutex::new(String::with_capacity(256)),
      file: Mutex::new(file),
    })
  }
}

impl Sink for FileSink {
  fn write(&self, _batch: &BatchInfo, event: &LogEvent) -> io::Result<()> {
    let mut buf = self
      .buffer
      .lock()
      .map_err(|_| io::Error::new(io::ErrorKind::Other, "file line buffer poisoned"))?;
    buf.clear();
    self.format.render(event, &mut buf);

    let mut file = self
      .file
      .lock()
      .map_err(|_| io::Error::new(io::ErrorKind::Other, "file handle poisoned"))?;
    file.write_all(buf.as_bytes())
  }

  fn end_batch(&self, _batch: &BatchInfo) -> io::Result<()> {
    match self.file.lock() {
      Ok(mut file) => file.flush(),
      Err(_) => Err(io::Error::new(io::ErrorKind::Other, "file handle poisoned")),
    }
  }

  fn on_shutdown(&self) {
    if let Ok(file) = self.file.lock() {
      if let Err(e) = file.sync_all() {
        eprintln!("[FileSink] sync on shutdown failed: {}", e);
      }
    }
  }
}

/// A batch as seen by [`MemorySink`].
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedBatch {
  pub id: u64,
  pub origin: BatchOrigin,
  pub events: Vec<LogEvent>,
  /// Whether `end_batch` has been called for it.
  pub complete: bool,
}

impl RecordedBatch {
  pub fn messages(&self) -> Vec<&str> {
    self.events.iter().map(|e| e.message.as_str()).collect()
  }
}

/// Keeps every written event in memory, grouped by batch id.
#[derive(Debug, Default)]
pub struct MemorySink {
  batches: Mutex<BTreeMap<u64, RecordedBatch>>,
  starts: Mutex<u32>,
  shutdowns: Mutex<u32>,
}

impl MemorySink {
  pub fn new() -> Self {
    Self::default()
  }

  /// All batches seen so far, in submission order.
  pub fn batches(&self) -> Vec<RecordedBatch> {
    match self.batches.lock() {
      Ok(batches) => batches.values().cloned().collect(),
      Err(poisoned) => poisoned.into_inner().values().cloned().collect(),
    }
  }

  /// Every written event, batch by batch.
  pub fn events(&self) -> Vec<LogEvent> {
    self.batches().into_iter().flat_map(|b| b.events).collect()
  }

  pub fn start_count(&self) -> u32 {
    self.starts.lock().map(|n| *n).unwrap_or(0)
  }

  pub fn shutdown_count(&self) -> u32 {
    self.shutdowns.lock().map(|n| *n).unwrap_or(0)
  }
}

impl Sink for MemorySink {
  fn write(&self, batch: &BatchInfo, event: &LogEvent) -> io::Result<()> {
    let mut batches = self
      .batches
      .lock()
      .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?;
    batches
      .entry(batch.id)
      .or_insert_with(|| RecordedBatch {
        id: batch.id,
        origin: batch.origin.clone(),
        events: Vec::with_capacity(batch.len),
        complete: false,
      })
      .events
      .push(event.clone());
    Ok(())
  }

  fn end_batch(&self, batch: &BatchInfo) -> io::Result<()> {
    let mut batches = self
      .batches
      .lock()
      .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?;
    if let Some(recorded) = batches.get_mut(&batch.id) {
      recorded.complete = true;
    }
    Ok(())
  }

  fn on_start(&self) {
    if let Ok(mut n) = self.starts.lock() {
      *n += 1;
    }
  }

  fn on_shutdown(&self) {
    if let Ok(mut n) = self.shutdowns.lock() {
      *n += 1;
    }
  }
}
