
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::utils::current_thread_label;

/// Defines the severity or importance level of an event.
///
/// The levels are ordered from the most detailed to the most severe:
/// `Trace < Debug < Info < Warn < Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
  /// Very detailed information, mostly useful for debugging
  Trace,
  /// Debug-level information, used for development or troubleshooting
  Debug,
  /// General informational messages, typically useful in production
  Info,
  /// Warning messages that indicate potential issues
  Warn,
  /// Error messages that indicate a failure or critical problem
  Error,
}

impl LogLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      LogLevel::Trace => "TRACE",
      LogLevel::Debug => "DEBUG",
      LogLevel::Info => "INFO",
      LogLevel::Warn => "WARN",
      LogLevel::Error => "ERROR",
    }
  }
}

impl From<&tracing::Level> for LogLevel {
  fn from(level: &tracing::Level) -> Self {
    match *level {
      tracing::Level::TRACE => LogLevel::Trace,
      tracing::Level::DEBUG => LogLevel::Debug,
      tracing::Level::INFO => LogLevel::Info,
      tracing::Level::WARN => LogLevel::Warn,
      tracing::Level::ERROR => LogLevel::Error,
    }
  }
}

impl std::fmt::Display for LogLevel {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// One captured log call.
///
/// A `LogEvent` holds everything a sink needs to render the line later. The
/// values are taken when the event is built, on the emitting thread: by the
/// time a flush worker writes the event the originating request may be gone,
/// and the thread label or span context would otherwise be wrong.
///
/// # Example
///
/// ```rust
/// use batchlog::event::{LogEvent, LogLevel};
///
/// let event = LogEvent::new(LogLevel::Info, "auth", "user logged in")
///   .with_field("user_id", "42");
///
/// assert_eq!(event.level, LogLevel::Info);
/// assert_eq!(event.fields, vec![("user_id".to_string(), "42".to_string())]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
  /// Milliseconds since the Unix epoch at capture time.
  pub timestamp: u64,

  pub level: LogLevel,

  /// Logger name; for tracing events this is the event target.
  pub target: String,

  /// The fully rendered message.
  pub message: String,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub module_path: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub file: Option<String>,

  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub line: Option<u32>,

  /// Label of the thread that emitted the event.
  pub thread: String,

  /// Structured fields attached to the event itself.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub fields: Vec<(String, String)>,

  /// Diagnostic context inherited from enclosing spans, outermost first.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub context: Vec<(String, String)>,

  /// Rendered error attached to the event, including its source chain.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub error: Option<String>,
}

impl LogEvent {
  /// Captures a new event on the current thread with the current time.
  pub fn new(level: LogLevel, target: impl Into<String>, message: impl Into<String>) -> Self {
    Self {
      timestamp: Utc::now().timestamp_millis() as u64,
      level,
      target: target.into(),
      message: message.into(),
      module_path: None,
      file: None,
      line: None,
      thread: current_thread_label(),
      fields: Vec::new(),
      context: Vec::new(),
      error: None,
    }
  }

  pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.fields.push((key.into(), value.into()));
    self
  }

  pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.context.push((key.into(), value.into()));
    self
  }

  pub fn with_error(mut self, error: impl Into<String>) -> Self {
    self.error = Some(error.into());
    self
  }

  pub fn with_location(
    mut self,
    module_path: Option<&str>,
    file: Option<&str>,
    line: Option<u32>,
  ) -> Self {
    self.module_path = module_path.map(str::to_owned);
    self.file = file.map(str::to_owned);
    self.line = line;
    self
  }

  /// Serializes the event into a single JSON line.
  ///
  /// Every field is a plain string or integer, so serialization cannot fail
  /// in practice; should it ever, the error text is returned in place of the
  /// line rather than losing the write.
  pub fn serialize(&self) -> String {
    serde_json::to_string(self).unwrap_or_else(|e| format!("{{\"serialize_error\":\"{}\"}}", e))
  }

  /// Parses an event previously produced by [`LogEvent::serialize`].
  pub fn deserialize(json: &str) -> Result<Self, serde_json::Error> {
    serde_json::from_str(json)
  }

  /// Renders the event as `[LEVEL] target: message` followed by any context,
  /// fields and error, without a trailing newline.
  pub fn render_text(&self, out: &mut String) {
    use std::fmt::Write;

    let _ = write!(out, "[{}] {}: {}", self.level.as_str(), self.target, self.message);
    for (key, value) in self.context.iter().chain(self.fields.iter()) {
      let _ = write!(out, " {}={}", key, value);
    }
    if let Some(error) = &self.error {
      let _ = write!(out, " error=\"{}\"", error);
    }
  }
}

impl std::fmt::Display for LogEvent {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let mut line = String::with_capacity(64 + self.message.len());
    self.render_text(&mut line);
    f.write_str(&line)
  }
}
