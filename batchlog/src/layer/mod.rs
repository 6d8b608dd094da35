//! # Layer Module
//!
//! Connects the aggregator to the `tracing` ecosystem. [`AggregationLayer`]
//! captures every event into a [`LogEvent`] and routes it to the window of
//! the innermost enclosing span that carries one.
//!
//! Windows are found through span extensions rather than thread-local state,
//! so a request that moves between threads, or a future instrumented with
//! the request span, keeps logging into its own window.
//!
//! Several aggregators may share one registry, each through its own layer.
//! A span keeps one window slot per aggregator, and each layer only routes
//! into windows its aggregator opened.
//!
//! ```rust,ignore
//! let aggregator = Aggregator::init(Config::default(), Arc::new(StdoutSink::default()))?;
//!
//! aggregator.run_in_window(tracing::info_span!("request", path = "/login"), |_window| {
//!   tracing::info!("authenticating");   // buffered
//! });                                   // flushed here as one batch
//!
//! tracing::info!("background job");     // unscoped
//! ```


use std::fmt::Write as _;
use std::sync::Arc;

use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id, Record};
use tracing::{Event as TracingEvent, Span, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use crate::aggregator::{Core, Window};
use crate::event::{LogEvent, LogLevel};
use crate::window::WindowHandle;

/// Tracing layer that feeds an [`Aggregator`](crate::aggregator::Aggregator).
#[derive(Clone)]
pub struct AggregationLayer {
  core: Arc<Core>,
}

impl std::fmt::Debug for AggregationLayer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("AggregationLayer").finish_non_exhaustive()
  }
}

impl AggregationLayer {
  pub(crate) fn new(core: Arc<Core>) -> Self {
    Self { core }
  }
}

/// Span fields, rendered once when the span is created or recorded.
#[derive(Debug, Default)]
struct SpanFields(Vec<(String, String)>);

/// Windows attached to a span, keyed by the owning aggregator's id.
#[derive(Debug, Default)]
struct SpanWindows(Vec<(u64, WindowHandle)>);

impl SpanWindows {
  fn get(&self, owner: u64) -> Option<&WindowHandle> {
    self
      .0
      .iter()
      .find(|(id, _)| *id == owner)
      .map(|(_, handle)| handle)
  }

  fn set(&mut self, owner: u64, handle: WindowHandle) {
    match self.0.iter_mut().find(|(id, _)| *id == owner) {
      Some(slot) => slot.1 = handle,
      None => self.0.push((owner, handle)),
    }
  }
}

impl<S> Layer<S> for AggregationLayer
where
  S: Subscriber + for<'a> LookupSpan<'a>,
{
  fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
    let Some(span) = ctx.span(id) else {
      return;
    };
    let mut visitor = FieldVisitor::default();
    attrs.record(&mut visitor);
    // Another aggregation layer on the same registry may have stored them
    span.extensions_mut().replace(SpanFields(visitor.fields));
  }

  fn on_record(&self, id: &Id, values: &Record<'_>, ctx: Context<'_, S>) {
    let Some(span) = ctx.span(id) else {
      return;
    };
    let mut visitor = FieldVisitor::default();
    values.record(&mut visitor);

    let mut extensions = span.extensions_mut();
    match extensions.get_mut::<SpanFields>() {
      Some(existing) => {
        for (key, value) in visitor.fields {
          match existing.0.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => existing.0.push((key, value)),
          }
        }
      },
      None => extensions.insert(SpanFields(visitor.fields)),
    }
  }

  fn on_event(&self, event: &TracingEvent<'_>, ctx: Context<'_, S>) {
    let metadata = event.metadata();

    let mut visitor = FieldVisitor::default();
    event.record(&mut visitor);

    let mut window: Option<WindowHandle> = None;
    let mut context = Vec::new();
    if let Some(scope) = ctx.event_scope(event) {
      // root first, so the innermost window wins
      for span in scope.from_root() {
        let extensions = span.extensions();
        if let Some(fields) = extensions.get::<SpanFields>() {
          context.extend(fields.0.iter().cloned());
        }
        if let Some(handle) = extensions
          .get::<SpanWindows>()
          .and_then(|windows| windows.get(self.core.id))
        {
          window = Some(handle.clone());
        }
      }
    }

    let mut captured = LogEvent::new(
      LogLevel::from(metadata.level()),
      metadata.target(),
      visitor.message.unwrap_or_default(),
    )
    .with_location(metadata.module_path(), metadata.file(), metadata.line());
    captured.fields = visitor.fields;
    captured.context = context;
    captured.error = visitor.error;

    self.core.route(window.as_ref(), captured);
  }
}

/// Collects the message, an `error` field and all other fields as strings.
#[derive(Default)]
struct FieldVisitor {
  message: Option<String>,
  error: Option<String>,
  fields: Vec<(String, String)>,
}

impl FieldVisitor {
  fn put(&mut self, field: &Field, value: String) {
    match field.name() {
      "message" => self.message = Some(value),
      "error" => self.error = Some(value),
      name => self.fields.push((name.to_string(), value)),
    }
  }
}

impl Visit for FieldVisitor {
  fn record_str(&mut self, field: &Field, value: &str) {
    self.put(field, value.to_string());
  }

  fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
    let mut rendered = value.to_string();
    let mut source = value.source();
    while let Some(cause) = source {
      let _ = write!(rendered, ": {}", cause);
      source = cause.source();
    }
    self.put(field, rendered);
  }

  fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
    self.put(field, format!("{:?}", value));
  }
}

impl Window {
  /// Attaches this window to `span`, so events emitted inside the span are
  /// buffered here.
  ///
  /// Returns `false` when the span is disabled or its subscriber is not
  /// built on [`tracing_subscriber::Registry`]; events then take the
  /// unscoped path.
  pub fn attach(&self, span: &Span) -> bool {
    let owner = self.owner();
    let handle = self.handle().clone();
    span
      .with_subscriber(|(id, dispatch)| {
        let Some(registry) = dispatch.downcast_ref::<tracing_subscriber::Registry>() else {
          return false;
        };
        let Some(data) = registry.span(id) else {
          return false;
        };
        let mut extensions = data.extensions_mut();
        match extensions.get_mut::<SpanWindows>() {
          Some(windows) => windows.set(owner, handle),
          None => extensions.insert(SpanWindows(vec![(owner, handle)])),
        }
        true
      })
      .unwrap_or(false)
  }
}
