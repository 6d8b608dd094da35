//! # batchlog
//!
//! Request-scoped log batching. Lines logged while a request is being handled
//! are buffered per request and written as one ordered batch by a background
//! flush worker, so concurrent requests do not interleave line by line at the
//! sink and request threads never wait on log I/O. A watchdog flushes the
//! buffers of requests that run past a timeout.
//!
//! Start with [`aggregator::Aggregator`].

pub mod aggregator;
pub mod config;
pub mod error;
pub mod event;
pub mod flush;
pub mod layer;
pub mod sink;
pub mod stats;
pub mod ticker;
pub mod unscoped;
pub mod utils;
pub mod watchdog;
pub mod window;

pub use aggregator::{Aggregator, Window};
pub use config::Config;
pub use error::BatchlogError;
pub use event::{LogEvent, LogLevel};
pub use layer::AggregationLayer;
pub use sink::{FileSink, Format, MemorySink, Sink, StdoutSink};
