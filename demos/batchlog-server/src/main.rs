// demos/batchlog-server
//
// Simulated request server: a handful of worker threads handle requests,
// each inside its own window, while background chatter logs unscoped.
// One request hangs past the watch timeout to show the watchdog flush.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use batchlog::flush::ShutdownPolicy;
use batchlog::unscoped::UnscopedMode;
use batchlog::{Aggregator, BatchlogError, Config, FileSink, Format, Sink, StdoutSink};
use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, info_span, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModeArg {
  Immediate,
  Batched,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum FormatArg {
  Text,
  Json,
}

/// batchlog demo server - simulated requests with per-request log batches
#[derive(Parser, Debug)]
#[command(name = "batchlog-server")]
struct Args {
  /// JSON config file; flags below override it
  #[arg(long, env = "BATCHLOG_CONFIG")]
  config: Option<PathBuf>,

  /// Seconds a window may stay open before the watchdog flushes it
  #[arg(long, env = "BATCHLOG_WATCH_TIMEOUT_SECS")]
  watch_timeout_secs: Option<u64>,

  /// How events outside any request are flushed
  #[arg(long, value_enum, env = "BATCHLOG_UNSCOPED_MODE")]
  unscoped_mode: Option<ModeArg>,

  /// Drain interval for batched unscoped events, in milliseconds
  #[arg(long, env = "BATCHLOG_UNSCOPED_INTERVAL_MS")]
  unscoped_interval_ms: Option<u64>,

  /// Number of flush worker threads
  #[arg(long, env = "BATCHLOG_FLUSH_WORKERS")]
  flush_workers: Option<usize>,

  /// Drop queued batches on exit instead of writing them
  #[arg(long)]
  discard_on_exit: bool,

  /// Output line format
  #[arg(long, value_enum, default_value = "text")]
  format: FormatArg,

  /// Write to this file instead of stdout
  #[arg(long, env = "BATCHLOG_LOG_FILE")]
  log_file: Option<PathBuf>,

  /// Simulated worker threads
  #[arg(long, default_value_t = 4)]
  workers: u32,

  /// Requests handled by each worker
  #[arg(long, default_value_t = 5)]
  requests: u32,

  /// Skip the request that hangs past the watch timeout
  #[arg(long)]
  no_stuck_request: bool,
}

impl Args {
  fn config(&self) -> Result<Config, BatchlogError> {
    let mut config = match &self.config {
      Some(path) => Config::from_path(path)?,
      None => Config::default(),
    };
    if let Some(secs) = self.watch_timeout_secs {
      config = config.with_watch_timeout_secs(secs);
    }
    if let Some(mode) = self.unscoped_mode {
      config = config.with_unscoped_mode(match mode {
        ModeArg::Immediate => UnscopedMode::Immediate,
        ModeArg::Batched => UnscopedMode::Batched,
      });
    }
    if let Some(ms) = self.unscoped_interval_ms {
      config = config.with_unscoped_interval_ms(ms);
    }
    if let Some(workers) = self.flush_workers {
      config = config.with_flush_workers(workers);
    }
    if self.discard_on_exit {
      config = config.with_shutdown_policy(ShutdownPolicy::Discard);
    }
    Ok(config)
  }

  fn sink(&self) -> Result<Arc<dyn Sink>, BatchlogError> {
    let format = match self.format {
      FormatArg::Text => Format::Text,
      FormatArg::Json => Format::Json,
    };
    Ok(match &self.log_file {
      Some(path) => Arc::new(FileSink::new(path, format)?),
      None => Arc::new(StdoutSink::new(format)),
    })
  }
}

fn handle_request(aggregator: &Aggregator, worker: u32, request_id: u32) -> u16 {
  let path = match request_id % 4 {
    0 => "/api/users",
    1 => "/api/auth",
    2 => "/api/health",
    _ => "/api/orders",
  };
  let span = info_span!("request", worker, request_id, path);

  aggregator.run_in_window(span, |_window| {
    debug!("processing request");
    let status = match path {
      "/api/users" => {
        info!(user_id = request_id * 3, "fetching user");
        thread::sleep(Duration::from_millis(5));
        200
      },
      "/api/auth" if request_id % 7 == 0 => {
        error!("invalid credentials");
        401
      },
      "/api/auth" => {
        info!("authenticated");
        200
      },
      "/api/health" => 200,
      _ => {
        warn!("order service slow");
        thread::sleep(Duration::from_millis(15));
        503
      },
    };
    info!(status, "request completed");
    status
  })
}

fn run(args: Args) -> Result<(), BatchlogError> {
  let config = args.config()?;
  let aggregator = Aggregator::init(config.clone(), args.sink()?)?;

  info!(
    workers = args.workers,
    watch_timeout_secs = config.watch_timeout_secs,
    "server starting"
  );

  let stuck = if args.no_stuck_request {
    None
  } else {
    let aggregator = aggregator.clone();
    Some(thread::spawn(move || {
      let window = aggregator.mark();
      let span = info_span!("request", path = "/api/export");
      window.attach(&span);
      span.in_scope(|| info!("export started"));
      // hangs past the watch timeout; the watchdog flushes what it has
      thread::sleep(aggregator.config().watch_timeout() * 2 + Duration::from_millis(200));
      span.in_scope(|| info!("export finished"));
      window.unmark_and_flush();
    }))
  };

  let handles: Vec<_> = (0..args.workers)
    .map(|worker| {
      let aggregator = aggregator.clone();
      let requests = args.requests;
      thread::Builder::new()
        .name(format!("http-worker-{}", worker))
        .spawn(move || {
          for n in 0..requests {
            handle_request(&aggregator, worker, worker * requests + n);
            info!(worker, "idle");
            thread::sleep(Duration::from_millis(10));
          }
        })
    })
    .collect::<Result<_, _>>()?;

  for handle in handles {
    if handle.join().is_err() {
      eprintln!("[Demo] worker thread panicked");
    }
  }
  if let Some(stuck) = stuck {
    if stuck.join().is_err() {
      eprintln!("[Demo] stuck request thread panicked");
    }
  }

  info!("server shutting down");
  aggregator.shutdown();

  let stats = aggregator.stats();
  eprintln!(
    "[Demo] windows completed={} evicted={} unscoped={} late={} written={} failures={}",
    stats.windows_completed,
    stats.windows_evicted,
    stats.unscoped_events,
    stats.late_events,
    stats.events_written,
    stats.write_failures,
  );
  Ok(())
}

fn main() {
  let args = Args::parse();
  if let Err(err) = run(args) {
    eprintln!("[Demo] {}", err);
    std::process::exit(1);
  }
}
