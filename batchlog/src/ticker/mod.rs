
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, Sender};

/// A named background thread calling a closure on a fixed interval.
///
/// The task is owned: [`Ticker::stop`] (or dropping the ticker) cancels it
/// and joins the thread, so nothing keeps running after the owner is gone.
/// A tick that panics is reported and the next tick still runs.
#[derive(Debug)]
pub struct Ticker {
  name: String,
  cancel: Option<Sender<()>>,
  handle: Option<JoinHandle<()>>,
}

impl Ticker {
  pub fn spawn<F>(name: &str, interval: Duration, mut tick: F) -> std::io::Result<Self>
  where
    F: FnMut() + Send + 'static,
  {
    // Nothing is ever sent; dropping the sender is the cancellation signal
    let (cancel, cancelled) = crossbeam_channel::bounded::<()>(0);
    let label = name.to_string();

    let handle = thread::Builder::new().name(name.to_string()).spawn(move || loop {
      match cancelled.recv_timeout(interval) {
        Err(RecvTimeoutError::Timeout) => {
          if panic::catch_unwind(AssertUnwindSafe(&mut tick)).is_err() {
            eprintln!("[{}] tick panicked, continuing", label);
          }
        },
        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
      }
    })?;

    Ok(Self {
      name: name.to_string(),
      cancel: Some(cancel),
      handle: Some(handle),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Cancels the task and waits for an in-progress tick to finish.
  pub fn stop(&mut self) {
    drop(self.cancel.take());
    if let Some(handle) = self.handle.take() {
      if handle.join().is_err() {
        eprintln!("[{}] thread exited with a panic", self.name);
      }
    }
  }
}

impl Drop for Ticker {
  fn drop(&mut self) {
    self.stop();
  }
}
