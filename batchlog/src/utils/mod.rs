//! # Utils Module
//!
//! Thread identification for captured events and window keys.

/// Label for the current thread: its name when it has one, otherwise a
/// short hash of its `ThreadId`.
pub fn current_thread_label() -> String {
  let thread = std::thread::current();
  match thread.name() {
    Some(name) => name.to_string(),
    None => format!("thread-{:08x}", current_thread_id_u32()),
  }
}

/// Hash of the current `ThreadId`, truncated to 32 bits.
pub(crate) fn current_thread_id_u32() -> u32 {
  use std::collections::hash_map::DefaultHasher;
  use std::hash::{Hash, Hasher};
  let mut hasher = DefaultHasher::new();
  std::thread::current().id().hash(&mut hasher);
  hasher.finish() as u32
}
