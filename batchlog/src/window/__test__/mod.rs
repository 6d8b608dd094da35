#[cfg(test)]
mod __test__ {

  use crate::event::{LogEvent, LogLevel};
  use crate::window::{Registry, WindowHandle, WindowKey};

  use std::collections::HashSet;
  use std::sync::{Arc, Barrier};
  use std::thread;
  use std::time::{Duration, Instant};

  fn event(message: &str) -> LogEvent {
    LogEvent::new(LogLevel::Info, "test", message)
  }

  #[test]
  fn test_keys_are_unique_across_threads() {
    let handles: Vec<_> = (0..8)
      .map(|_| thread::spawn(|| (0..500).map(|_| WindowKey::next()).collect::<Vec<_>>()))
      .collect();

    let mut seen = HashSet::new();
    for handle in handles {
      for key in handle.join().unwrap() {
        assert!(seen.insert(key.seq), "duplicate window seq {}", key.seq);
      }
    }
    assert_eq!(seen.len(), 8 * 500);
  }

  #[test]
  fn test_key_display() {
    let key = WindowKey {
      opened_at: 1000,
      worker: "w".to_string(),
      seq: 3,
    };
    assert_eq!(key.to_string(), "1000:w:3");
  }

  #[test]
  fn test_append_preserves_order() {
    let handle = WindowHandle::open(WindowKey::next(), Instant::now());
    for i in 0..5 {
      handle.append(event(&format!("e{}", i))).unwrap();
    }
    assert_eq!(handle.len(), 5);

    let events = handle.detach().unwrap();
    let messages: Vec<_> = events.iter().map(|e| e.message.as_str()).collect();
    assert_eq!(messages, vec!["e0", "e1", "e2", "e3", "e4"]);
  }

  #[test]
  fn test_detach_is_exactly_once_and_refuses_appends() {
    let handle = WindowHandle::open(WindowKey::next(), Instant::now());
    handle.append(event("before")).unwrap();

    assert_eq!(handle.detach().map(|e| e.len()), Some(1));
    assert!(handle.detach().is_none());
    assert!(handle.is_detached());

    let refused = handle.append(event("after")).unwrap_err();
    assert_eq!(refused.message, "after");
  }

  #[test]
  fn test_closed_handle_refuses_appends() {
    let handle = WindowHandle::closed(WindowKey::next());
    assert!(handle.append(event("x")).is_err());
    assert!(handle.detach().is_none());
  }

  #[test]
  fn test_registry_remove_single_winner() {
    let registry = Arc::new(Registry::new());
    let handle = WindowHandle::open(WindowKey::next(), Instant::now());
    let key = handle.key().clone();
    registry.insert(handle);

    let barrier = Arc::new(Barrier::new(8));
    let racers: Vec<_> = (0..8)
      .map(|_| {
        let registry = Arc::clone(&registry);
        let barrier = Arc::clone(&barrier);
        let key = key.clone();
        thread::spawn(move || {
          barrier.wait();
          registry.remove(&key).is_some()
        })
      })
      .collect();

    let winners = racers
      .into_iter()
      .map(|r| r.join().unwrap())
      .filter(|won| *won)
      .count();
    assert_eq!(winners, 1);
    assert!(registry.is_empty());
  }

  #[test]
  fn test_registry_expired_is_strict_and_ordered() {
    let registry = Registry::new();
    let start = Instant::now();
    let first = WindowHandle::open(WindowKey::next(), start);
    let second = WindowHandle::open(WindowKey::next(), start + Duration::from_secs(5));
    registry.insert(second.clone());
    registry.insert(first.clone());

    let threshold = Duration::from_secs(10);
    // exactly at the threshold is not expired
    assert!(registry.expired(start + threshold, threshold).is_empty());

    let now = start + Duration::from_secs(16);
    assert_eq!(
      registry.expired(now, threshold),
      vec![first.key().clone(), second.key().clone()]
    );

    let now = start + Duration::from_secs(11);
    assert_eq!(registry.expired(now, threshold), vec![first.key().clone()]);
  }

  #[test]
  fn test_registry_drain_all() {
    let registry = Registry::new();
    for _ in 0..3 {
      registry.insert(WindowHandle::open(WindowKey::next(), Instant::now()));
    }
    assert_eq!(registry.len(), 3);

    let drained = registry.drain_all();
    assert_eq!(drained.len(), 3);
    assert!(drained.windows(2).all(|w| w[0].key().seq < w[1].key().seq));
    assert!(registry.is_empty());
  }
}
