//! Fixed-capacity FIFO mailbox for live game text.
//!
//! When the mailbox is full, pushing a new line silently evicts the oldest
//! line from the front. Memory usage is bounded at `capacity` entries
//! regardless of how far behind the consumer falls.
//!
//! # Usage in the runtime
//!
//! Every script owns three mailboxes (downstream input, upstream echo and
//! out-of-band "unique" input). Distribution pushes into them from the
//! session thread; the owning script pops from its worker thread, either
//! blocking with a deadline or returning immediately.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::lock;

/// Bounded, drop-oldest, multi-producer queue.
#[derive(Debug)]
pub struct Mailbox<T> {
    buf: Mutex<VecDeque<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T> Mailbox<T> {
    /// Create a new mailbox holding at most `capacity` entries.
    ///
    /// # Panics
    ///
    /// Panics if `capacity == 0`.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Mailbox capacity must be > 0");
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            ready: Condvar::new(),
            capacity,
        }
    }

    /// Append an entry, evicting the oldest one if the mailbox is full.
    ///
    /// Returns `true` if an entry was evicted.
    pub fn push(&self, item: T) -> bool {
        let mut buf = lock(&self.buf);
        let evicted = if buf.len() >= self.capacity {
            buf.pop_front();
            true
        } else {
            false
        };
        buf.push_back(item);
        drop(buf);
        self.ready.notify_all();
        evicted
    }

    /// Remove the oldest entry without blocking.
    pub fn try_pop(&self) -> Option<T> {
        lock(&self.buf).pop_front()
    }

    /// Remove the oldest entry, waiting up to `timeout` for one to arrive.
    ///
    /// Returns `None` once the deadline passes with the mailbox still empty.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut buf = lock(&self.buf);
        loop {
            if let Some(item) = buf.pop_front() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            buf = match self.ready.wait_timeout(buf, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Discard all buffered entries.
    pub fn clear(&self) {
        lock(&self.buf).clear();
    }

    /// Current number of buffered entries.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.buf).len()
    }

    /// True if nothing is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.buf).is_empty()
    }

    /// Configured maximum capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> Mailbox<T> {
    /// Copy of all buffered entries, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<T> {
        lock(&self.buf).iter().cloned().collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = Mailbox::<String>::new(0);
    }

    #[test]
    fn test_keeps_last_n_in_order() {
        for capacity in 1..6 {
            for extra in 0..6 {
                let mb = Mailbox::new(capacity);
                let total = capacity + extra;
                for i in 0..total {
                    mb.push(i);
                }
                let expected: Vec<usize> = (extra..total).collect();
                assert_eq!(mb.snapshot(), expected, "capacity {capacity}, extra {extra}");
            }
        }
    }

    #[test]
    fn test_push_reports_eviction() {
        let mb = Mailbox::new(2);
        assert!(!mb.push("a"));
        assert!(!mb.push("b"));
        assert!(mb.push("c"));
        assert_eq!(mb.try_pop(), Some("b"));
    }

    #[test]
    fn test_try_pop_on_empty_returns_none() {
        let mb = Mailbox::<u8>::new(4);
        assert_eq!(mb.try_pop(), None);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let mb = Mailbox::<u8>::new(4);
        let start = Instant::now();
        assert_eq!(mb.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_pop_timeout_wakes_on_push() {
        let mb = Arc::new(Mailbox::new(4));
        let producer = Arc::clone(&mb);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            producer.push("line".to_string());
        });
        let got = mb.pop_timeout(Duration::from_secs(2));
        handle.join().unwrap();
        assert_eq!(got.as_deref(), Some("line"));
    }

    #[test]
    fn test_clear() {
        let mb = Mailbox::new(3);
        mb.push(1);
        mb.push(2);
        mb.clear();
        assert!(mb.is_empty());
        assert_eq!(mb.capacity(), 3);
    }
}
