//! Cooperative thread-cancellation scope (supplements component C/G).
//!
//! The original relies on `pthread_setcancelstate`/`pthread_cancel` to keep
//! a thread from being torn down mid-critical-section (`Thread::pushNoCancel`
//! / `popNoCancel`). Rust threads have no native async-cancellation API, so
//! this is realised as a polled [`CancelToken`]: code that would have been a
//! cancellation point in the original instead checks `is_cancelled()` at the
//! same call sites and unwinds itself. `NoCancelScope` still gives every
//! caller the familiar push/pop-per-depth discipline, it just suppresses the
//! poll rather than the delivery of an asynchronous signal.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
pub struct CancelToken {
  requested: Arc<AtomicBool>,
  no_cancel_depth: Arc<AtomicUsize>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Requests cancellation. Has no effect until the holder's
  /// `no_cancel_depth` returns to zero and it next polls.
  pub fn cancel(&self) {
    self.requested.store(true, Ordering::SeqCst);
  }

  /// True if cancellation was requested and no `NoCancelScope` is open.
  pub fn is_cancelled(&self) -> bool {
    self.requested.load(Ordering::SeqCst) && self.no_cancel_depth.load(Ordering::SeqCst) == 0
  }

  pub fn push_no_cancel(&self) -> NoCancelScope {
    self.no_cancel_depth.fetch_add(1, Ordering::SeqCst);
    NoCancelScope { depth: self.no_cancel_depth.clone() }
  }
}

/// Held while inside a critical section that must not observe cancellation.
/// Dropping it (or calling `pop` explicitly) decrements the depth counter.
pub struct NoCancelScope {
  depth: Arc<AtomicUsize>,
}

impl NoCancelScope {
  pub fn pop(self) {
    drop(self);
  }
}

impl Drop for NoCancelScope {
  fn drop(&mut self) {
    self.depth.fetch_sub(1, Ordering::SeqCst);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cancellation_suppressed_while_scope_open() {
    let token = CancelToken::new();
    let scope = token.push_no_cancel();
    token.cancel();
    assert!(!token.is_cancelled());
    scope.pop();
    assert!(token.is_cancelled());
  }
}
