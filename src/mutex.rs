//! Recursive cross-process mutex (component C).
//!
//! Grounded in `IPC/MutexLock.h`'s semaphore-backed specialisation: a single
//! [`SemaphoreSet`] counter, initialised to zero, doubles as both the lock
//! and its own recursion depth — `getValue(sem)` *is* the current recursion
//! level. Unlike the original's thread-based fallback (no semaphore
//! manager available yet), this port only implements the IPC-backed variant,
//! since every logical process in this crate always has a live
//! `SemaphoreSet` before any mutex is constructed.

use std::sync::atomic::{AtomicI64, Ordering};

use log::warn;

use crate::cancel::CancelToken;
use crate::process::ProcessId;
use crate::semaphore::{SemId, SemaphoreSet};

/// Sentinel meaning "unlocked".
pub const NO_OWNER: i64 = -1;

/// A recursive lock built on one semaphore counter of a [`SemaphoreSet`].
/// `lock(pid)`/`try_lock(pid)` take a caller-supplied owner id (in this
/// crate, always `ProcessId::current().index()` cast to `i64`, but the
/// original allows any process-specific value) rather than comparing
/// against `ProcessId` directly, matching the original's `int id` param.
pub struct RecursiveCrossProcMutex<'a> {
  semgr: &'a SemaphoreSet,
  sem: SemId,
  owner: AtomicI64,
  owner_thread: std::sync::Mutex<Option<std::thread::ThreadId>>,
  cancel: CancelToken,
}

impl<'a> RecursiveCrossProcMutex<'a> {
  pub fn new(semgr: &'a SemaphoreSet, cancel: CancelToken) -> Option<Self> {
    let sem = semgr.get_semaphore();
    if sem == semgr.invalid() {
      return None;
    }
    semgr.set_value(sem, 0);
    Some(RecursiveCrossProcMutex {
      semgr,
      sem,
      owner: AtomicI64::new(NO_OWNER),
      owner_thread: std::sync::Mutex::new(None),
      cancel,
    })
  }

  fn is_owner_thread(&self) -> bool {
    *self.owner_thread.lock().unwrap() == Some(std::thread::current().id())
  }

  pub fn owner(&self) -> i64 {
    self.owner.load(Ordering::SeqCst)
  }

  /// Blocks until the lock is held by `id` on the calling thread. Pushes
  /// one `NoCancelScope` so the calling thread can't be cancelled mid
  /// critical-section; `unlock` pops it.
  pub fn lock(&self, id: i64) -> NoCancelScope<'a, '_> {
    let guard = self.cancel.push_no_cancel();
    self.do_lock(id);
    NoCancelScope { mutex: self, _guard: guard }
  }

  fn do_lock(&self, id: i64) {
    if self.owner.load(Ordering::SeqCst) != id || !self.is_owner_thread() {
      if self.semgr.had_fault() {
        warn!("RecursiveCrossProcMutex assuming lock of {} because its SemaphoreSet faulted", self.sem);
      } else {
        self.semgr.test_zero_add(self.sem, 1, true, true);
      }
      self.owner.store(id, Ordering::SeqCst);
      *self.owner_thread.lock().unwrap() = Some(std::thread::current().id());
    } else if !self.semgr.had_fault() {
      self.semgr.raise(self.sem, 1);
    }
  }

  /// Attempts a non-blocking acquire. The blind-raise-then-check dance
  /// mirrors the original: speculatively raise by one, then check whether
  /// that made us the sole owner; if not, lower it back off.
  pub fn try_lock(&self, id: i64) -> Option<NoCancelScope<'a, '_>> {
    let guard = self.cancel.push_no_cancel();
    if self.semgr.had_fault() {
      self.owner.store(id, Ordering::SeqCst);
      return Some(NoCancelScope { mutex: self, _guard: guard });
    }
    self.semgr.raise(self.sem, 1);
    if self.owner.load(Ordering::SeqCst) == id && self.is_owner_thread() {
      return Some(NoCancelScope { mutex: self, _guard: guard });
    }
    if self.semgr.get_value(self.sem) == 1 {
      self.owner.store(id, Ordering::SeqCst);
      *self.owner_thread.lock().unwrap() = Some(std::thread::current().id());
      return Some(NoCancelScope { mutex: self, _guard: guard });
    }
    if !self.semgr.lower(self.sem, 1, false) {
      warn!("RecursiveCrossProcMutex::try_lock speculative raise vanished unexpectedly");
    }
    None
  }

  fn unlock_once(&self) {
    if self.semgr.had_fault() {
      warn!("RecursiveCrossProcMutex assuming unlock of {} because its SemaphoreSet faulted", self.sem);
      self.owner.store(NO_OWNER, Ordering::SeqCst);
      return;
    }
    if self.owner.load(Ordering::SeqCst) == NO_OWNER || !self.is_owner_thread() {
      warn!("RecursiveCrossProcMutex::unlock called by a thread that doesn't own the lock");
      return;
    }
    let depth = self.semgr.get_value(self.sem);
    if depth == 1 {
      self.owner.store(NO_OWNER, Ordering::SeqCst);
      *self.owner_thread.lock().unwrap() = None;
    } else if depth <= 0 {
      warn!("RecursiveCrossProcMutex::unlock caused underflow");
      self.owner.store(NO_OWNER, Ordering::SeqCst);
    }
    if !self.semgr.lower(self.sem, 1, false) {
      warn!("RecursiveCrossProcMutex::unlock failed to lower its semaphore");
    }
  }

  /// Drains every recursion depth regardless of how many times the lock
  /// was taken. Used only on fault-shutdown paths.
  pub fn release_all(&self) {
    self.owner.store(NO_OWNER, Ordering::SeqCst);
    *self.owner_thread.lock().unwrap() = None;
    if self.semgr.had_fault() {
      return;
    }
    let depth = self.semgr.get_value(self.sem);
    self.semgr.set_value(self.sem, 0);
    for _ in 0..depth.max(0) {
      // matches the original draining one no-cancel scope per depth; this
      // port has no ambient no-cancel stack to drain here since each lock()
      // call owns its own guard.
    }
  }

  pub fn get_lock_level(&self) -> i32 {
    if self.semgr.had_fault() {
      if self.owner.load(Ordering::SeqCst) == NO_OWNER { 0 } else { 1 }
    } else {
      self.semgr.get_value(self.sem)
    }
  }
}

impl Drop for RecursiveCrossProcMutex<'_> {
  fn drop(&mut self) {
    if self.owner.load(Ordering::SeqCst) != NO_OWNER && !self.semgr.had_fault() {
      self.semgr.set_value(self.sem, 0);
    }
    if !self.semgr.had_fault() {
      self.semgr.release_semaphore(self.sem);
    } else {
      warn!("RecursiveCrossProcMutex leaked semaphore {} because its SemaphoreSet faulted", self.sem);
    }
  }
}

/// RAII guard returned by `lock`/`try_lock`; dropping it releases one
/// recursion level.
pub struct NoCancelScope<'a, 'b> {
  mutex: &'b RecursiveCrossProcMutex<'a>,
  _guard: crate::cancel::NoCancelScope,
}

impl Drop for NoCancelScope<'_, '_> {
  fn drop(&mut self) {
    self.mutex.unlock_once();
  }
}

/// Convenience matching `lock(ProcessID::getID())` in the original.
pub fn lock_as_current<'a, 'b>(mutex: &'b RecursiveCrossProcMutex<'a>) -> NoCancelScope<'a, 'b> {
  mutex.lock(ProcessId::current().index() as i64)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn recursive_lock_nests_and_unwinds() {
    let set = SemaphoreSet::new(4).unwrap();
    let mtx = RecursiveCrossProcMutex::new(&set, CancelToken::new()).unwrap();
    let g1 = mtx.lock(1);
    assert_eq!(mtx.get_lock_level(), 1);
    let g2 = mtx.lock(1);
    assert_eq!(mtx.get_lock_level(), 2);
    drop(g2);
    assert_eq!(mtx.get_lock_level(), 1);
    drop(g1);
    assert_eq!(mtx.get_lock_level(), 0);
    assert_eq!(mtx.owner(), NO_OWNER);
  }

  #[test]
  fn try_lock_fails_when_other_owner_holds() {
    let set = SemaphoreSet::new(4).unwrap();
    let mtx = RecursiveCrossProcMutex::new(&set, CancelToken::new()).unwrap();
    let _g1 = mtx.lock(1);
    assert!(mtx.try_lock(2).is_none());
  }
}
