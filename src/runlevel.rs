//! Cross-process runlevel barrier (component J).
//!
//! Grounded in `local/tekkotsu/SharedGlobals.h`'s `runlevel_t` enum and
//! `level_count` array: every process advances monotonically through the
//! same seven ordered phases, and a process only proceeds past a phase once
//! every other process it's waiting on has reached it too. The `CREATED`
//! counter is special: it's pre-incremented before a process is even
//! spawned, so peers waiting on `CREATED==expected` know how many processes
//! to expect in total.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::mutex::RecursiveCrossProcMutex;
use crate::process::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Runlevel {
  Created = 0,
  Constructing = 1,
  Starting = 2,
  Running = 3,
  Stopping = 4,
  Destructing = 5,
  Destructed = 6,
}

impl Default for Runlevel {
  fn default() -> Self {
    Runlevel::Running
  }
}

impl Runlevel {
  pub const COUNT: usize = 7;
  pub const ALL: [Runlevel; Self::COUNT] = [
    Runlevel::Created,
    Runlevel::Constructing,
    Runlevel::Starting,
    Runlevel::Running,
    Runlevel::Stopping,
    Runlevel::Destructing,
    Runlevel::Destructed,
  ];

  pub fn name(self) -> &'static str {
    match self {
      Runlevel::Created => "CREATED",
      Runlevel::Constructing => "CONSTRUCTING",
      Runlevel::Starting => "STARTING",
      Runlevel::Running => "RUNNING",
      Runlevel::Stopping => "STOPPING",
      Runlevel::Destructing => "DESTRUCTING",
      Runlevel::Destructed => "DESTRUCTED",
    }
  }

  fn index(self) -> usize {
    self as usize
  }
}

/// Counters live in what would be a shared region in the original; here
/// they're plain atomics behind `RunlevelBarrier`'s own
/// `RecursiveCrossProcMutex`, which is how the original serialises
/// increments against `level_count` under its own lock.
pub struct RunlevelBarrier<'a> {
  counts: [AtomicU32; Runlevel::COUNT],
  lock: RecursiveCrossProcMutex<'a>,
  poll_interval: Duration,
}

impl<'a> RunlevelBarrier<'a> {
  pub fn new(semgr: &'a crate::semaphore::SemaphoreSet) -> Option<Self> {
    let lock = RecursiveCrossProcMutex::new(semgr, crate::cancel::CancelToken::new())?;
    Some(RunlevelBarrier {
      counts: Default::default(),
      lock,
      poll_interval: Duration::from_millis(75),
    })
  }

  /// Pre-increments `CREATED` before a process is spawned, so peers waiting
  /// on the total process count see it grow.
  pub fn reserve_created(&self) {
    let _g = self.lock.lock(ProcessId::current().index() as i64);
    self.counts[Runlevel::Created.index()].fetch_add(1, Ordering::SeqCst);
  }

  pub fn count(&self, level: Runlevel) -> u32 {
    self.counts[level.index()].load(Ordering::SeqCst)
  }

  /// Advances the calling process into `level`: increments that level's
  /// counter, then busy-waits (coarse sleep) until it equals the `CREATED`
  /// total, meaning every expected process has reached at least this level.
  pub fn enter(&self, level: Runlevel) {
    {
      let _g = self.lock.lock(ProcessId::current().index() as i64);
      self.counts[level.index()].fetch_add(1, Ordering::SeqCst);
    }
    let expected = self.count(Runlevel::Created);
    while self.count(level) < expected {
      debug!("{:?} waiting at runlevel {} ({}/{})", ProcessId::current(), level.name(), self.count(level), expected);
      std::thread::sleep(self.poll_interval);
    }
  }
}
