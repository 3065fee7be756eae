//! Logical process identity and launch-mode selection.
//!
//! Grounded in `IPC/ProcessID.h` / `IPC/ProcessID.cc`: the framework divides
//! control across a fixed small set of logical processes, which at launch
//! are realised either as `fork()`ed OS processes sharing mapped memory, or
//! as threads inside one OS process sharing an address space directly. The
//! mode is picked once, before any shared region or semaphore set exists,
//! and never changes afterward.

use std::cell::Cell;
use std::sync::OnceLock;

use log::info;

/// The four logical processes this framework coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProcessId {
  Main = 0,
  Motion = 1,
  Sound = 2,
  Simulator = 3,
}

impl ProcessId {
  /// Total number of logical processes; sized arrays indexed by `ProcessId`
  /// (per-process filters, pid tables, runlevel counters) use this.
  pub const NUM_PROCESSES: usize = 4;

  pub const ALL: [ProcessId; Self::NUM_PROCESSES] =
    [ProcessId::Main, ProcessId::Motion, ProcessId::Sound, ProcessId::Simulator];

  pub fn index(self) -> usize {
    self as usize
  }

  pub fn name(self) -> &'static str {
    match self {
      ProcessId::Main => "Main",
      ProcessId::Motion => "Motion",
      ProcessId::Sound => "Sound",
      ProcessId::Simulator => "Simulator",
    }
  }

  /// Returns the identity of whichever logical process the calling OS
  /// thread/process currently represents. Panics if `assign_current` was
  /// never called on this thread/process — every entry point must call it
  /// before touching any IPC primitive.
  pub fn current() -> ProcessId {
    CURRENT.with(|c| c.get()).expect("ProcessId::assign_current was never called on this thread")
  }

  /// Binds the calling OS thread (in `Threaded` mode, every thread that
  /// touches IPC state in a given logical process must call this) or the
  /// calling OS process (in `Multiprocess` mode, called once right after
  /// `fork`) to `id`.
  pub fn assign_current(id: ProcessId) {
    CURRENT.with(|c| c.set(Some(id)));
  }
}

thread_local! {
  static CURRENT: Cell<Option<ProcessId>> = const { Cell::new(None) };
}

/// Whether logical processes are realised as OS processes or as threads.
/// Fixed at launch, frozen in a `OnceLock`, and never allowed to change
/// after the first shared region is created (see `LaunchMode::set`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
  /// Each logical process is a separate OS process, forked from the main
  /// executable before any shared region exists. Shared state lives in
  /// `mmap(MAP_SHARED)` segments or named System V shared memory.
  Multiprocess,
  /// Each logical process is a thread group inside one OS process. Shared
  /// state is plain heap memory behind `Arc`.
  Threaded,
}

static LAUNCH_MODE: OnceLock<LaunchMode> = OnceLock::new();

impl LaunchMode {
  /// Freezes the launch mode for the lifetime of the program. Must be
  /// called exactly once, before any `Region`/`SemaphoreSet` is
  /// constructed. Subsequent calls are logged and ignored, mirroring the
  /// original's "Multiprocess ... fixed after first read" configuration
  /// note.
  pub fn set(mode: LaunchMode) {
    if LAUNCH_MODE.set(mode).is_err() {
      log::warn!("LaunchMode::set({mode:?}) ignored: launch mode was already fixed to {:?}", LAUNCH_MODE.get());
    } else {
      info!("launch mode fixed to {mode:?}");
    }
  }

  /// Reads the frozen launch mode. Defaults to `Threaded` if nothing ever
  /// called `set` (convenient for unit tests exercising a single module in
  /// isolation).
  pub fn get() -> LaunchMode {
    *LAUNCH_MODE.get_or_init(|| LaunchMode::Threaded)
  }

  pub fn is_multiprocess() -> bool {
    Self::get() == LaunchMode::Multiprocess
  }
}

/// Spawns `body` as the logical process `id`, either by `fork()` (in
/// `Multiprocess` mode) or as a named OS thread (`Threaded` mode), and binds
/// `ProcessId::current()` inside it before `body` runs.
///
/// Returns a `Handle` describing however the child ended up represented, so
/// callers can wait on it at shutdown.
pub enum Handle {
  Forked(libc::pid_t),
  Threaded(std::thread::JoinHandle<()>),
}

impl Handle {
  /// Blocks until the child has exited/finished. For `Forked`, this is
  /// `waitpid`; for `Threaded`, `JoinHandle::join`.
  pub fn join(self) {
    match self {
      Handle::Forked(pid) => {
        let mut status: libc::c_int = 0;
        // SAFETY: pid was returned by a successful fork() in this process.
        unsafe {
          libc::waitpid(pid, &mut status, 0);
        }
      }
      Handle::Threaded(h) => {
        let _ = h.join();
      }
    }
  }
}

pub fn spawn_process<F>(id: ProcessId, body: F) -> Handle
where
  F: FnOnce() + Send + 'static,
{
  match LaunchMode::get() {
    LaunchMode::Multiprocess => {
      // SAFETY: fork() is safe to call here; the child immediately binds
      // its process identity and calls into `body`, touching no state that
      // was torn down mid-fork (shared regions/semaphore sets are designed
      // to be fork-safe, see region::Region::about_to_fork).
      let pid = unsafe { libc::fork() };
      if pid == 0 {
        ProcessId::assign_current(id);
        body();
        std::process::exit(0);
      }
      Handle::Forked(pid)
    }
    LaunchMode::Threaded => {
      let handle = std::thread::Builder::new()
        .name(id.name().to_string())
        .spawn(move || {
          ProcessId::assign_current(id);
          body();
        })
        .expect("failed to spawn logical-process thread");
      Handle::Threaded(handle)
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn process_identity_roundtrips() {
    ProcessId::assign_current(ProcessId::Motion);
    assert_eq!(ProcessId::current(), ProcessId::Motion);
    assert_eq!(ProcessId::current().name(), "Motion");
  }

  #[test]
  fn launch_mode_defaults_threaded_and_freezes() {
    // NB: shares process-global OnceLock state with other tests in this
    // binary; only assert monotonicity, not a specific starting value.
    let first = LaunchMode::get();
    LaunchMode::set(match first {
      LaunchMode::Threaded => LaunchMode::Multiprocess,
      LaunchMode::Multiprocess => LaunchMode::Threaded,
    });
    assert_eq!(LaunchMode::get(), first, "launch mode must not change after first read");
  }
}
