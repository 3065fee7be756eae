//! Crate-wide error type.
//!
//! Most of the hot-path operations in this crate follow the original
//! Tekkotsu IPC design and report failure through a sentinel value (an
//! "end" index, an invalid semaphore id) rather than `Result`, because the
//! caller is expected to check inline without paying for unwinding. Places
//! where failure can only be reported by propagating upward — region
//! creation, semaphore set construction, the `THROW_BAD_ALLOC` overflow
//! policy — use `CoreError`.

use thiserror::Error;

/// Errors that cross an API boundary as a `Result` rather than a sentinel.
#[derive(Debug, Error)]
pub enum CoreError {
  /// The OS refused to create or attach a shared memory region.
  #[error("shared memory region '{name}' could not be created: {source}")]
  RegionCreate {
    name: String,
    #[source]
    source: std::io::Error,
  },

  /// A region key was looked up and nothing is attached to it.
  #[error("no shared region is registered under key {0}")]
  RegionNotFound(u32),

  /// The OS semaphore set could not be allocated at all, even after the
  /// binary-search fallback in `SemaphoreSet::new`.
  #[error("could not allocate any System V semaphore set (requested {requested})")]
  SemaphoreSetUnavailable { requested: usize },

  /// A blocking semaphore operation was configured with `InterruptPolicy::Throw`
  /// and a signal interrupted the underlying syscall.
  #[error("semaphore operation on counter {0} was interrupted and the counter's policy is Throw")]
  Interrupted(u32),

  /// `MessageQueue::send` with `OverflowPolicy::ThrowBadAlloc` hit a full queue.
  #[error("message queue is full and the overflow policy is ThrowBadAlloc")]
  QueueFull,

  /// The queue has been closed via `MessageQueue::close` and rejects new sends.
  #[error("message queue is closed")]
  QueueClosed,

  /// A `SemaphoreSet` or region registry has observed an OS-level fault
  /// (the underlying set/segment vanished) and is now a diagnostic no-op.
  #[error("operation attempted on a semaphore set / region that already had a fault")]
  HadFault,

  /// Configuration file could not be parsed.
  #[error("failed to parse configuration file {path}: {source}")]
  ConfigParse {
    path: String,
    #[source]
    source: serde_json::Error,
  },

  /// A `Key.Path=Value` command-line override did not parse.
  #[error("malformed configuration override '{0}', expected Key.Path=Value")]
  ConfigOverride(String),

  /// Wraps a bare I/O failure (reading a config file, etc).
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;
