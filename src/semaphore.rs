//! System V semaphore set management (component B).
//!
//! Grounded in `IPC/SemaphoreManager.h`: owns one OS semaphore set of up to
//! [`MAX_SEM`] counters, hands counter ids out of an [`IndexedFreeList`], and
//! reserves two counters for its own bookkeeping (`mysem`, a lock for
//! allocation operations; `refc`, a cross-process reference count released
//! when the last holder exits).

use std::sync::Mutex;

use log::{error, warn};

use crate::freelist::IndexedFreeList;

/// Mirrors `SYSTEM_MAX_SEM`: ideally `SEMMSL`, but that isn't portably
/// discoverable at compile time, so a conservative fixed cap is used
/// instead.
pub const MAX_SEM: usize = 250;

pub type SemId = u16;

/// How a blocking semaphore operation reacts to `EINTR`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPolicy {
  CancelVerbose,
  Cancel,
  RetryVerbose,
  Retry,
  ThrowVerbose,
  Throw,
  Exit,
}

impl Default for InterruptPolicy {
  fn default() -> Self {
    InterruptPolicy::Retry
  }
}

/// A handed-out counter that was never allocated, or whose set has since
/// faulted.
pub const INVALID_SEM: SemId = SemId::MAX;

/// Owns one System V semaphore set. Two of `sems_t::MAX_ENTRIES` are
/// reserved internally (see module docs); `getSemaphore`/`releaseSemaphore`
/// hand out the rest.
pub struct SemaphoreSet {
  inner: Mutex<Inner>,
}

struct Inner {
  sems: IndexedFreeList<(), SemId, MAX_SEM>,
  nsem: usize,
  semid: libc::c_int,
  mysem: SemId,
  refc: SemId,
  intr_policy: Vec<InterruptPolicy>,
  faulted: bool,
}

impl SemaphoreSet {
  /// Allocates a semaphore set with room for `num_request` user-visible
  /// counters (2 more are reserved internally). Falls back to the largest
  /// feasible count if the OS refuses the full request.
  pub fn new(num_request: usize) -> crate::error::Result<Self> {
    let requested_total = (num_request + 2).min(MAX_SEM);
    let (semid, nsem) = Self::allocate_with_fallback(requested_total)?;

    let mut intr_policy = Vec::with_capacity(MAX_SEM);
    intr_policy.resize(MAX_SEM, InterruptPolicy::default());

    let mut inner = Inner {
      sems: IndexedFreeList::new(),
      nsem,
      semid,
      mysem: 0,
      refc: 0,
      intr_policy,
      faulted: false,
    };

    // Reserve the first two real counters for ourselves.
    inner.mysem = inner.sems.push_back(()).min(nsem as SemId - 1);
    inner.refc = inner.sems.push_back(()).min(nsem as SemId - 1);
    set_value(semid, inner.mysem as libc::c_int, 1);
    set_value(semid, inner.refc as libc::c_int, 1);

    Ok(SemaphoreSet { inner: Mutex::new(inner) })
  }

  fn allocate_with_fallback(requested: usize) -> crate::error::Result<(libc::c_int, usize)> {
    let mut n = requested;
    loop {
      // SAFETY: semget with IPC_PRIVATE never touches user memory; n is
      // bounded by MAX_SEM above.
      let id = unsafe { libc::semget(libc::IPC_PRIVATE, n as libc::c_int, 0o600) };
      if id >= 0 {
        return Ok((id, n));
      }
      if n <= 3 {
        return Err(crate::error::CoreError::SemaphoreSetUnavailable { requested });
      }
      warn!("semget({n}) failed, retrying with a smaller semaphore set");
      n /= 2;
    }
  }

  /// Pre-increments the set's internal reference count; call this
  /// immediately before `fork()` so the child is already a legitimate
  /// holder of the set.
  pub fn about_to_fork(&self) {
    let inner = self.inner.lock().unwrap();
    if inner.faulted {
      return;
    }
    sem_op(inner.semid, inner.refc as libc::c_int, 1, false).ok();
  }

  /// Unconditionally releases the underlying OS set. Only safe to call
  /// from a signal handler / emergency shutdown path, since it does not
  /// check other holders.
  pub fn fault_shutdown(&self) {
    let mut inner = self.inner.lock().unwrap();
    if inner.faulted {
      return;
    }
    // SAFETY: semid was obtained from a successful semget above.
    unsafe {
      libc::semctl(inner.semid, 0, libc::IPC_RMID);
    }
    inner.faulted = true;
  }

  pub fn had_fault(&self) -> bool {
    self.inner.lock().unwrap().faulted
  }

  /// Returns the number of user-visible counters still available.
  pub fn available(&self) -> usize {
    let inner = self.inner.lock().unwrap();
    inner.nsem.saturating_sub(2).saturating_sub(inner.sems.size().saturating_sub(2))
  }

  pub fn invalid(&self) -> SemId {
    INVALID_SEM
  }

  /// Hands out a fresh counter, initialised to zero. Returns `invalid()`
  /// if the set has no room left or has faulted.
  pub fn get_semaphore(&self) -> SemId {
    let mut inner = self.inner.lock().unwrap();
    if inner.faulted {
      return INVALID_SEM;
    }
    if inner.sems.size() >= inner.nsem {
      warn!("semaphore set exhausted ({} in use)", inner.sems.size());
      return INVALID_SEM;
    }
    let id = inner.sems.push_back(());
    if id != inner.sems.end() {
      set_value(inner.semid, id as libc::c_int, 0);
    }
    id
  }

  /// Marks a semaphore as available for reassignment.
  pub fn release_semaphore(&self, id: SemId) {
    let mut inner = self.inner.lock().unwrap();
    if inner.faulted || id == INVALID_SEM {
      return;
    }
    inner.sems.erase(id);
  }

  pub fn get_interrupt_policy(&self, id: SemId) -> InterruptPolicy {
    self.inner.lock().unwrap().intr_policy[id as usize]
  }

  pub fn set_interrupt_policy(&self, id: SemId, policy: InterruptPolicy) {
    self.inner.lock().unwrap().intr_policy[id as usize] = policy;
  }

  /// Subtracts `x` from the counter, optionally blocking until it would
  /// not go negative. Honors the counter's interrupt policy on `EINTR`.
  pub fn lower(&self, id: SemId, x: u32, block: bool) -> bool {
    let (semid, policy, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.intr_policy[id as usize], inner.faulted)
    };
    if faulted {
      return false;
    }
    loop {
      match sem_op(semid, id as libc::c_int, -(x as i32), block) {
        Ok(ok) => return ok,
        Err(()) => match apply_interrupt_policy(policy, "lower") {
          InterruptAction::Retry => continue,
          InterruptAction::GiveUp => return false,
        },
      }
    }
  }

  /// Adds `x` to the counter. Never blocks.
  pub fn raise(&self, id: SemId, x: u32) {
    let (semid, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.faulted)
    };
    if faulted {
      return;
    }
    sem_op(semid, id as libc::c_int, x as i32, false).ok();
  }

  pub fn get_value(&self, id: SemId) -> i32 {
    let inner = self.inner.lock().unwrap();
    if inner.faulted {
      return 0;
    }
    // SAFETY: semid/id are within the bounds of the allocated set.
    unsafe { libc::semctl(inner.semid, id as libc::c_int, libc::GETVAL) }
  }

  pub fn set_value(&self, id: SemId, x: i32) {
    let inner = self.inner.lock().unwrap();
    if inner.faulted {
      return;
    }
    set_value(inner.semid, id as libc::c_int, x);
  }

  pub fn get_num_zero_blockers(&self, id: SemId) -> i32 {
    let inner = self.inner.lock().unwrap();
    if inner.faulted {
      return 0;
    }
    // SAFETY: semid/id are within the bounds of the allocated set.
    unsafe { libc::semctl(inner.semid, id as libc::c_int, libc::GETZCNT) }
  }

  /// Blocks (optionally) until the counter's value is zero.
  pub fn test_zero(&self, id: SemId, block: bool) -> bool {
    let (semid, policy, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.intr_policy[id as usize], inner.faulted)
    };
    if faulted {
      return false;
    }
    loop {
      match sem_op(semid, id as libc::c_int, 0, block) {
        Ok(ok) => return ok,
        Err(()) => match apply_interrupt_policy(policy, "testZero") {
          InterruptAction::Retry => continue,
          InterruptAction::GiveUp => return false,
        },
      }
    }
  }

  /// Tests for zero then adds `x`, as close to atomically as a single
  /// batched `semop` call allows. On cancellation after the op succeeded,
  /// the caller is expected to roll the add back itself (this port has no
  /// true async thread cancellation, see `cancel::CancelToken`).
  pub fn test_zero_add(&self, id: SemId, x: i32, testblock: bool, addblock: bool) -> bool {
    let (semid, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.faulted)
    };
    if faulted {
      return false;
    }
    let ops = [
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: 0,
        sem_flg: if testblock { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: x as libc::c_short,
        sem_flg: if addblock { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
    ];
    sem_op_batch(semid, &ops).unwrap_or(false)
  }

  /// Adds `x` then tests for zero.
  pub fn add_testzero(&self, id: SemId, x: i32, addblock: bool, testblock: bool) -> bool {
    let (semid, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.faulted)
    };
    if faulted {
      return false;
    }
    let ops = [
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: x as libc::c_short,
        sem_flg: if addblock { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: 0,
        sem_flg: if testblock { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
    ];
    sem_op_batch(semid, &ops).unwrap_or(false)
  }

  /// Adds `x1`, tests for zero, adds `x2`, as one batched op.
  pub fn add_testzero_add(
    &self,
    id: SemId,
    x1: i32,
    x2: i32,
    add1block: bool,
    testblock: bool,
    add2block: bool,
  ) -> bool {
    let (semid, faulted) = {
      let inner = self.inner.lock().unwrap();
      (inner.semid, inner.faulted)
    };
    if faulted {
      return false;
    }
    let ops = [
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: x1 as libc::c_short,
        sem_flg: if add1block { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: 0,
        sem_flg: if testblock { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
      libc::sembuf {
        sem_num: id as libc::c_ushort,
        sem_op: x2 as libc::c_short,
        sem_flg: if add2block { 0 } else { libc::IPC_NOWAIT as libc::c_short },
      },
    ];
    sem_op_batch(semid, &ops).unwrap_or(false)
  }
}

impl Drop for SemaphoreSet {
  fn drop(&mut self) {
    let inner = self.inner.get_mut().unwrap();
    if inner.faulted {
      return;
    }
    sem_op(inner.semid, inner.refc as libc::c_int, -1, false).ok();
    // SAFETY: semid was obtained from a successful semget in `new`.
    let remaining = unsafe { libc::semctl(inner.semid, inner.refc as libc::c_int, libc::GETVAL) };
    if remaining <= 0 {
      unsafe {
        libc::semctl(inner.semid, 0, libc::IPC_RMID);
      }
    }
  }
}

fn set_value(semid: libc::c_int, num: libc::c_int, val: i32) {
  // SAFETY: semid/num are within the bounds of an allocated set; libc's
  // semctl(SETVAL) reads `val` through the variadic union argument.
  unsafe {
    libc::semctl(semid, num, libc::SETVAL, val);
  }
}

enum InterruptAction {
  Retry,
  GiveUp,
}

fn apply_interrupt_policy(policy: InterruptPolicy, op: &str) -> InterruptAction {
  match policy {
    InterruptPolicy::CancelVerbose => {
      warn!("semaphore operation '{op}' cancelled by signal");
      InterruptAction::GiveUp
    }
    InterruptPolicy::Cancel => InterruptAction::GiveUp,
    InterruptPolicy::RetryVerbose => {
      warn!("semaphore operation '{op}' interrupted, retrying");
      InterruptAction::Retry
    }
    InterruptPolicy::Retry => InterruptAction::Retry,
    InterruptPolicy::ThrowVerbose => {
      error!("semaphore operation '{op}' interrupted, policy is throw");
      InterruptAction::GiveUp
    }
    InterruptPolicy::Throw => InterruptAction::GiveUp,
    InterruptPolicy::Exit => {
      error!("semaphore operation '{op}' interrupted, exiting per policy");
      std::process::exit(1);
    }
  }
}

/// Runs a single-op `semop` batch. `Ok(true)` if it succeeded, `Ok(false)`
/// if it would have blocked and `block` was false, `Err(())` on `EINTR`.
fn sem_op(semid: libc::c_int, num: libc::c_int, delta: i32, block: bool) -> Result<bool, ()> {
  let op = libc::sembuf {
    sem_num: num as libc::c_ushort,
    sem_op: delta as libc::c_short,
    sem_flg: if block { 0 } else { libc::IPC_NOWAIT as libc::c_short },
  };
  match sem_op_batch(semid, &[op]) {
    Ok(ok) => Ok(ok),
    Err(eintr) => {
      if eintr {
        Err(())
      } else {
        Ok(false)
      }
    }
  }
}

/// Runs a multi-op `semop` batch atomically. Returns `Ok(true)` on success,
/// `Ok(false)` on `EAGAIN` (would-block, non-blocking op), `Err(true)` on
/// `EINTR`.
fn sem_op_batch(semid: libc::c_int, ops: &[libc::sembuf]) -> Result<bool, bool> {
  loop {
    // SAFETY: ops.len() matches the buffer passed and semid came from a
    // successful semget.
    let rc = unsafe { libc::semop(semid, ops.as_ptr() as *mut libc::sembuf, ops.len()) };
    if rc == 0 {
      return Ok(true);
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    if errno == libc::EAGAIN {
      return Ok(false);
    }
    if errno == libc::EINTR {
      return Err(true);
    }
    return Ok(false);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocate_and_release_counters() {
    let set = SemaphoreSet::new(4).expect("semaphore set should allocate");
    let a = set.get_semaphore();
    assert_ne!(a, set.invalid());
    set.set_value(a, 3);
    assert_eq!(set.get_value(a), 3);
    set.release_semaphore(a);
  }

  #[test]
  fn raise_then_lower_nonblocking() {
    let set = SemaphoreSet::new(4).expect("semaphore set should allocate");
    let a = set.get_semaphore();
    set.raise(a, 2);
    assert!(set.lower(a, 1, false));
    assert_eq!(set.get_value(a), 1);
    set.release_semaphore(a);
  }
}
