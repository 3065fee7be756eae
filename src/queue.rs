//! Bounded message queue transporting shared regions between processes
//! (component F) — the hardest component in this crate.
//!
//! Grounded in `IPC/MessageQueue.h`. Every registered receiver observes
//! every posted message exactly once; a message's shared region is released
//! the moment the last receiver (or the last-to-depart receiver, via
//! `remove_receiver`'s retroactive forgiveness) has seen it. Rust's
//! ownership model replaces most of the original's manual
//! `AddReference`/`RemoveReference` bookkeeping: `read_message`/
//! `peek_message` simply return an owned [`Region`] clone that the caller
//! drops (or keeps) as it pleases, in place of the original's "caller
//! inherits a reference, call removeReference when done" contract.
//!
//! The original's `sendMessage(rcr, autoDereference)` boolean is replaced by
//! plain Rust move-vs-clone at the call site: pass `region` to keep no
//! handle afterward (equivalent to `autoDereference=true`), or
//! `region.clone()` to keep using it (equivalent to `autoDereference=false`).
//! See `DESIGN.md` for this resolution.

use std::sync::Mutex;
use std::time::Duration;

use log::warn;

use crate::error::{CoreError, Result};
use crate::freelist::IndexedFreeList;
use crate::mutex::RecursiveCrossProcMutex;
use crate::process::ProcessId;
use crate::region::Region;
use crate::semaphore::{SemId, SemaphoreSet};

/// Stable per-message index, reused once every receiver has marked a message
/// read. Use [`MessageQueue::get_message_sn`] for a never-reused identifier.
pub type EntryIndex = u16;

/// How a full queue handles an incoming `send_message`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
  /// Pop the oldest unread entry, releasing its region, then enqueue.
  DropOldest,
  /// Drop the incoming message; the queue is left unchanged.
  DropNewest,
  /// Release the queue lock, sleep a coarse granularity, retry.
  Wait,
  /// Surface `CoreError::QueueFull` to the caller.
  ThrowBadAlloc,
}

impl Default for OverflowPolicy {
  fn default() -> Self {
    OverflowPolicy::ThrowBadAlloc
  }
}

/// Per-process hook letting a process filter (or veto) its own outbound
/// messages before they're posted. Mirrors `MessageQueueBase::MessageFilter`:
/// behavioral dispatch via a trait object rather than a deep class
/// hierarchy.
pub trait MessageFilter: Send + Sync {
  /// Return `false` to drop the message before it's posted.
  fn filter_send_request(&self, region: &Region) -> bool;
}


struct Entry<const R: usize> {
  region: Region,
  sn: u32,
  read_flags: [bool; R],
  num_read: usize,
}

impl<const R: usize> Entry<R> {
  fn new(sn: u32, region: Region) -> Self {
    Entry { region, sn, read_flags: [false; R], num_read: 0 }
  }
}

struct State<const CAP: usize, const R: usize, const S: usize> {
  entries: IndexedFreeList<Entry<R>, EntryIndex, CAP>,
  receivers: IndexedFreeList<SemId, EntryIndex, R>,
  senders: IndexedFreeList<SemId, EntryIndex, S>,
  filters: [Option<Box<dyn MessageFilter>>; crate::process::ProcessId::NUM_PROCESSES],
  closed: bool,
  overflow_policy: OverflowPolicy,
  report_droppings: bool,
  posted: u32,
  retired: u32,
}

impl<const CAP: usize, const R: usize, const S: usize> Drop for State<CAP, R, S> {
  fn drop(&mut self) {
    // Mirrors the original destructor: every entry still in the queue holds
    // one outstanding shared (global) reference from the post that's never
    // been retired; release it explicitly before the entry's own Region
    // handle drops (which releases the local reference).
    let mut it = self.entries.begin();
    while it != self.entries.end() {
      self.entries.get(it).region.remove_shared_reference();
      it = self.entries.next(it);
    }
  }
}

/// A bounded, N-way-read-tracked queue of shared regions. `CAP` is the
/// maximum number of unread entries, `R` the maximum number of receivers,
/// `S` the maximum number of read-status listeners.
pub struct MessageQueue<'a, const CAP: usize, const R: usize, const S: usize> {
  semgr: &'a SemaphoreSet,
  crossproc: RecursiveCrossProcMutex<'a>,
  state: Mutex<State<CAP, R, S>>,
  wait_granularity: Duration,
}

impl<'a, const CAP: usize, const R: usize, const S: usize> MessageQueue<'a, CAP, R, S> {
  pub fn new(semgr: &'a SemaphoreSet) -> Option<Self> {
    let crossproc = RecursiveCrossProcMutex::new(semgr, crate::cancel::CancelToken::new())?;
    Some(MessageQueue {
      semgr,
      crossproc,
      state: Mutex::new(State {
        entries: IndexedFreeList::new(),
        receivers: IndexedFreeList::new(),
        senders: IndexedFreeList::new(),
        filters: Default::default(),
        closed: false,
        overflow_policy: OverflowPolicy::default(),
        report_droppings: false,
        posted: 0,
        retired: 0,
      }),
      wait_granularity: Duration::from_millis(75),
    })
  }

  fn current_pid(&self) -> i64 {
    ProcessId::current().index() as i64
  }

  pub fn end(&self) -> EntryIndex {
    EntryIndex::MAX
  }

  pub fn invalid_sem(&self) -> SemId {
    self.semgr.invalid()
  }

  /// The semaphore set backing this queue's receiver/sender wakeups. Used
  /// by [`crate::receiver::MessageReceiver`] to block on and drain its
  /// subscription counter directly.
  pub fn semaphore_set(&self) -> &'a SemaphoreSet {
    self.semgr
  }

  pub fn set_overflow_policy(&self, policy: OverflowPolicy) {
    self.state.lock().unwrap().overflow_policy = policy;
  }

  pub fn overflow_policy(&self) -> OverflowPolicy {
    self.state.lock().unwrap().overflow_policy
  }

  pub fn set_report_droppings(&self, report: bool) {
    self.state.lock().unwrap().report_droppings = report;
  }

  pub fn report_droppings(&self) -> bool {
    self.state.lock().unwrap().report_droppings
  }

  pub fn messages_sent(&self) -> u32 {
    self.state.lock().unwrap().posted
  }

  pub fn messages_read(&self) -> u32 {
    self.state.lock().unwrap().retired
  }

  pub fn messages_unread(&self) -> u32 {
    let st = self.state.lock().unwrap();
    st.posted - st.retired
  }

  pub fn num_receivers(&self) -> usize {
    self.state.lock().unwrap().receivers.size()
  }

  pub fn add_message_filter(&self, filter: Box<dyn MessageFilter>) {
    self.state.lock().unwrap().filters[ProcessId::current().index()] = Some(filter);
  }

  pub fn remove_message_filter(&self) {
    self.state.lock().unwrap().filters[ProcessId::current().index()] = None;
  }

  /// Registers a fresh receiver slot and returns its semaphore id, or
  /// `invalid_sem()` if the semaphore manager or this queue's receiver
  /// table is exhausted.
  pub fn add_receiver(&self) -> SemId {
    let _g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();
    let sem = self.semgr.get_semaphore();
    if sem == self.semgr.invalid() {
      warn!("MessageQueue::add_receiver: semaphore manager exhausted");
      return sem;
    }
    if st.receivers.push_back(sem) == st.receivers.end() {
      warn!("MessageQueue::add_receiver: receiver capacity ({R}) exhausted");
      self.semgr.release_semaphore(sem);
      return self.semgr.invalid();
    }
    sem
  }

  fn lookup_receiver(st: &State<CAP, R, S>, sem: SemId) -> EntryIndex {
    let mut it = st.receivers.begin();
    while it != st.receivers.end() {
      if *st.receivers.get(it) == sem {
        return it;
      }
      it = st.receivers.next(it);
    }
    st.receivers.end()
  }

  /// Removes a receiver. Any entry the receiver had not yet read is
  /// "forgiven": its read-mark count is left untouched (there was nothing
  /// to revoke), but the receiver no longer counts toward `numReceivers`,
  /// so entries now fully read by the remaining receivers retire
  /// immediately.
  pub fn remove_receiver(&self, sem: SemId) {
    let _g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();
    let rcvr_id = Self::lookup_receiver(&st, sem);
    if rcvr_id == st.receivers.end() {
      warn!("MessageQueue::remove_receiver: {sem} is not a registered receiver");
      return;
    }
    st.receivers.erase(rcvr_id);
    self.semgr.release_semaphore(sem);

    let remaining = st.receivers.size();
    let mut to_retire = Vec::new();
    let mut it = st.entries.begin();
    while it != st.entries.end() {
      let entry = st.entries.get_mut(it);
      if entry.read_flags[rcvr_id as usize] {
        entry.read_flags[rcvr_id as usize] = false;
        entry.num_read -= 1;
      } else if entry.num_read == remaining {
        to_retire.push(it);
      }
      it = st.entries.next(it);
    }
    for idx in to_retire {
      st.entries.get(idx).region.remove_shared_reference();
      st.entries.erase(idx);
      st.retired += 1;
    }
    self.raise_status_listeners(&st);
  }

  /// Registers a semaphore that should be raised whenever an entry retires:
  /// symmetric to receivers, for senders wanting backpressure feedback.
  pub fn add_read_status_listener(&self) -> SemId {
    let _g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();
    let sem = self.semgr.get_semaphore();
    if sem == self.semgr.invalid() {
      warn!("MessageQueue::add_read_status_listener: semaphore manager exhausted");
      return sem;
    }
    if st.senders.push_back(sem) == st.senders.end() {
      warn!("MessageQueue::add_read_status_listener: sender capacity ({S}) exhausted");
      self.semgr.release_semaphore(sem);
      return self.semgr.invalid();
    }
    sem
  }

  pub fn remove_read_status_listener(&self, sem: SemId) {
    let _g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();
    let mut it = st.senders.begin();
    while it != st.senders.end() {
      if *st.senders.get(it) == sem {
        st.senders.erase(it);
        self.semgr.release_semaphore(sem);
        return;
      }
      it = st.senders.next(it);
    }
  }

  fn raise_status_listeners(&self, st: &State<CAP, R, S>) {
    let mut it = st.senders.begin();
    while it != st.senders.end() {
      self.semgr.raise(*st.senders.get(it), 1);
      it = st.senders.next(it);
    }
  }

  fn raise_receivers(&self, st: &State<CAP, R, S>) {
    let mut it = st.receivers.begin();
    while it != st.receivers.end() {
      self.semgr.raise(*st.receivers.get(it), 1);
      it = st.receivers.next(it);
    }
  }

  /// Posts `region` to every currently registered receiver. Ownership of
  /// `region` transfers into the call; pass `region.clone()` at the call
  /// site to keep using your own handle afterward (replaces the original's
  /// `autoDereference` flag, see module docs).
  pub fn send_message(&self, region: Region) -> Result<()> {
    let mut g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();

    let pid = ProcessId::current().index();
    if let Some(filter) = &st.filters[pid] {
      if !filter.filter_send_request(&region) {
        return Ok(());
      }
    }

    if st.receivers.empty() {
      // no one to deliver to; counts as "read by all zero readers".
      st.retired += 1;
      self.raise_status_listeners(&st);
      return Ok(());
    }

    if st.closed {
      if st.report_droppings {
        warn!("MessageQueue::send_message: dropping message, queue is closed");
      }
      return Ok(());
    }

    loop {
      if st.entries.size() < CAP {
        break;
      }
      match st.overflow_policy {
        OverflowPolicy::DropOldest => {
          if st.report_droppings {
            warn!("MessageQueue::send_message: queue full, dropping oldest unread entry");
          }
          let oldest = st.entries.begin();
          st.entries.get(oldest).region.remove_shared_reference();
          st.entries.pop_front();
          st.retired += 1;
          break;
        }
        OverflowPolicy::DropNewest => {
          if st.report_droppings {
            warn!("MessageQueue::send_message: queue full, dropping newest (incoming) message");
          }
          return Ok(());
        }
        OverflowPolicy::Wait => {
          if st.report_droppings {
            warn!("MessageQueue::send_message: queue full, waiting for readers to catch up");
          }
          // Give up the cross-process lock too, not just the inner state
          // mutex: a receiver's read_message also takes `crossproc`, so
          // holding it across the sleep would deadlock the very readers
          // we're waiting on. This is the one place the lock is
          // voluntarily released mid-operation (spec.md §4.F, §5).
          drop(st);
          drop(g);
          std::thread::sleep(self.wait_granularity);
          g = self.crossproc.lock(self.current_pid());
          st = self.state.lock().unwrap();
          // policy may have changed while we slept; loop re-evaluates it.
          continue;
        }
        OverflowPolicy::ThrowBadAlloc => {
          if st.report_droppings {
            warn!("MessageQueue::send_message: queue full, overflow policy is ThrowBadAlloc");
          }
          return Err(CoreError::QueueFull);
        }
      }
    }

    region.add_shared_reference();
    let sn = st.posted;
    st.posted += 1;
    if st.entries.push_back(Entry::new(sn, region)) == st.entries.end() {
      // overflow policy above guarantees room; this would indicate a logic bug.
      return Err(CoreError::QueueFull);
    }
    self.raise_receivers(&st);
    Ok(())
  }

  /// Reads `entry`, marking it read by `rcvr`. If that makes every current
  /// receiver have read it, the entry retires. Returns the region (an owned
  /// clone the caller may hold onto independent of the entry's lifetime) or
  /// `None` if `entry`/`rcvr` is unknown.
  pub fn read_message(&self, entry: EntryIndex, rcvr: SemId) -> Option<Region> {
    let _g = self.crossproc.lock(self.current_pid());
    let mut st = self.state.lock().unwrap();
    if entry == st.entries.end() {
      return None;
    }
    let region = st.entries.get(entry).region.clone();
    let rcvr_id = Self::lookup_receiver(&st, rcvr);
    if rcvr_id == st.receivers.end() {
      warn!("MessageQueue::read_message: {rcvr} is not a registered receiver");
      return Some(region);
    }
    let e = st.entries.get_mut(entry);
    if e.read_flags[rcvr_id as usize] {
      warn!("MessageQueue::read_message: receiver {rcvr} re-read an entry it already marked read");
      return Some(region);
    }
    e.read_flags[rcvr_id as usize] = true;
    e.num_read += 1;
    if e.num_read == st.receivers.size() {
      st.entries.get(entry).region.remove_shared_reference();
      st.entries.erase(entry);
      st.retired += 1;
      self.raise_status_listeners(&st);
    }
    Some(region)
  }

  /// Returns `entry`'s region without changing any read-tracking state.
  pub fn peek_message(&self, entry: EntryIndex) -> Option<Region> {
    let _g = self.crossproc.lock(self.current_pid());
    let st = self.state.lock().unwrap();
    if entry == st.entries.end() {
      return None;
    }
    Some(st.entries.get(entry).region.clone())
  }

  /// Like `read_message` but without returning the region.
  pub fn mark_read(&self, entry: EntryIndex, rcvr: SemId) {
    self.read_message(entry, rcvr);
  }

  pub fn get_message_sn(&self, entry: EntryIndex) -> u32 {
    let _g = self.crossproc.lock(self.current_pid());
    let st = self.state.lock().unwrap();
    st.entries.get(entry).sn
  }

  pub fn oldest(&self) -> EntryIndex {
    let _g = self.crossproc.lock(self.current_pid());
    self.state.lock().unwrap().entries.begin()
  }

  pub fn newest(&self) -> EntryIndex {
    let _g = self.crossproc.lock(self.current_pid());
    let st = self.state.lock().unwrap();
    st.entries.prev(st.entries.end())
  }

  pub fn newer(&self, it: EntryIndex) -> EntryIndex {
    let _g = self.crossproc.lock(self.current_pid());
    self.state.lock().unwrap().entries.next(it)
  }

  pub fn older(&self, it: EntryIndex) -> EntryIndex {
    let _g = self.crossproc.lock(self.current_pid());
    self.state.lock().unwrap().entries.prev(it)
  }

  pub fn is_end(&self, it: EntryIndex) -> bool {
    it == self.end()
  }

  pub fn close(&self) {
    let _g = self.crossproc.lock(self.current_pid());
    self.state.lock().unwrap().closed = true;
  }

  pub fn is_closed(&self) -> bool {
    self.state.lock().unwrap().closed
  }
}
