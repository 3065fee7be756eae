//! Reference-counted shared memory region (component D).
//!
//! Grounded in `Shared/ReferenceCounter.h`'s add/remove-reference counting
//! and the `shmget`/`shmat`-backed shared-memory pattern shown in the
//! pack's `redis-shm-experiment-semaphore_shm.rs` file (independent
//! local/global refcounts over a System V shared segment). A region is a
//! contiguous byte range reachable under a stable integer key; it carries
//! two reference counts — **global**, visible to every attached process,
//! and **local**, private to the attaching process. The backing storage is
//! released by the OS only once the global count drops to zero.
//!
//! Anything placed inside a region must implement [`ShmSafe`]: plain old
//! data that refers to peers only by index/key, never by pointer, since the
//! bytes are mapped at an independent address in every attaching process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock, Weak};

use log::{error, warn};

use crate::error::{CoreError, Result};

/// Marker for types safe to place inside a shared region: no pointers,
/// `Box`, `Vec`, or `String` — only `#[repr(C)]` plain data and indices.
///
/// # Safety
/// Implementors must guarantee every field is valid to reinterpret at a
/// different base address in a different process (i.e. contains no
/// process-local pointers).
pub unsafe trait ShmSafe: Copy {}

unsafe impl ShmSafe for u8 {}
unsafe impl ShmSafe for u16 {}
unsafe impl ShmSafe for u32 {}
unsafe impl ShmSafe for u64 {}
unsafe impl ShmSafe for i32 {}
unsafe impl ShmSafe for i64 {}
unsafe impl ShmSafe for f32 {}
unsafe impl ShmSafe for f64 {}
unsafe impl ShmSafe for bool {}
unsafe impl<T: ShmSafe, const N: usize> ShmSafe for [T; N] {}

pub type RegionKey = u32;

static MULTIPROCESS: OnceLock<bool> = OnceLock::new();

/// Whether regions are actually backed by OS shared memory (`true`) or by
/// plain process-heap memory (`false`, single-process/test mode). Fixed
/// before any region exists, mirroring the original's "multiprocess flag
/// fixed after first read" rule.
pub fn set_multiprocess(value: bool) {
  if MULTIPROCESS.set(value).is_err() {
    warn!("region::set_multiprocess({value}) ignored: already fixed to {:?}", MULTIPROCESS.get());
  }
}

pub fn is_multiprocess() -> bool {
  *MULTIPROCESS.get_or_init(|| false)
}

static NEXT_ANON_KEY: AtomicU32 = AtomicU32::new(1);

type KeyRegistry = Mutex<HashMap<RegionKey, (Weak<Backing>, Weak<AtomicUsize>)>>;
static BY_KEY: OnceLock<KeyRegistry> = OnceLock::new();

fn by_key() -> &'static KeyRegistry {
  BY_KEY.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Global (cross-process) state backing a region: the global refcount and,
/// when multiprocess, the `shmid`/base pointer the OS gave us.
struct Backing {
  key: RegionKey,
  size: usize,
  global_refs: AtomicU32,
  shmid: Option<libc::c_int>,
  base: *mut u8,
  heap: Option<Box<[u8]>>,
}

// SAFETY: `base` either points into OS shared memory (valid across
// processes by construction) or into `heap`, which we never move out from
// under a live pointer.
unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Backing {
  fn create(key: RegionKey, size: usize) -> Result<Self> {
    if is_multiprocess() {
      // SAFETY: IPC_PRIVATE|IPC_CREAT always returns a fresh segment id on
      // success; size is the caller-supplied byte count.
      let shmid = unsafe { libc::shmget(libc::IPC_PRIVATE, size, libc::IPC_CREAT | 0o600) };
      if shmid < 0 {
        return Err(CoreError::RegionCreate { name: key.to_string(), source: std::io::Error::last_os_error() });
      }
      // SAFETY: shmid was just created above.
      let base = unsafe { libc::shmat(shmid, std::ptr::null(), 0) };
      if base as isize == -1 {
        return Err(CoreError::RegionCreate { name: key.to_string(), source: std::io::Error::last_os_error() });
      }
      Ok(Backing { key, size, global_refs: AtomicU32::new(1), shmid: Some(shmid), base: base as *mut u8, heap: None })
    } else {
      let mut heap = vec![0u8; size].into_boxed_slice();
      let base = heap.as_mut_ptr();
      Ok(Backing { key, size, global_refs: AtomicU32::new(1), shmid: None, base, heap: Some(heap) })
    }
  }
}

impl Drop for Backing {
  fn drop(&mut self) {
    if let Some(shmid) = self.shmid {
      // SAFETY: base was returned by a successful shmat paired with this
      // shmid, and this Backing owns the only attach we made.
      unsafe {
        libc::shmdt(self.base as *const libc::c_void);
        libc::shmctl(shmid, libc::IPC_RMID, std::ptr::null_mut());
      }
    }
  }
}

/// A single process's handle onto a shared region: one local reference.
/// Cloning increments the local refcount; dropping the last clone
/// decrements the global refcount and, if that reaches zero, releases the
/// backing storage.
pub struct Region {
  backing: std::sync::Arc<Backing>,
  local_refs: std::sync::Arc<AtomicUsize>,
}

impl Region {
  /// Creates a brand-new region of `size` bytes under the given key.
  /// Registers the key so other holders in this process can later
  /// [`Region::attach`] to the same backing.
  pub fn create(key: RegionKey, size: usize) -> Result<Self> {
    let backing = std::sync::Arc::new(Backing::create(key, size)?);
    let local_refs = std::sync::Arc::new(AtomicUsize::new(1));
    by_key().lock().unwrap().insert(key, (std::sync::Arc::downgrade(&backing), std::sync::Arc::downgrade(&local_refs)));
    Ok(Region { backing, local_refs })
  }

  /// Creates a region under a freshly allocated key (the original's `new
  /// RCRegion(size)` with no caller-supplied identifier — used for
  /// `MessageQueue::sendMessage(NULL)`'s empty-message case and any other
  /// anonymous allocation).
  pub fn create_anonymous(size: usize) -> Result<Self> {
    Self::create(NEXT_ANON_KEY.fetch_add(1, Ordering::SeqCst), size)
  }

  /// Maps an existing region by key, incrementing only the *local*
  /// reference count. Returns `None` if no region with this key is
  /// currently live in this process.
  pub fn attach(key: RegionKey) -> Option<Self> {
    let (backing, local_refs) = by_key().lock().unwrap().get(&key)?.clone();
    let backing = backing.upgrade()?;
    let local_refs = local_refs.upgrade()?;
    local_refs.fetch_add(1, Ordering::SeqCst);
    Some(Region { backing, local_refs })
  }

  pub fn id(&self) -> RegionKey {
    self.backing.key
  }

  pub fn size(&self) -> usize {
    self.backing.size
  }

  pub fn base(&self) -> *mut u8 {
    self.backing.base
  }

  /// Reads a `ShmSafe` value at byte `offset` within the region.
  ///
  /// # Safety
  /// `offset + size_of::<T>()` must be within `size()`, and the region's
  /// content at that offset must already hold a valid `T`.
  pub unsafe fn read<T: ShmSafe>(&self, offset: usize) -> T {
    debug_assert!(offset + std::mem::size_of::<T>() <= self.size());
    std::ptr::read(self.base().add(offset) as *const T)
  }

  /// Writes a `ShmSafe` value at byte `offset` within the region.
  ///
  /// # Safety
  /// `offset + size_of::<T>()` must be within `size()`.
  pub unsafe fn write<T: ShmSafe>(&self, offset: usize, value: T) {
    debug_assert!(offset + std::mem::size_of::<T>() <= self.size());
    std::ptr::write(self.base().add(offset) as *mut T, value);
  }

  /// Increments the local (in-process) reference count.
  pub fn add_reference(&self) {
    self.local_refs.fetch_add(1, Ordering::SeqCst);
  }

  /// Decrements the local reference count. When it would hit zero, this
  /// consumes one global reference too (mirrors the original's implicit
  /// destructor behavior: the last local holder in a process releases that
  /// process's share of the global count).
  pub fn remove_reference(&self) {
    let prev = self.local_refs.fetch_sub(1, Ordering::SeqCst);
    if prev == 1 {
      self.remove_shared_reference();
    }
  }

  /// Increments the global (cross-process) reference count.
  pub fn add_shared_reference(&self) {
    self.backing.global_refs.fetch_add(1, Ordering::SeqCst);
  }

  /// Decrements the global reference count. If it reaches zero, the
  /// `Backing`'s `Drop` (triggered once the last `Arc<Backing>` clone is
  /// released) frees the OS segment.
  pub fn remove_shared_reference(&self) {
    let prev = self.backing.global_refs.fetch_sub(1, Ordering::SeqCst);
    if prev == 0 {
      error!("Region {} global refcount underflowed", self.id());
      self.backing.global_refs.store(0, Ordering::SeqCst);
    }
  }

  pub fn global_ref_count(&self) -> u32 {
    self.backing.global_refs.load(Ordering::SeqCst)
  }

  pub fn local_ref_count(&self) -> usize {
    self.local_refs.load(Ordering::SeqCst)
  }
}

impl Clone for Region {
  fn clone(&self) -> Self {
    self.add_reference();
    Region { backing: self.backing.clone(), local_refs: self.local_refs.clone() }
  }
}

impl Drop for Region {
  fn drop(&mut self) {
    self.remove_reference();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn local_and_global_refcounts_track_clones() {
    let r = Region::create(1, 64).unwrap();
    assert_eq!(r.local_ref_count(), 1);
    assert_eq!(r.global_ref_count(), 1);
    let r2 = r.clone();
    assert_eq!(r.local_ref_count(), 2);
    drop(r2);
    assert_eq!(r.local_ref_count(), 1);
    assert_eq!(r.global_ref_count(), 1);
  }

  #[test]
  fn read_write_roundtrip() {
    let r = Region::create(2, 16).unwrap();
    unsafe {
      r.write::<u32>(0, 0xdead_beef);
      assert_eq!(r.read::<u32>(0), 0xdead_beef);
    }
  }

  #[test]
  fn attach_shares_backing_and_bumps_local_only() {
    let r = Region::create_anonymous(8).unwrap();
    let key = r.id();
    let global_before = r.global_ref_count();
    let attached = Region::attach(key).expect("region should still be registered");
    assert_eq!(attached.id(), key);
    assert_eq!(r.local_ref_count(), 2);
    assert_eq!(r.global_ref_count(), global_before);
    unsafe {
      r.write::<u32>(0, 7);
      assert_eq!(attached.read::<u32>(0), 7);
    }
  }

  #[test]
  fn attach_unknown_key_returns_none() {
    assert!(Region::attach(RegionKey::MAX).is_none());
  }
}
