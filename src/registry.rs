//! Named directory of currently allocated regions (component E).
//!
//! Grounded in `IPC/RegionRegistry.h`: a fixed-capacity map from a short
//! string name to a region, so a late-arriving process can discover
//! registrations made before it existed. Lookups and mutations are
//! serialised by one [`RecursiveCrossProcMutex`].

use std::collections::HashMap;
use std::sync::Mutex;

use crate::freelist::IndexedFreeList;
use crate::mutex::RecursiveCrossProcMutex;
use crate::process::ProcessId;
use crate::region::{Region, RegionKey};
use crate::semaphore::SemaphoreSet;

pub const NAME_LEN: usize = 31;

#[derive(Clone, Copy)]
struct Entry {
  name: [u8; NAME_LEN + 1],
  key: RegionKey,
}

impl Default for Entry {
  fn default() -> Self {
    Entry { name: [0; NAME_LEN + 1], key: 0 }
  }
}

impl Entry {
  fn new(name: &str, key: RegionKey) -> Self {
    let mut bytes = [0u8; NAME_LEN + 1];
    let truncated = &name.as_bytes()[..name.len().min(NAME_LEN)];
    bytes[..truncated.len()].copy_from_slice(truncated);
    Entry { name: bytes, key }
  }

  fn name_str(&self) -> &str {
    let end = self.name.iter().position(|&b| b == 0).unwrap_or(self.name.len());
    std::str::from_utf8(&self.name[..end]).unwrap_or("")
  }
}

pub type Index = u16;

pub struct RegionRegistry<'a, const CAP: usize> {
  lock: RecursiveCrossProcMutex<'a>,
  avail: Mutex<IndexedFreeList<Entry, Index, CAP>>,
  regions: Mutex<HashMap<RegionKey, Region>>,
}

impl<'a, const CAP: usize> RegionRegistry<'a, CAP> {
  pub fn new(semgr: &'a SemaphoreSet) -> Option<Self> {
    let lock = RecursiveCrossProcMutex::new(semgr, crate::cancel::CancelToken::new())?;
    Some(RegionRegistry {
      lock,
      avail: Mutex::new(IndexedFreeList::new()),
      regions: Mutex::new(HashMap::new()),
    })
  }

  pub fn end(&self) -> Index {
    Index::MAX
  }

  pub fn begin(&self) -> Index {
    self.avail.lock().unwrap().begin()
  }

  pub fn next(&self, it: Index) -> Index {
    self.avail.lock().unwrap().next(it)
  }

  /// Searches for `name`, returning `end()` if not found.
  pub fn find_region(&self, name: &str) -> Index {
    if name.len() > NAME_LEN {
      log::warn!("RegionRegistry::find_region({name}) is too long, max is {NAME_LEN}");
    }
    let _guard = self.lock.lock(ProcessId::current().index() as i64);
    let avail = self.avail.lock().unwrap();
    let mut it = avail.begin();
    while it != avail.end() {
      if avail.get(it).name_str() == name {
        return it;
      }
      it = avail.next(it);
    }
    avail.end()
  }

  /// Registers an already-existing region under `name`. Idempotent if the
  /// same region is re-registered under the same name; returns `end()` on
  /// a conflicting registration.
  pub fn register_region(&self, name: &str, region: &Region) -> Index {
    let _guard = self.lock.lock(ProcessId::current().index() as i64);
    let it = self.find_region(name);
    if it != self.end() {
      let avail = self.avail.lock().unwrap();
      if avail.get(it).key == region.id() {
        return it;
      }
      return self.end();
    }
    let idx = {
      let mut avail = self.avail.lock().unwrap();
      avail.push_back(Entry::new(name, region.id()))
    };
    if idx != self.end() {
      self.regions.lock().unwrap().insert(region.id(), region.clone());
    }
    idx
  }

  /// Creates and registers a new region of `size` bytes, or returns the
  /// previously-registered one if `name` is already taken.
  pub fn register_region_sized(&self, name: &str, size: usize, key: RegionKey) -> Option<Region> {
    let _guard = self.lock.lock(ProcessId::current().index() as i64);
    let it = self.find_region(name);
    if it != self.end() {
      let k = self.avail.lock().unwrap().get(it).key;
      return self.regions.lock().unwrap().get(&k).cloned();
    }
    let region = Region::create(key, size).ok()?;
    let idx = self.avail.lock().unwrap().push_back(Entry::new(name, region.id()));
    if idx == self.end() {
      return None;
    }
    self.regions.lock().unwrap().insert(region.id(), region.clone());
    Some(region)
  }

  /// Attaches a local reference to the region registered at `it`.
  pub fn get(&self, it: Index) -> Option<Region> {
    let _guard = self.lock.lock(ProcessId::current().index() as i64);
    if it == self.end() {
      return None;
    }
    let key = self.avail.lock().unwrap().get(it).key;
    let region = self.regions.lock().unwrap().get(&key).cloned();
    region.inspect(|r| r.add_reference())
  }

  /// Removes the registration at `it`. Does not drop any reference on the
  /// region itself — the registry never claims ownership, it only tracks
  /// names.
  pub fn erase(&self, it: Index) {
    let _guard = self.lock.lock(ProcessId::current().index() as i64);
    let mut avail = self.avail.lock().unwrap();
    if it != avail.end() {
      let key = avail.get(it).key;
      avail.erase(it);
      drop(avail);
      self.regions.lock().unwrap().remove(&key);
    }
  }
}
