//! Shared process-wide simulator clock (component I).
//!
//! Grounded in `local/tekkotsu/SharedGlobals.h`/`.cc` (`get_time`,
//! `getTimeScale`, `autoPauseTime`): a single clock value is read by every
//! process through one indirection. Three regimes, selected by a signed
//! `time_scale`:
//!
//! - `time_scale > 0`: real-time, scaled. `getTime()` derives the value from
//!   wall-clock boot age, with an offset recomputed on every regime
//!   transition so the value never jumps.
//! - `time_scale == 0`: paused. `getTime()` returns the frozen value.
//! - `time_scale < 0`: stepped/full-speed. `getTime()` returns the explicit
//!   `simulator_time` field; the controller is responsible for advancing it.
//!
//! The original distinguishes "previous" from "previous previous" time scale
//! (`lastTimeScale` vs. a locally-scoped copy taken at entry to `get_time`)
//! purely to avoid re-issuing the auto-pause command every single read once
//! the clock is already sitting at the clamp. This port keeps that
//! two-sample hysteresis (see `DESIGN.md`, "clock regime hysteresis").

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::time::Instant;

/// Milliseconds since some fixed epoch. The original uses `unsigned int`
/// milliseconds; this port keeps the same width since wraparound behavior
/// (~49 days of continuous runtime) is part of what the original ships.
pub type Millis = u32;

/// What an auto-pause crossing, or an explicit `timeScale=0` command issued
/// from a non-Simulator process, should do. Mirrors the original's
/// Simulator-process-vs-everyone-else branch in `get_time()`: the Simulator
/// process can flip its own `timeScale` directly, but every other process
/// has to ask it to, since only the Simulator owns the motion hooks that
/// react to realtime transitions.
pub trait ClockController: Send + Sync {
  /// Called when the clock would cross `auto_pause_time`. `pid` identifies
  /// which logical process observed the crossing.
  fn on_auto_pause(&self, pid: crate::process::ProcessId);
}

/// No-op controller for clocks that don't need cross-process pause
/// notification (unit tests, the Simulator process itself, which pauses
/// itself directly).
pub struct NullController;
impl ClockController for NullController {
  fn on_auto_pause(&self, _pid: crate::process::ProcessId) {}
}

pub struct SharedClock {
  boot: Instant,
  /// Fixed-point: `timeScale * 1000`, so fractional scales (e.g. 0.5x) are
  /// representable without floats in a word that can be read lock-free.
  time_scale_milli: AtomicI64,
  /// `lastTimeScale` from the original: the scale as of the previous read.
  last_time_scale_milli: AtomicI64,
  time_offset_ms: AtomicI64,
  simulator_time_ms: AtomicU32,
  auto_pause_time_ms: AtomicU32,
  next_timer_ms: AtomicU32,
  next_motion_ms: AtomicU32,
  next_sensor_ms: AtomicU32,
}

pub const NO_AUTO_PAUSE: Millis = Millis::MAX;
pub const NO_NEXT_EVENT: Millis = Millis::MAX;

impl SharedClock {
  /// `initial_time_ms` mirrors the `InitialTime` config key;
  /// `initial_scale` mirrors `Speed` (0 = paused, <0 = stepped).
  pub fn new(initial_time_ms: Millis, initial_scale: f64) -> Self {
    let scale_milli = (initial_scale * 1000.0).round() as i64;
    SharedClock {
      boot: Instant::now(),
      time_scale_milli: AtomicI64::new(scale_milli),
      last_time_scale_milli: AtomicI64::new(0),
      time_offset_ms: AtomicI64::new(-(initial_time_ms as i64)),
      simulator_time_ms: AtomicU32::new(initial_time_ms),
      auto_pause_time_ms: AtomicU32::new(NO_AUTO_PAUSE),
      next_timer_ms: AtomicU32::new(NO_NEXT_EVENT),
      next_motion_ms: AtomicU32::new(NO_NEXT_EVENT),
      next_sensor_ms: AtomicU32::new(NO_NEXT_EVENT),
    }
  }

  fn boot_age_ms(&self) -> i64 {
    self.boot.elapsed().as_millis() as i64
  }

  pub fn time_scale(&self) -> f64 {
    self.time_scale_milli.load(Ordering::SeqCst) as f64 / 1000.0
  }

  /// Sets the time scale. Does not itself recompute the offset; that
  /// happens lazily on the next `get_time()`, matching the original (which
  /// reacts to a `plist` listener callback on the next read, not
  /// synchronously on assignment).
  pub fn set_time_scale(&self, scale: f64) {
    self.time_scale_milli.store((scale * 1000.0).round() as i64, Ordering::SeqCst);
  }

  pub fn set_auto_pause_time(&self, t: Millis) {
    self.auto_pause_time_ms.store(t, Ordering::SeqCst);
  }

  pub fn auto_pause_time(&self) -> Millis {
    self.auto_pause_time_ms.load(Ordering::SeqCst)
  }

  pub fn set_next_timer(&self, t: Millis) {
    self.next_timer_ms.store(t, Ordering::SeqCst);
  }
  pub fn next_timer(&self) -> Millis {
    self.next_timer_ms.load(Ordering::SeqCst)
  }
  pub fn set_next_motion(&self, t: Millis) {
    self.next_motion_ms.store(t, Ordering::SeqCst);
  }
  pub fn next_motion(&self) -> Millis {
    self.next_motion_ms.load(Ordering::SeqCst)
  }
  pub fn set_next_sensor(&self, t: Millis) {
    self.next_sensor_ms.store(t, Ordering::SeqCst);
  }
  pub fn next_sensor(&self) -> Millis {
    self.next_sensor_ms.load(Ordering::SeqCst)
  }

  /// Earliest of the three next-event hints, or `NO_NEXT_EVENT` if none are
  /// set. Used by `SimulatorController`'s per-frame scheduling.
  pub fn next_event(&self) -> Millis {
    self.next_timer().min(self.next_motion()).min(self.next_sensor())
  }

  /// In stepped mode (`time_scale < 0`), the controller drives the clock
  /// forward explicitly instead of letting it read off wall time.
  pub fn advance_stepped(&self, to: Millis) {
    self.simulator_time_ms.store(to, Ordering::SeqCst);
  }

  /// Returns the current simulator time in ms, detecting and reacting to
  /// regime transitions exactly as `SharedGlobals::get_time()` does.
  pub fn get_time(&self, pid: crate::process::ProcessId, controller: &dyn ClockController) -> Millis {
    // local snapshot taken at entry, used only to suppress repeated
    // auto-pause notifications once we're already sitting at the clamp.
    let last_last_scale_milli = self.last_time_scale_milli.load(Ordering::SeqCst);
    let scale_milli = self.time_scale_milli.load(Ordering::SeqCst);

    if scale_milli <= 0 {
      self.last_time_scale_milli.store(scale_milli, Ordering::SeqCst);
    } else {
      let last_scale_milli = self.last_time_scale_milli.swap(scale_milli, Ordering::SeqCst);
      let boot_age = self.boot_age_ms();
      if last_scale_milli <= 0 {
        // non-realtime -> realtime: reset offset so value doesn't jump.
        let cur = self.simulator_time_ms.load(Ordering::SeqCst) as i64;
        let offset = boot_age * scale_milli / 1000 - cur;
        self.time_offset_ms.store(offset, Ordering::SeqCst);
      } else if last_scale_milli != scale_milli {
        // scale changed while already realtime: recompute from the old
        // scale first, then rebase for the new one.
        let cur = self.real_time_value(boot_age, last_scale_milli);
        self.simulator_time_ms.store(cur as u32, Ordering::SeqCst);
        let offset = boot_age * scale_milli / 1000 - cur;
        self.time_offset_ms.store(offset, Ordering::SeqCst);
      } else {
        let cur = self.real_time_value(boot_age, scale_milli);
        self.simulator_time_ms.store(cur.max(0) as u32, Ordering::SeqCst);
      }
    }

    let auto_pause = self.auto_pause_time_ms.load(Ordering::SeqCst);
    let mut value = self.simulator_time_ms.load(Ordering::SeqCst);
    if value > auto_pause {
      value = auto_pause;
      self.simulator_time_ms.store(value, Ordering::SeqCst);
      if pid == crate::process::ProcessId::Simulator {
        if scale_milli != 0 {
          self.time_scale_milli.store(0, Ordering::SeqCst);
        }
      } else if last_last_scale_milli != 0 {
        self.last_time_scale_milli.store(0, Ordering::SeqCst);
        controller.on_auto_pause(pid);
      }
    }
    value
  }

  fn real_time_value(&self, boot_age_ms: i64, scale_milli: i64) -> i64 {
    let offset = self.time_offset_ms.load(Ordering::SeqCst);
    boot_age_ms * scale_milli / 1000 - offset
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::process::ProcessId;

  #[test]
  fn realtime_reads_are_nondecreasing() {
    ProcessId::assign_current(ProcessId::Main);
    let clock = SharedClock::new(0, 1.0);
    let t0 = clock.get_time(ProcessId::Main, &NullController);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let t1 = clock.get_time(ProcessId::Main, &NullController);
    assert!(t1 >= t0);
  }

  #[test]
  fn pause_freezes_value() {
    ProcessId::assign_current(ProcessId::Main);
    let clock = SharedClock::new(0, 1.0);
    std::thread::sleep(std::time::Duration::from_millis(5));
    let before = clock.get_time(ProcessId::Main, &NullController);
    clock.set_time_scale(0.0);
    let t0 = clock.get_time(ProcessId::Main, &NullController);
    std::thread::sleep(std::time::Duration::from_millis(20));
    let t1 = clock.get_time(ProcessId::Main, &NullController);
    assert_eq!(t0, t1);
    assert!(t0 >= before);
  }

  #[test]
  fn stepped_mode_uses_explicit_time() {
    ProcessId::assign_current(ProcessId::Main);
    let clock = SharedClock::new(0, 1.0);
    clock.set_time_scale(0.0);
    clock.get_time(ProcessId::Main, &NullController);
    clock.set_time_scale(-1.0);
    clock.advance_stepped(100);
    assert_eq!(clock.get_time(ProcessId::Main, &NullController), 100);
    clock.advance_stepped(250);
    assert_eq!(clock.get_time(ProcessId::Main, &NullController), 250);
  }

  #[test]
  fn auto_pause_clamps_exactly_once() {
    ProcessId::assign_current(ProcessId::Simulator);
    let clock = SharedClock::new(0, 1.0);
    clock.set_auto_pause_time(10);
    clock.set_time_scale(-1.0);
    clock.advance_stepped(15);
    let v = clock.get_time(ProcessId::Simulator, &NullController);
    assert_eq!(v, 10);
    assert_eq!(clock.time_scale(), 0.0);
    clock.advance_stepped(20);
    let v2 = clock.get_time(ProcessId::Simulator, &NullController);
    assert_eq!(v2, 10);
  }
}
