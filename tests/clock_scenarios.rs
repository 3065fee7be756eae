//! Cross-process `SharedClock` scenarios: a non-Simulator process crossing
//! the auto-pause clamp has to ask the `ClockController` to pause on its
//! behalf, since only the Simulator process owns the motion hooks that react
//! to realtime transitions. The `#[cfg(test)]` unit tests in `src/clock.rs`
//! exercise the Simulator-process path directly; these exercise the
//! notify-the-controller path and a few multi-regime transition sequences.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use test_case::test_case;

use robocore::clock::{ClockController, NullController, SharedClock, NO_AUTO_PAUSE};
use robocore::process::ProcessId;

struct RecordingController {
  pauses: Mutex<Vec<ProcessId>>,
  count: AtomicUsize,
}
impl RecordingController {
  fn new() -> Self {
    RecordingController { pauses: Mutex::new(Vec::new()), count: AtomicUsize::new(0) }
  }
}
impl ClockController for RecordingController {
  fn on_auto_pause(&self, pid: ProcessId) {
    self.count.fetch_add(1, Ordering::SeqCst);
    self.pauses.lock().unwrap().push(pid);
  }
}

#[test_log::test]
fn non_simulator_process_notifies_controller_exactly_once_per_crossing() {
  ProcessId::assign_current(ProcessId::Motion);
  let clock = SharedClock::new(0, 1.0);
  clock.set_auto_pause_time(10);
  clock.set_time_scale(-1.0);
  clock.advance_stepped(50);

  let controller = RecordingController::new();
  let v1 = clock.get_time(ProcessId::Motion, &controller);
  assert_eq!(v1, 10);
  // the crossing notifies the controller, but a non-Simulator process does
  // not flip the shared scale itself -- only the Simulator's own auto-pause
  // branch does that.
  assert_eq!(controller.count.load(Ordering::SeqCst), 1);

  let v2 = clock.get_time(ProcessId::Motion, &controller);
  assert_eq!(v2, 10);
  // already clamped: the two-sample hysteresis suppresses a second
  // notification for the same crossing.
  assert_eq!(controller.count.load(Ordering::SeqCst), 1);
  assert_eq!(controller.pauses.lock().unwrap().as_slice(), &[ProcessId::Motion]);
}

#[test_log::test]
fn clamp_releases_once_auto_pause_is_cleared() {
  ProcessId::assign_current(ProcessId::Simulator);
  let clock = SharedClock::new(0, 1.0);
  clock.set_auto_pause_time(10);
  clock.set_time_scale(-1.0);
  clock.advance_stepped(15);
  assert_eq!(clock.get_time(ProcessId::Simulator, &NullController), 10);
  assert_eq!(clock.time_scale(), 0.0);

  clock.set_auto_pause_time(NO_AUTO_PAUSE);
  clock.set_time_scale(-1.0);
  clock.advance_stepped(20);
  assert_eq!(clock.get_time(ProcessId::Simulator, &NullController), 20);
}

#[test_case(1.0, 0.0, -1.0; "realtime to paused to stepped")]
#[test_case(-1.0, 1.0, 0.0; "stepped to realtime to paused")]
#[test_log::test]
fn switching_between_all_three_regimes_never_panics_and_stays_non_negative(first: f64, second: f64, third: f64) {
  ProcessId::assign_current(ProcessId::Main);
  let clock = SharedClock::new(0, first);
  clock.advance_stepped(5);
  let a = clock.get_time(ProcessId::Main, &NullController);

  clock.set_time_scale(second);
  let b = clock.get_time(ProcessId::Main, &NullController);

  clock.set_time_scale(third);
  clock.advance_stepped(b.max(a));
  let c = clock.get_time(ProcessId::Main, &NullController);

  assert!(a <= Millis::MAX && b <= Millis::MAX && c <= Millis::MAX);
}

type Millis = robocore::clock::Millis;

#[test_log::test]
fn next_event_is_the_earliest_of_the_three_hints() {
  ProcessId::assign_current(ProcessId::Main);
  let clock = SharedClock::new(0, 1.0);
  assert_eq!(clock.next_event(), robocore::clock::NO_NEXT_EVENT);

  clock.set_next_timer(200);
  clock.set_next_motion(50);
  clock.set_next_sensor(120);
  assert_eq!(clock.next_event(), 50);

  clock.set_next_motion(robocore::clock::NO_NEXT_EVENT);
  assert_eq!(clock.next_event(), 120);
}
