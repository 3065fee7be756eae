//! End-to-end `MessageQueue` scenarios spanning several receivers, overflow
//! policies, and read-status listeners together — the cross-module cases the
//! `#[cfg(test)]` unit tests inside `src/queue.rs` don't each cover on their
//! own.

use test_case::test_case;

use robocore::process::ProcessId;
use robocore::queue::{MessageQueue, OverflowPolicy};
use robocore::region::Region;
use robocore::semaphore::SemaphoreSet;

fn setup() {
  ProcessId::assign_current(ProcessId::Main);
}

fn region_with(byte: u8) -> Region {
  let region = Region::create_anonymous(1).unwrap();
  unsafe { region.write::<u8>(0, byte) };
  region
}

#[test_log::test]
fn two_receivers_each_see_the_full_stream_independently() {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  let queue: MessageQueue<8, 4, 4> = MessageQueue::new(&semgr).unwrap();
  let fast = queue.add_receiver();
  let slow = queue.add_receiver();

  for i in 0..5u8 {
    queue.send_message(region_with(i)).unwrap();
  }

  // the fast receiver drains everything right away...
  let mut fast_seen = Vec::new();
  let mut it = queue.oldest();
  while !queue.is_end(it) {
    let region = queue.read_message(it, fast).unwrap();
    fast_seen.push(unsafe { region.read::<u8>(0) });
    it = queue.newer(it);
  }
  assert_eq!(fast_seen, vec![0, 1, 2, 3, 4]);
  // ...but nothing retires until the slow receiver catches up too.
  assert_eq!(queue.messages_read(), 0);
  assert!(!queue.is_end(queue.oldest()));

  let mut slow_seen = Vec::new();
  let mut it = queue.oldest();
  while !queue.is_end(it) {
    let next = queue.newer(it);
    let region = queue.read_message(it, slow).unwrap();
    slow_seen.push(unsafe { region.read::<u8>(0) });
    it = next;
  }
  assert_eq!(slow_seen, vec![0, 1, 2, 3, 4]);
  assert_eq!(queue.messages_read(), 5);
  assert!(queue.is_end(queue.oldest()));
}

#[test_log::test]
fn read_status_listener_is_raised_once_per_retirement() {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  let queue: MessageQueue<4, 4, 4> = MessageQueue::new(&semgr).unwrap();
  let rcvr = queue.add_receiver();
  let listener = queue.add_read_status_listener();
  assert_ne!(listener, queue.invalid_sem());

  queue.send_message(region_with(1)).unwrap();
  assert_eq!(semgr.get_value(listener), 0);
  queue.mark_read(queue.oldest(), rcvr);
  assert_eq!(semgr.get_value(listener), 1);

  queue.remove_read_status_listener(listener);
  queue.send_message(region_with(2)).unwrap();
  queue.mark_read(queue.oldest(), rcvr);
  // listener was removed, so it should not have been raised a second time.
  assert_eq!(semgr.get_value(listener), 1);
}

#[test_log::test]
fn drop_newest_under_pressure_leaves_the_queue_unchanged() {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  let queue: MessageQueue<3, 4, 4> = MessageQueue::new(&semgr).unwrap();
  queue.add_receiver();
  queue.set_overflow_policy(OverflowPolicy::DropNewest);

  for i in 0..3u8 {
    queue.send_message(region_with(i)).unwrap();
  }
  // queue is now at capacity; this send should be silently dropped.
  queue.send_message(region_with(99)).unwrap();

  let mut sns = Vec::new();
  let mut it = queue.oldest();
  while !queue.is_end(it) {
    sns.push(queue.get_message_sn(it));
    it = queue.newer(it);
  }
  assert_eq!(sns, vec![0, 1, 2]);
  assert_eq!(queue.messages_sent(), 3);
}

#[test_log::test]
fn throw_bad_alloc_surfaces_queue_full_and_leaves_the_queue_intact() {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  let queue: MessageQueue<2, 4, 4> = MessageQueue::new(&semgr).unwrap();
  queue.add_receiver();
  assert_eq!(queue.overflow_policy(), OverflowPolicy::ThrowBadAlloc);

  queue.send_message(region_with(1)).unwrap();
  queue.send_message(region_with(2)).unwrap();
  let err = queue.send_message(region_with(3)).unwrap_err();
  assert_eq!(err.to_string(), robocore::error::CoreError::QueueFull.to_string());
  assert_eq!(queue.messages_sent(), 2);
}

#[test_case(4, 6, vec![2, 3, 4, 5]; "capacity four survives the last four")]
#[test_case(1, 6, vec![5]; "capacity one keeps only the newest")]
#[test_case(8, 6, vec![0, 1, 2, 3, 4, 5]; "capacity larger than volume drops nothing")]
#[test_log::test]
fn drop_oldest_capacity_sweep(capacity_probe: usize, sent: u32, expected_surviving_sns: Vec<u32>) {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  // capacity is a const generic, so we dispatch on the handful of shapes this
  // sweep actually exercises rather than trying to parameterize it directly.
  let surviving = match capacity_probe {
    1 => run_drop_oldest_sweep::<1>(&semgr, sent),
    4 => run_drop_oldest_sweep::<4>(&semgr, sent),
    8 => run_drop_oldest_sweep::<8>(&semgr, sent),
    other => panic!("add a capacity arm for {other}"),
  };
  assert_eq!(surviving, expected_surviving_sns);
}

fn run_drop_oldest_sweep<const CAP: usize>(semgr: &SemaphoreSet, sent: u32) -> Vec<u32> {
  let queue: MessageQueue<CAP, 4, 4> = MessageQueue::new(semgr).unwrap();
  queue.add_receiver();
  queue.set_overflow_policy(OverflowPolicy::DropOldest);
  for i in 0..sent {
    queue.send_message(region_with(i as u8)).ok();
  }
  let mut sns = Vec::new();
  let mut it = queue.oldest();
  while !queue.is_end(it) {
    sns.push(queue.get_message_sn(it));
    it = queue.newer(it);
  }
  sns
}

#[test_log::test]
fn closed_queue_silently_drops_new_sends_but_keeps_existing_entries_readable() {
  setup();
  let semgr = SemaphoreSet::new(32).unwrap();
  let queue: MessageQueue<4, 4, 4> = MessageQueue::new(&semgr).unwrap();
  let rcvr = queue.add_receiver();
  queue.send_message(region_with(1)).unwrap();
  queue.close();
  assert!(queue.is_closed());

  queue.send_message(region_with(2)).unwrap();
  assert_eq!(queue.messages_sent(), 1);

  let region = queue.read_message(queue.oldest(), rcvr).unwrap();
  assert_eq!(unsafe { region.read::<u8>(0) }, 1);
}
