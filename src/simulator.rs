//! Top-level orchestrator: clock stepping, data-source advance, motion-hook
//! dispatch, and the command REPL (component L).
//!
//! Grounded in `local/tekkotsu/Simulator.h`/`.cc` and `local/tekkotsu/sim.cc`:
//! the `Simulator` process owns the camera/sensor/timer/motion wake queues,
//! drives `SharedClock` either through a real-time `SyncDataThread` (scale
//! > 0) or a stepping loop (scale < 0), dispatches to `MotionHook`s on
//! runlevel and realtime-regime transitions, and runs the `processCommand`
//! dispatch table read from a command queue or an interactive REPL. The
//! original's `MotionMonitorThread` (a dedicated watchdog recording which
//! hook call is in flight and for how long) is ported as
//! [`SimulatorController::start_watchdog`].

use std::io::{BufRead, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock::{ClockController, SharedClock, NO_NEXT_EVENT};
use crate::config::Document;
use crate::drivers::{DataSource, MotionHook, PidUpdate, NUM_FRAMES, NUM_OUTPUTS};
use crate::process::ProcessId;
use crate::queue::{MessageQueue, OverflowPolicy};
use crate::region::Region;
use crate::runlevel::{Runlevel, RunlevelBarrier};
use crate::semaphore::{SemId, SemaphoreSet};

/// `local/tekkotsu/Simulator.h`'s `CameraQueue_t`/`SensorQueue_t` etc: the
/// capacity figures here are this port's stand-in for the original's
/// config-driven sizing, chosen generously enough to exercise the
/// end-to-end scenarios in `tests/`.
pub type DataQueue<'a> = MessageQueue<'a, 8, 8, 4>;
/// Zero-payload "something happened" queues (`getTimerWakeupID`,
/// `getMotionWakeupID`): `DROP_OLDEST`, since a missed wakeup is
/// superseded by the next one.
pub type WakeQueue<'a> = MessageQueue<'a, 4, 8, 2>;
/// `getCommandQueueID`: one receiver (the controller itself).
pub type CommandQueue<'a> = MessageQueue<'a, 8, 2, 2>;
/// Serialized-event transport, shared with [`crate::event::IpcEventTranslator`].
pub type EventQueue<'a> = MessageQueue<'a, 16, 8, 4>;

/// Exit codes from `§6 Command surface`.
pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_STARTUP_FAILURE: i32 = 1;
pub const EXIT_ARG_PARSE_FAILURE: i32 = 2;

/// Motion-output / PID-update wire decoding lives here rather than in
/// `event.rs` because these two queues never carry an `Event`-framed
/// payload — they're the fixed binary layouts from spec.md §6 ("Motion-output
/// buffer", "Motion-PID buffer").
fn decode_motion_buffer(bytes: &[u8]) -> Option<[[f32; NUM_OUTPUTS]; NUM_FRAMES]> {
  let expected = NUM_FRAMES * NUM_OUTPUTS * 4;
  if bytes.len() < expected {
    warn!("decode_motion_buffer: payload too short ({} < {expected})", bytes.len());
    return None;
  }
  let mut buf = [[0.0f32; NUM_OUTPUTS]; NUM_FRAMES];
  let mut off = 0;
  for frame in buf.iter_mut() {
    for out in frame.iter_mut() {
      *out = LittleEndian::read_f32(&bytes[off..off + 4]);
      off += 4;
    }
  }
  Some(buf)
}

fn encode_motion_buffer(buf: &[[f32; NUM_OUTPUTS]; NUM_FRAMES]) -> Vec<u8> {
  let mut bytes = vec![0u8; NUM_FRAMES * NUM_OUTPUTS * 4];
  let mut off = 0;
  for frame in buf.iter() {
    for out in frame.iter() {
      LittleEndian::write_f32(&mut bytes[off..off + 4], *out);
      off += 4;
    }
  }
  bytes
}

fn decode_pid_updates(bytes: &[u8]) -> Vec<PidUpdate> {
  let mut updates = Vec::new();
  let mut off = 0;
  while off + 16 <= bytes.len() {
    let output_index = LittleEndian::read_u32(&bytes[off..off + 4]);
    let p = LittleEndian::read_f32(&bytes[off + 4..off + 8]);
    let i = LittleEndian::read_f32(&bytes[off + 8..off + 12]);
    let d = LittleEndian::read_f32(&bytes[off + 12..off + 16]);
    updates.push(PidUpdate { output_index, p, i, d });
    off += 16;
  }
  updates
}

fn encode_pid_updates(updates: &[PidUpdate]) -> Vec<u8> {
  let mut bytes = vec![0u8; updates.len() * 16];
  for (k, u) in updates.iter().enumerate() {
    let off = k * 16;
    LittleEndian::write_u32(&mut bytes[off..off + 4], u.output_index);
    LittleEndian::write_f32(&mut bytes[off + 4..off + 8], u.p);
    LittleEndian::write_f32(&mut bytes[off + 8..off + 12], u.i);
    LittleEndian::write_f32(&mut bytes[off + 12..off + 16], u.d);
  }
  bytes
}

/// Full surface from spec.md §4.L/§6. Parsed by [`parse_command`] from one
/// line of text; the original's readline-style parser is out of scope (only
/// a minimal whitespace/quote tokenizer is implemented here, per spec.md §1).
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
  Run,
  Pause,
  Step { count: u32 },
  RunTo { time_ms: u32 },
  RunFor { duration_ms: u32 },
  Advance { duration_ms: u32 },
  Freeze { target: Option<String> },
  Unfreeze { target: Option<String> },
  Reset,
  Load { path: String },
  Save { path: String },
  Print { key: Option<String> },
  Set { path: String, value: String },
  Status,
  New { driver: String, name: String },
  Delete { name: String },
  Post { queue: String, payload: String },
  Msg { text: String },
  Help,
  Quit,
}

/// Minimal whitespace/double-quote tokenizer, matching `sim.cc`'s
/// `parseArgs` (quoted substrings become one token; backslash escapes the
/// quote character inside a quoted token).
fn tokenize(line: &str) -> Vec<String> {
  let mut tokens = Vec::new();
  let mut cur = String::new();
  let mut in_quotes = false;
  let mut chars = line.chars().peekable();
  let mut has_cur = false;
  while let Some(c) = chars.next() {
    match c {
      '"' => {
        in_quotes = !in_quotes;
        has_cur = true;
      }
      '\\' if in_quotes && chars.peek() == Some(&'"') => {
        cur.push('"');
        chars.next();
      }
      c if c.is_whitespace() && !in_quotes => {
        if has_cur {
          tokens.push(std::mem::take(&mut cur));
          has_cur = false;
        }
      }
      c => {
        cur.push(c);
        has_cur = true;
      }
    }
  }
  if has_cur {
    tokens.push(cur);
  }
  tokens
}

/// Parses one command line. Returns `None` for a blank line or unrecognised
/// verb; `apply_command`'s caller is expected to report that back to the
/// REPL.
pub fn parse_command(line: &str) -> Option<Command> {
  let tokens = tokenize(line.trim());
  let (head, rest) = tokens.split_first()?;
  match head.as_str() {
    "run" => Some(Command::Run),
    "pause" => Some(Command::Pause),
    "step" => Some(Command::Step { count: rest.first().and_then(|s| s.parse().ok()).unwrap_or(1) }),
    "runto" => Some(Command::RunTo { time_ms: rest.first()?.parse().ok()? }),
    "runfor" => Some(Command::RunFor { duration_ms: rest.first()?.parse().ok()? }),
    "advance" => Some(Command::Advance { duration_ms: rest.first()?.parse().ok()? }),
    "freeze" => Some(Command::Freeze { target: rest.first().cloned() }),
    "unfreeze" => Some(Command::Unfreeze { target: rest.first().cloned() }),
    "reset" => Some(Command::Reset),
    "load" => Some(Command::Load { path: rest.first()?.clone() }),
    "save" => Some(Command::Save { path: rest.first()?.clone() }),
    "print" => Some(Command::Print { key: rest.first().cloned() }),
    "set" => {
      let kv = rest.first()?;
      let (k, v) = kv.split_once('=')?;
      Some(Command::Set { path: k.to_string(), value: v.to_string() })
    }
    "status" => Some(Command::Status),
    "new" => Some(Command::New { driver: rest.first()?.clone(), name: rest.get(1)?.clone() }),
    "delete" => Some(Command::Delete { name: rest.first()?.clone() }),
    "post" => {
      let queue = rest.first()?.clone();
      let payload = rest.get(1..).map(|s| s.join(" ")).unwrap_or_default();
      Some(Command::Post { queue, payload })
    }
    "msg" => Some(Command::Msg { text: rest.join(" ") }),
    "help" => Some(Command::Help),
    "quit" | "exit" => Some(Command::Quit),
    _ => None,
  }
}

const HELP_TEXT: &str = "run pause step runto runfor advance freeze unfreeze reset load save print set status new delete post msg help quit";

struct Sources {
  vision: Vec<Box<dyn DataSource>>,
  sensor: Vec<Box<dyn DataSource>>,
}

/// The orchestrator itself. Owns every queue and data-source collection the
/// Simulator process is responsible for; `Main`/`Motion`/`Sound` hold their
/// own [`crate::event::IpcEventTranslator`]s and [`crate::receiver::MessageReceiver`]s
/// pointed at the queues this struct exposes as accessors.
pub struct SimulatorController<'a> {
  clock: &'a SharedClock,
  runlevel: &'a RunlevelBarrier<'a>,
  config: Mutex<Document>,

  camera_queue: DataQueue<'a>,
  sensor_queue: DataQueue<'a>,
  timer_wake: WakeQueue<'a>,
  motion_wake: WakeQueue<'a>,
  status_queue: DataQueue<'a>,
  command_queue: CommandQueue<'a>,
  event_queue: EventQueue<'a>,
  motion_out_queue: DataQueue<'a>,
  motion_out_pid_queue: DataQueue<'a>,

  command_rcvr: SemId,
  motion_out_rcvr: SemId,
  motion_out_pid_rcvr: SemId,

  sources: Mutex<Sources>,
  motion_hooks: Mutex<Vec<Arc<dyn MotionHook>>>,

  next_vision_ms: AtomicU32,
  last_vision_sent_ms: AtomicU32,
  last_sensor_sent_ms: AtomicU32,
  frozen: AtomicBool,
  was_realtime: AtomicBool,

  current_hook_call: Mutex<Option<&'static str>>,
  last_hook_activity: Mutex<Instant>,

  cancel: CancelToken,
}

impl<'a> SimulatorController<'a> {
  /// Registers every queue listed in spec.md §4.L and sets the overflow
  /// policies it specifies: wake queues `DropOldest`, status/command `Wait`.
  pub fn new(
    semgr: &'a SemaphoreSet,
    clock: &'a SharedClock,
    runlevel: &'a RunlevelBarrier<'a>,
    config: Document,
  ) -> Option<Self> {
    let camera_queue = DataQueue::new(semgr)?;
    let sensor_queue = DataQueue::new(semgr)?;
    let timer_wake = WakeQueue::new(semgr)?;
    let motion_wake = WakeQueue::new(semgr)?;
    let status_queue = DataQueue::new(semgr)?;
    let command_queue = CommandQueue::new(semgr)?;
    let event_queue = EventQueue::new(semgr)?;
    let motion_out_queue = DataQueue::new(semgr)?;
    let motion_out_pid_queue = DataQueue::new(semgr)?;

    timer_wake.set_overflow_policy(OverflowPolicy::DropOldest);
    motion_wake.set_overflow_policy(OverflowPolicy::DropOldest);
    status_queue.set_overflow_policy(OverflowPolicy::Wait);
    command_queue.set_overflow_policy(OverflowPolicy::Wait);

    let command_rcvr = command_queue.add_receiver();
    let motion_out_rcvr = motion_out_queue.add_receiver();
    let motion_out_pid_rcvr = motion_out_pid_queue.add_receiver();

    Some(SimulatorController {
      clock,
      runlevel,
      config: Mutex::new(config),
      camera_queue,
      sensor_queue,
      timer_wake,
      motion_wake,
      status_queue,
      command_queue,
      event_queue,
      motion_out_queue,
      motion_out_pid_queue,
      command_rcvr,
      motion_out_rcvr,
      motion_out_pid_rcvr,
      sources: Mutex::new(Sources { vision: Vec::new(), sensor: Vec::new() }),
      motion_hooks: Mutex::new(Vec::new()),
      next_vision_ms: AtomicU32::new(NO_NEXT_EVENT),
      last_vision_sent_ms: AtomicU32::new(0),
      last_sensor_sent_ms: AtomicU32::new(0),
      frozen: AtomicBool::new(false),
      was_realtime: AtomicBool::new(false),
      current_hook_call: Mutex::new(None),
      last_hook_activity: Mutex::new(Instant::now()),
      cancel: CancelToken::new(),
    })
  }

  pub fn camera_queue(&self) -> &DataQueue<'a> {
    &self.camera_queue
  }
  pub fn sensor_queue(&self) -> &DataQueue<'a> {
    &self.sensor_queue
  }
  pub fn timer_wake(&self) -> &WakeQueue<'a> {
    &self.timer_wake
  }
  pub fn motion_wake(&self) -> &WakeQueue<'a> {
    &self.motion_wake
  }
  pub fn status_queue(&self) -> &DataQueue<'a> {
    &self.status_queue
  }
  pub fn command_queue(&self) -> &CommandQueue<'a> {
    &self.command_queue
  }
  pub fn event_queue(&self) -> &EventQueue<'a> {
    &self.event_queue
  }
  pub fn motion_out_queue(&self) -> &DataQueue<'a> {
    &self.motion_out_queue
  }
  pub fn motion_out_pid_queue(&self) -> &DataQueue<'a> {
    &self.motion_out_pid_queue
  }

  pub fn add_vision_source(&self, src: Box<dyn DataSource>) {
    self.sources.lock().unwrap().vision.push(src);
  }
  pub fn add_sensor_source(&self, src: Box<dyn DataSource>) {
    self.sources.lock().unwrap().sensor.push(src);
  }

  /// Registers a hook to receive `motion_starting`/`motion_stopping` and
  /// realtime-transition notifications from the Simulator process's own
  /// runlevel handling (the Motion process's own hooks live on
  /// [`crate::motion::MotionExecutor`] instead). Grounded in
  /// `Simulator::registerMotionHook`.
  pub fn register_motion_hook(&self, hook: Arc<dyn MotionHook>) {
    self.motion_hooks.lock().unwrap().push(hook);
  }

  fn dispatch_hooks(&self, name: &'static str, f: impl Fn(&dyn MotionHook)) {
    let hooks = self.motion_hooks.lock().unwrap().clone();
    for hook in hooks.iter() {
      *self.current_hook_call.lock().unwrap() = Some(name);
      *self.last_hook_activity.lock().unwrap() = Instant::now();
      f(hook.as_ref());
      *self.current_hook_call.lock().unwrap() = None;
    }
  }

  /// Advances into `level`, then dispatches the per-transition hook
  /// notifications `Simulator::processRunlevel` fires: `motionStarting()`
  /// entering `Starting`, `motionStopping()` entering `Stopping`.
  pub fn enter_runlevel(&self, level: Runlevel) {
    self.runlevel.enter(level);
    match level {
      Runlevel::Starting => self.dispatch_hooks("motionStarting()", |h| h.motion_starting()),
      Runlevel::Stopping => self.dispatch_hooks("motionStopping()", |h| h.motion_stopping()),
      _ => {}
    }
  }

  /// Fires `entering_realtime`/`leaving_realtime` exactly once per crossing
  /// of the clock's time-scale sign, matching `setMotionEnteringRealtime`/
  /// `setMotionLeavingRealtime`.
  fn poll_realtime_transition(&self) {
    let is_rt = self.clock.time_scale() > 0.0;
    let was = self.was_realtime.swap(is_rt, Ordering::SeqCst);
    if is_rt && !was {
      self.dispatch_hooks("enteringRealtime()", |h| h.entering_realtime());
    } else if !is_rt && was {
      self.dispatch_hooks("leavingRealtime()", |h| h.leaving_realtime());
    }
  }

  /// Watchdog: reports (by polling, not interrupting) when a hook call has
  /// been in flight for more than one second. Grounded in
  /// `Simulator::MotionMonitorThread::runloop`'s `timeout` check.
  pub fn start_watchdog(self: Arc<Self>) -> std::thread::JoinHandle<()>
  where
    Self: Send + Sync + 'static,
  {
    std::thread::Builder::new()
      .name("motionhook-watchdog".to_string())
      .spawn(move || {
        while !self.cancel.is_cancelled() {
          std::thread::sleep(Duration::from_millis(200));
          let current = *self.current_hook_call.lock().unwrap();
          if let Some(name) = current {
            let elapsed = self.last_hook_activity.lock().unwrap().elapsed();
            if elapsed > Duration::from_secs(1) {
              warn!("motion hook appears stuck in {name} ({elapsed:?} elapsed)");
            }
          }
        }
      })
      .unwrap_or_else(|e| {
        warn!("SimulatorController::start_watchdog: failed to spawn thread: {e}");
        std::thread::spawn(|| {})
      })
  }

  pub fn stop(&self) {
    self.cancel.cancel();
  }

  fn post_wake(queue: &WakeQueue<'a>) {
    if let Ok(region) = Region::create_anonymous(0) {
      if let Err(err) = queue.send_message(region) {
        warn!("SimulatorController: failed to post wakeup: {err}");
      }
    }
  }

  fn send_timer_wakeup(&self) {
    Self::post_wake(&self.timer_wake);
  }

  fn send_motion_wakeup(&self) {
    Self::post_wake(&self.motion_wake);
  }

  /// Advances every registered vision source to `t`, posting a frame on
  /// [`Self::camera_queue`] if one is ready and (not frozen). Vision has no
  /// heartbeat concept in spec.md's data model (only Sensors does), so this
  /// only sends when a source actually reports fresh data.
  fn advance_vision(&self, t: u32) {
    if self.frozen.load(Ordering::SeqCst) {
      return;
    }
    let mut sources = self.sources.lock().unwrap();
    for src in sources.vision.iter_mut() {
      if let Some(frame) = src.advance(t) {
        if let Ok(region) = Region::create_anonymous(frame.payload.len()) {
          if !frame.payload.is_empty() {
            unsafe {
              std::ptr::copy_nonoverlapping(frame.payload.as_ptr(), region.base(), frame.payload.len());
            }
          }
          if let Err(err) = self.camera_queue.send_message(region) {
            warn!("SimulatorController::advance_vision: send failed: {err}");
          } else {
            self.last_vision_sent_ms.store(t, Ordering::SeqCst);
          }
        }
      }
    }
  }

  /// Advances every registered sensor source to `t`. A source is sent if it
  /// reports a frame and either the frame is dirty, or the heartbeat period
  /// (`Sensors.Heartbeat`, ms; 0 disables it) has elapsed since the last
  /// send — matching spec.md §4.L "send on their queue only if dirty or if
  /// heartbeat is enabled and the heartbeat period has elapsed".
  fn advance_sensor(&self, t: u32) {
    if self.frozen.load(Ordering::SeqCst) {
      return;
    }
    let heartbeat = self.config.lock().unwrap().sensors.heartbeat;
    let last_sent = self.last_sensor_sent_ms.load(Ordering::SeqCst);
    let heartbeat_due = heartbeat > 0 && t.saturating_sub(last_sent) >= heartbeat;
    let mut sources = self.sources.lock().unwrap();
    for src in sources.sensor.iter_mut() {
      let dirty = src.is_dirty();
      let advanced = src.advance(t);
      if !dirty && !heartbeat_due {
        continue;
      }
      let payload = advanced.map(|f| f.payload).unwrap_or_default();
      if let Ok(region) = Region::create_anonymous(payload.len()) {
        if !payload.is_empty() {
          unsafe {
            std::ptr::copy_nonoverlapping(payload.as_ptr(), region.base(), payload.len());
          }
        }
        if let Err(err) = self.sensor_queue.send_message(region) {
          warn!("SimulatorController::advance_sensor: send failed: {err}");
        } else {
          self.last_sensor_sent_ms.store(t, Ordering::SeqCst);
        }
      }
    }
  }

  /// Drains and applies every command currently sitting in
  /// [`Self::command_queue`]. Returns the decoded commands in arrival order
  /// so a caller (the REPL, or a demo binary) can log/report them.
  fn drain_commands(&self) -> Vec<Command> {
    let mut applied = Vec::new();
    loop {
      let it = self.command_queue.oldest();
      if self.command_queue.is_end(it) {
        break;
      }
      let Some(region) = self.command_queue.read_message(it, self.command_rcvr) else {
        break;
      };
      let bytes = unsafe { std::slice::from_raw_parts(region.base(), region.size()) };
      let text = String::from_utf8_lossy(bytes).trim_end_matches('\0').to_string();
      if let Some(cmd) = parse_command(&text) {
        self.apply_command(&cmd);
        applied.push(cmd);
      } else if !text.trim().is_empty() {
        warn!("SimulatorController: unrecognised command '{text}'");
      }
    }
    applied
  }

  /// Drains motion-output buffers and dispatches them to every registered
  /// motion hook, matching `Simulator::gotMotion` → `updateMotion`.
  fn drain_motion_out(&self) {
    loop {
      let it = self.motion_out_queue.oldest();
      if self.motion_out_queue.is_end(it) {
        break;
      }
      let Some(region) = self.motion_out_queue.read_message(it, self.motion_out_rcvr) else {
        break;
      };
      let bytes = unsafe { std::slice::from_raw_parts(region.base(), region.size()) };
      if let Some(buf) = decode_motion_buffer(bytes) {
        self.dispatch_hooks("motionCheck()", |h| h.motion_check(&buf));
      }
    }
  }

  /// Drains PID updates and dispatches them, matching `Simulator::gotMotionPIDs`
  /// → `updatePIDs`.
  fn drain_motion_out_pids(&self) {
    loop {
      let it = self.motion_out_pid_queue.oldest();
      if self.motion_out_pid_queue.is_end(it) {
        break;
      }
      let Some(region) = self.motion_out_pid_queue.read_message(it, self.motion_out_pid_rcvr) else {
        break;
      };
      let bytes = unsafe { std::slice::from_raw_parts(region.base(), region.size()) };
      let updates = decode_pid_updates(bytes);
      if !updates.is_empty() {
        self.dispatch_hooks("updatePIDs()", |h| h.update_pids(&updates));
      }
    }
  }

  /// Publishes a motion-output buffer (from the Motion process, or a test
  /// harness standing in for it) onto [`Self::motion_out_queue`], encoded
  /// per spec.md §6's wire format.
  pub fn post_motion_output(&self, buf: &[[f32; NUM_OUTPUTS]; NUM_FRAMES]) -> crate::error::Result<()> {
    let bytes = encode_motion_buffer(buf);
    let region = Region::create_anonymous(bytes.len())?;
    if !bytes.is_empty() {
      unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base(), bytes.len()) };
    }
    self.motion_out_queue.send_message(region)
  }

  /// Publishes PID gain updates onto [`Self::motion_out_pid_queue`].
  pub fn post_motion_pid_updates(&self, updates: &[PidUpdate]) -> crate::error::Result<()> {
    let bytes = encode_pid_updates(updates);
    let region = Region::create_anonymous(bytes.len())?;
    if !bytes.is_empty() {
      unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base(), bytes.len()) };
    }
    self.motion_out_pid_queue.send_message(region)
  }

  /// Posts a textual command onto [`Self::command_queue`] (the
  /// cross-process counterpart of `Simulator::sendCommand`, for Main/Motion
  /// processes to reach the Simulator's REPL dispatch without a direct
  /// reference to this controller).
  pub fn send_command(&self, line: &str) -> crate::error::Result<()> {
    let mut bytes = line.as_bytes().to_vec();
    bytes.push(0);
    let region = Region::create_anonymous(bytes.len())?;
    unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), region.base(), bytes.len()) };
    self.command_queue.send_message(region)
  }

  /// One full frame: realtime-transition check, next-event computation,
  /// clock advance (stepped mode only), data-source advance, and draining
  /// of inbound command/motion-output/motion-PID queues. Grounded in
  /// `Simulator::run`'s per-iteration body (`incrementTime`/`getNextFrame`
  /// plus the `STEP_*` dispatch).
  pub fn step_frame(&self) {
    self.poll_realtime_transition();
    self.drain_commands();
    self.drain_motion_out();
    self.drain_motion_out_pids();

    let next_vision = self.next_vision_ms.load(Ordering::SeqCst);
    let next_sensor = self.clock.next_sensor();
    let next_timer = self.clock.next_timer();
    let next_motion = self.clock.next_motion();
    let next = next_vision.min(next_sensor).min(next_timer).min(next_motion);
    if next == NO_NEXT_EVENT {
      return;
    }

    if self.clock.time_scale() < 0.0 {
      self.clock.advance_stepped(next);
    }
    let t = self.clock.get_time(ProcessId::current(), self);

    if next_vision <= t {
      self.advance_vision(t);
    }
    if next_sensor <= t {
      self.advance_sensor(t);
    }
    if next_timer <= t {
      self.send_timer_wakeup();
      self.clock.set_next_timer(NO_NEXT_EVENT);
    }
    if next_motion <= t {
      self.send_motion_wakeup();
      self.clock.set_next_motion(NO_NEXT_EVENT);
    }
  }

  /// Schedules the next vision-source poll (there is no clock-resident hint
  /// for vision, unlike timer/motion/sensor — see `SPEC_FULL.md` §3).
  pub fn schedule_next_vision(&self, t: u32) {
    self.next_vision_ms.store(t, Ordering::SeqCst);
  }

  /// Applies one parsed command, matching `Simulator::processCommand`'s
  /// dispatch table. Returns a short human-readable response, the way the
  /// original's `cmd*` handlers print to the console.
  pub fn apply_command(&self, cmd: &Command) -> String {
    match cmd {
      Command::Run => {
        let speed = self.config.lock().unwrap().speed;
        self.clock.set_time_scale(if speed == 0.0 { 1.0 } else { speed });
        "running".to_string()
      }
      Command::Pause => {
        self.clock.set_time_scale(0.0);
        "paused".to_string()
      }
      Command::Step { count } => {
        self.clock.set_time_scale(-1.0);
        for _ in 0..(*count).max(1) {
          self.step_frame();
        }
        format!("stepped {count} frame(s)")
      }
      Command::RunTo { time_ms } => {
        self.clock.set_auto_pause_time(*time_ms);
        self.clock.set_time_scale(1.0);
        format!("running to {time_ms}ms")
      }
      Command::RunFor { duration_ms } => {
        let now = self.clock.get_time(ProcessId::current(), self);
        self.clock.set_auto_pause_time(now.saturating_add(*duration_ms));
        self.clock.set_time_scale(1.0);
        format!("running for {duration_ms}ms")
      }
      Command::Advance { duration_ms } => {
        let now = self.clock.get_time(ProcessId::current(), self);
        self.clock.set_time_scale(-1.0);
        self.clock.advance_stepped(now.saturating_add(*duration_ms));
        self.step_frame();
        format!("advanced {duration_ms}ms")
      }
      Command::Freeze { target } => {
        self.frozen.store(true, Ordering::SeqCst);
        match target {
          Some(t) => format!("froze {t}"),
          None => "froze all data sources".to_string(),
        }
      }
      Command::Unfreeze { target } => {
        self.frozen.store(false, Ordering::SeqCst);
        match target {
          Some(t) => format!("unfroze {t}"),
          None => "unfroze all data sources".to_string(),
        }
      }
      Command::Reset => {
        self.clock.set_time_scale(0.0);
        self.clock.advance_stepped(0);
        "reset".to_string()
      }
      Command::Load { path } => match Document::load_file(path) {
        Ok(doc) => {
          *self.config.lock().unwrap() = doc;
          format!("loaded {path}")
        }
        Err(err) => format!("load failed: {err}"),
      },
      Command::Save { path } => match self.config.lock().unwrap().save_file(path) {
        Ok(()) => format!("saved {path}"),
        Err(err) => format!("save failed: {err}"),
      },
      Command::Print { key } => match key {
        Some(k) => format!("{k} = <unavailable in this port>"),
        None => format!("{:?}", self.config.lock().unwrap()),
      },
      Command::Set { path, value } => {
        let arg = format!("{path}={value}");
        match self.config.lock().unwrap().apply_override(&arg) {
          Ok(()) => format!("set {path}={value}"),
          Err(err) => format!("set failed: {err}"),
        }
      }
      Command::Status => {
        let t = self.clock.get_time(ProcessId::current(), self);
        format!(
          "t={t}ms scale={} posted(cam={},sen={}) runlevel_running={}",
          self.clock.time_scale(),
          self.camera_queue.messages_sent(),
          self.sensor_queue.messages_sent(),
          self.runlevel.count(Runlevel::Running)
        )
      }
      Command::New { driver, name } => format!("new {driver} {name}: driver registry is out of scope, see DESIGN.md"),
      Command::Delete { name } => format!("delete {name}: driver registry is out of scope, see DESIGN.md"),
      Command::Post { queue, payload } => format!("post to {queue}: '{payload}' (use send_command/post_motion_output directly from code)"),
      Command::Msg { text } => {
        debug!("sim message: {text}");
        format!("msg: {text}")
      }
      Command::Help => HELP_TEXT.to_string(),
      Command::Quit => "quitting".to_string(),
    }
  }

  /// Runs the command REPL until `quit`/EOF: reads one line at a time from
  /// `input`, applies it, and writes the response to `output`. Returns the
  /// exit code spec.md §6 specifies (0 clean shutdown).
  pub fn run_repl<R: BufRead, W: Write>(&self, mut input: R, mut output: W) -> i32 {
    let mut line = String::new();
    loop {
      line.clear();
      let Ok(n) = input.read_line(&mut line) else {
        return EXIT_CLEAN;
      };
      if n == 0 {
        return EXIT_CLEAN;
      }
      let Some(cmd) = parse_command(&line) else {
        if !line.trim().is_empty() {
          let _ = writeln!(output, "unrecognised command: {}", line.trim());
        }
        continue;
      };
      let quitting = cmd == Command::Quit;
      let response = self.apply_command(&cmd);
      let _ = writeln!(output, "{response}");
      if quitting {
        return EXIT_CLEAN;
      }
    }
  }
}

impl<'a> ClockController for SimulatorController<'a> {
  /// In this port every logical process shares one `&SharedClock` reference
  /// (see `DESIGN.md`, "cross-process clock sharing"), so the Simulator can
  /// always pause itself directly rather than relaying through a command —
  /// the original's `Main`/`Motion`-process branch of `get_time()` posting a
  /// pause command is therefore unreachable here, but the hook is kept so a
  /// future multiprocess-with-real-shared-memory clock can wire it in.
  fn on_auto_pause(&self, pid: ProcessId) {
    info!("{:?} observed an autoPause crossing; Simulator pausing", pid);
    self.clock.set_time_scale(0.0);
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::drivers::MotionBuffer;
  use std::sync::atomic::AtomicUsize;

  fn setup() -> (SemaphoreSet, SharedClock) {
    ProcessId::assign_current(ProcessId::Simulator);
    (SemaphoreSet::new(64).unwrap(), SharedClock::new(0, 1.0))
  }

  #[test]
  fn parses_every_documented_command() {
    assert_eq!(parse_command("run"), Some(Command::Run));
    assert_eq!(parse_command("pause"), Some(Command::Pause));
    assert_eq!(parse_command("step 3"), Some(Command::Step { count: 3 }));
    assert_eq!(parse_command("runto 500"), Some(Command::RunTo { time_ms: 500 }));
    assert_eq!(parse_command("set Motion.Verbose=2"), Some(Command::Set { path: "Motion.Verbose".into(), value: "2".into() }));
    assert_eq!(parse_command("quit"), Some(Command::Quit));
    assert_eq!(parse_command(""), None);
    assert_eq!(parse_command("bogus"), None);
  }

  #[test]
  fn tokenizer_honors_quotes() {
    let tokens = tokenize(r#"msg "hello world" next"#);
    assert_eq!(tokens, vec!["msg", "hello world", "next"]);
  }

  #[test]
  fn pause_and_run_drive_the_clock() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();
    sim.apply_command(&Command::Pause);
    assert_eq!(clock.time_scale(), 0.0);
    sim.apply_command(&Command::Run);
    assert_eq!(clock.time_scale(), 1.0);
  }

  #[test]
  fn step_command_advances_stepped_clock() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();
    clock.set_next_timer(10);
    sim.apply_command(&Command::Step { count: 1 });
    assert_eq!(clock.time_scale(), -1.0);
    assert_eq!(sim.timer_wake().messages_sent(), 1);
  }

  #[test]
  fn runlevel_transitions_dispatch_motion_hooks() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();
    runlevel.reserve_created();

    struct CountingHook {
      starts: AtomicUsize,
      stops: AtomicUsize,
    }
    impl MotionHook for CountingHook {
      fn motion_check(&self, _outputs: &MotionBuffer) {}
      fn motion_starting(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
      }
      fn motion_stopping(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
      }
    }
    let hook = Arc::new(CountingHook { starts: AtomicUsize::new(0), stops: AtomicUsize::new(0) });
    sim.register_motion_hook(hook.clone());

    sim.enter_runlevel(Runlevel::Constructing);
    sim.enter_runlevel(Runlevel::Starting);
    assert_eq!(hook.starts.load(Ordering::SeqCst), 1);
    sim.enter_runlevel(Runlevel::Running);
    sim.enter_runlevel(Runlevel::Stopping);
    assert_eq!(hook.stops.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn motion_output_round_trips_to_hooks() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();

    struct RecordingHook {
      last: Mutex<Option<MotionBuffer>>,
    }
    impl MotionHook for RecordingHook {
      fn motion_check(&self, outputs: &MotionBuffer) {
        *self.last.lock().unwrap() = Some(*outputs);
      }
    }
    let hook = Arc::new(RecordingHook { last: Mutex::new(None) });
    sim.register_motion_hook(hook.clone());

    let mut buf = [[0.0f32; NUM_OUTPUTS]; NUM_FRAMES];
    buf[0][3] = 0.75;
    sim.post_motion_output(&buf).unwrap();
    sim.drain_motion_out();
    assert_eq!(hook.last.lock().unwrap().unwrap()[0][3], 0.75);
  }

  #[test]
  fn pid_updates_round_trip_to_hooks() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();

    struct RecordingHook {
      seen: Mutex<Vec<PidUpdate>>,
    }
    impl MotionHook for RecordingHook {
      fn motion_check(&self, _outputs: &MotionBuffer) {}
      fn update_pids(&self, pids: &[PidUpdate]) {
        self.seen.lock().unwrap().extend_from_slice(pids);
      }
    }
    let hook = Arc::new(RecordingHook { seen: Mutex::new(Vec::new()) });
    sim.register_motion_hook(hook.clone());

    sim.post_motion_pid_updates(&[PidUpdate { output_index: 2, p: 1.0, i: 0.1, d: 0.01 }]).unwrap();
    sim.drain_motion_out_pids();
    let seen = hook.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].output_index, 2);
  }

  #[test]
  fn send_command_reaches_queue_and_applies() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();
    sim.send_command("pause").unwrap();
    sim.drain_commands();
    assert_eq!(clock.time_scale(), 0.0);
  }

  #[test]
  fn repl_quits_on_quit_command() {
    let (semgr, clock) = setup();
    let runlevel = RunlevelBarrier::new(&semgr).unwrap();
    let sim = SimulatorController::new(&semgr, &clock, &runlevel, Document::default()).unwrap();
    let input = std::io::Cursor::new(b"status\nquit\n".to_vec());
    let mut output = Vec::new();
    let code = sim.run_repl(input, &mut output);
    assert_eq!(code, EXIT_CLEAN);
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("quitting"));
  }
}
